//! The host the orchestrator drives.
//!
//! Everything that touches host-global state outside the file system goes
//! through [`Host`]: package managers, the database engine, the process
//! supervisor, nginx, port lookups and HTTP probes. A run owns its host
//! exclusively and calls it from a single task.

pub mod system;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::deploy::fsm::Step;
use crate::errors::DeployError;
use crate::filesys::file::tail_lines;

/// Default bound on any external command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Lines of output attached to a failure
pub const DIAGNOSTIC_LINES: usize = 40;

/// An external command.
///
/// Environment and stdin may carry secrets, so neither appears in `Debug`
/// or `Display`.
#[derive(Clone)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// `bash -c <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("bash").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program and arguments joined by spaces
    pub fn line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Value of an environment entry
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line())
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("line", &self.line())
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct Output {
    /// Exit code; `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }

    /// Tail of the combined output, for error reports
    pub fn diagnostics(&self) -> String {
        tail_lines(&self.combined(), DIAGNOSTIC_LINES)
    }
}

/// Result of a bounded manual start
#[derive(Debug, Clone)]
pub struct TrialStart {
    /// The process (or a child of it) bound the port before the deadline
    pub bound: bool,

    /// Exit code if the process exited on its own
    pub exited: Option<Option<i32>>,

    /// Everything the process printed
    pub output: String,
}

/// A process listening on a TCP port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    /// `None` when the listener's pid is not visible to us
    pub pid: Option<u32>,
    pub command: String,
}

impl fmt::Display for PortOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "pid {} ({})", pid, self.command),
            None => write!(f, "unknown pid ({})", self.command),
        }
    }
}

/// Host operations
#[async_trait]
pub trait Host: Send + Sync {
    /// Run a command to completion. Expiry of `cmd.timeout` kills the
    /// command and yields [`DeployError::Timeout`].
    async fn exec(&self, cmd: &Cmd) -> Result<Output, DeployError>;

    /// Start `cmd` outside any supervisor and wait until it binds `port`,
    /// exits, or `timeout` passes. The process is always terminated before
    /// this returns.
    async fn trial_start(
        &self,
        cmd: &Cmd,
        port: u16,
        timeout: Duration,
    ) -> Result<TrialStart, DeployError>;

    /// The process listening on `port`, if any
    async fn port_owner(&self, port: u16) -> Result<Option<PortOwner>, DeployError>;

    /// Whether `pid` is `root` or one of its descendants
    fn in_process_tree(&self, pid: u32, root: u32) -> bool;

    /// Total physical memory
    fn total_memory_mib(&self) -> u64;

    /// GET `url`, optionally with a `Host` header; returns the status code
    async fn http_probe(
        &self,
        url: &str,
        host_header: Option<&str>,
        timeout: Duration,
    ) -> Result<u16, DeployError>;
}

/// Run `cmd` and turn a non-zero exit into a fatal failure of `step`
pub async fn exec_checked(
    host: &dyn Host,
    cmd: &Cmd,
    step: Step,
) -> Result<Output, DeployError> {
    let output = host.exec(cmd).await.map_err(|e| e.in_step(step))?;
    if !output.success() {
        return Err(DeployError::fatal(
            step,
            format!("`{}` exited with {}", cmd, describe_status(output.status)),
            output.diagnostics(),
        ));
    }
    Ok(output)
}

pub fn describe_status(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}
