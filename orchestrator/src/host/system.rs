//! Host implementation backed by the local machine

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid as GroupId;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::errors::DeployError;
use crate::host::{Cmd, Host, Output, PortOwner, TrialStart};

/// Interval between port checks during a manual start
const TRIAL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Grace period for a killed process to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs commands on this machine
#[derive(Debug, Default)]
pub struct SystemHost;

impl SystemHost {
    pub fn new() -> Self {
        Self
    }

    fn command(cmd: &Cmd) -> Command {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true)
            .process_group(0);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }
        command
    }

    fn spawn(cmd: &Cmd) -> Result<Child, DeployError> {
        Self::command(cmd).spawn().map_err(|e| DeployError::SpawnError {
            command: cmd.line(),
            reason: e.to_string(),
        })
    }
}

/// SIGKILL every process in the group led by `leader`.
///
/// Each command runs in its own group, so this reaches whatever a shell
/// script started, not just the shell.
fn kill_group(leader: Option<u32>) {
    let Some(pgid) = leader.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(GroupId::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!("Unable to kill process group {}: {}", pgid, e),
    }
}

/// Kills the command's group when dropped before the command finished,
/// which covers both a timeout and a cancelled run.
struct GroupGuard {
    leader: Option<u32>,
}

impl GroupGuard {
    fn finished(mut self) {
        self.leader = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        kill_group(self.leader.take());
    }
}

#[async_trait]
impl Host for SystemHost {
    async fn exec(&self, cmd: &Cmd) -> Result<Output, DeployError> {
        debug!("exec: {}", cmd);
        let mut child = Self::spawn(cmd)?;
        let guard = GroupGuard { leader: child.id() };

        let run = async {
            if let (Some(input), Some(mut stdin)) = (cmd.stdin.as_ref(), child.stdin.take()) {
                stdin.write_all(input.as_bytes()).await?;
                drop(stdin);
            }
            Ok::<_, std::io::Error>(child.wait_with_output().await?)
        };

        let finished = timeout(cmd.timeout, run).await;
        if finished.is_ok() {
            // Daemons the command left behind (pm2) are not ours to kill
            guard.finished();
        }
        match finished {
            Ok(Ok(output)) => Ok(Output {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(DeployError::SpawnError {
                command: cmd.line(),
                reason: e.to_string(),
            }),
            Err(_) => Err(DeployError::Timeout {
                command: cmd.line(),
                timeout: cmd.timeout,
            }),
        }
    }

    async fn trial_start(
        &self,
        cmd: &Cmd,
        port: u16,
        limit: Duration,
    ) -> Result<TrialStart, DeployError> {
        debug!("manual start: {} (port {}, {:?})", cmd, port, limit);
        let mut child = Self::spawn(cmd)?;
        let root = child.id();
        let guard = GroupGuard { leader: root };
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + limit;
        let mut bound = false;
        let mut exited = None;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exited = Some(status.code());
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Unable to poll manual start: {}", e);
                    break;
                }
            }

            if let (Some(owner), Some(root)) = (self.port_owner(port).await?, root) {
                if owner.pid.is_some_and(|pid| self.in_process_tree(pid, root)) {
                    bound = true;
                    break;
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            sleep(TRIAL_POLL_INTERVAL).await;
        }

        // Whatever the app forked goes too, even when the app itself exited
        drop(guard);
        if exited.is_none() {
            let _ = child.start_kill();
            let _ = timeout(REAP_TIMEOUT, child.wait()).await;
        }

        let mut output = String::new();
        for handle in [stdout, stderr].into_iter().flatten() {
            if let Ok(Ok(text)) = timeout(REAP_TIMEOUT, handle).await {
                output.push_str(&text);
            }
        }

        Ok(TrialStart {
            bound,
            exited,
            output,
        })
    }

    async fn port_owner(&self, port: u16) -> Result<Option<PortOwner>, DeployError> {
        let cmd = Cmd::new("ss")
            .args(["-H", "-t", "-l", "-n", "-p", "sport", "="])
            .arg(format!(":{}", port))
            .timeout(Duration::from_secs(5));
        let output = self.exec(&cmd).await?;
        if !output.success() {
            return Err(DeployError::SpawnError {
                command: cmd.line(),
                reason: output.diagnostics(),
            });
        }
        Ok(parse_ss_listeners(&output.stdout).into_iter().next())
    }

    fn in_process_tree(&self, pid: u32, root: u32) -> bool {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut current = Some(Pid::from_u32(pid));
        // Bounded walk; pid reuse can in theory produce a cycle.
        for _ in 0..64 {
            match current {
                Some(p) if p.as_u32() == root => return true,
                Some(p) => current = sys.process(p).and_then(|proc_| proc_.parent()),
                None => return false,
            }
        }
        false
    }

    fn total_memory_mib(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory() / 1024 / 1024
    }

    async fn http_probe(
        &self,
        url: &str,
        host_header: Option<&str>,
        limit: Duration,
    ) -> Result<u16, DeployError> {
        let client = reqwest::Client::builder()
            .timeout(limit)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let mut request = client.get(url);
        if let Some(host) = host_header {
            request = request.header(reqwest::header::HOST, host);
        }
        let response = request.send().await?;
        Ok(response.status().as_u16())
    }
}

fn drain<R>(mut reader: R) -> JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Parse `ss -H -t -l -n -p` output into listeners.
///
/// A line looks like
/// `LISTEN 0 511 0.0.0.0:5000 0.0.0.0:* users:(("node",pid=1234,fd=18))`;
/// the `users:` column is absent when the caller cannot see the owner.
pub fn parse_ss_listeners(text: &str) -> Vec<PortOwner> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let users = line.split("users:((").nth(1).unwrap_or("");
            let command = users
                .split('"')
                .nth(1)
                .unwrap_or("unknown")
                .to_string();
            let pid = users
                .split("pid=")
                .nth(1)
                .and_then(|rest| {
                    rest.split(|c: char| !c.is_ascii_digit())
                        .next()
                        .and_then(|digits| digits.parse().ok())
                });
            PortOwner { pid, command }
        })
        .collect()
}
