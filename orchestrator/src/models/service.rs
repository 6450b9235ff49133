//! PM2 process descriptor and process list models

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// PM2 ecosystem file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ecosystem {
    pub apps: Vec<ServiceDescriptor>,
}

/// How PM2 runs and restarts the application.
///
/// `env` holds credentials, so `Debug` lists its keys only.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Process name; unique within the PM2 registry
    pub name: String,

    /// Entry point, relative to `cwd`
    pub script: String,

    pub cwd: String,

    pub instances: u32,

    /// `fork` for one instance, `cluster` otherwise
    pub exec_mode: String,

    pub env: BTreeMap<String, String>,

    pub autorestart: bool,

    pub max_restarts: u32,

    /// Uptime before a start counts as stable, in milliseconds
    pub min_uptime: u64,

    /// Delay between restarts, in milliseconds
    pub restart_delay: u64,

    /// Memory ceiling, e.g. `512M`
    pub max_memory_restart: String,

    pub error_file: String,

    pub out_file: String,

    pub merge_logs: bool,

    /// Prefix log lines with timestamps
    pub time: bool,
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("script", &self.script)
            .field("cwd", &self.cwd)
            .field("instances", &self.instances)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("autorestart", &self.autorestart)
            .field("max_restarts", &self.max_restarts)
            .field("max_memory_restart", &self.max_memory_restart)
            .finish_non_exhaustive()
    }
}

/// One entry of `pm2 jlist`
#[derive(Debug, Clone, Deserialize)]
pub struct Pm2Process {
    pub name: String,

    /// 0 or absent when the process is not running
    #[serde(default)]
    pub pid: Option<u32>,

    #[serde(default)]
    pub pm2_env: Pm2Env,
}

/// The subset of `pm2_env` we read; the rest (including the process
/// environment) is ignored on purpose
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pm2Env {
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub restart_time: u32,

    /// Start time, Unix epoch milliseconds
    #[serde(default)]
    pub pm_uptime: Option<i64>,
}

impl Pm2Process {
    pub fn is_online(&self) -> bool {
        self.pm2_env.status == "online"
    }

    /// Live pid, if any
    pub fn live_pid(&self) -> Option<u32> {
        self.pid.filter(|pid| *pid != 0)
    }
}

/// Whether `line` opens the JSON array rather than a `[PM2] ...` banner
fn opens_list(line: &str) -> bool {
    line.trim_start()
        .strip_prefix('[')
        .map(str::trim_start)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('{') || rest.starts_with(']'))
}

/// Parse `pm2 jlist` output. PM2 prints banners before the JSON when it
/// has to spawn its daemon or the in-memory copy is out of date.
pub fn parse_jlist(text: &str) -> Result<Vec<Pm2Process>, serde_json::Error> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if opens_list(line) {
            return serde_json::from_str(text[offset..].trim());
        }
        offset += line.len();
    }
    Ok(Vec::new())
}
