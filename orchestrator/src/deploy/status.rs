//! Read-only views of a deployment: health summary and log tails.
//! Everything returned here has known secrets masked.

use std::time::Duration;

use serde::Serialize;

use crate::deploy::credentials;
use crate::deploy::database;
use crate::deploy::proxy;
use crate::deploy::supervisor;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::host::{Cmd, Host};
use crate::models::credentials::Credentials;
use crate::models::deployment::DeploymentTarget;
use crate::storage::envfile::EnvDescriptor;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::redact;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub registered: bool,
    pub status: String,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub uptime_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub port: u16,
    pub owner: Option<String>,

    /// The listener belongs to the supervised process
    pub ours: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub app_name: String,
    pub process: ProcessStatus,
    pub port: PortStatus,
    pub proxy_active: bool,
    pub route_enabled: bool,
    pub database_reachable: bool,
    pub artifact_present: bool,

    /// Environment descriptor with secret values masked
    pub env: Option<String>,
}

impl StatusReport {
    pub fn is_healthy(&self) -> bool {
        self.process.status == "online"
            && self.port.ours
            && self.proxy_active
            && self.route_enabled
            && self.database_reachable
    }
}

/// Collect the health summary. Changes nothing on the host.
pub async fn collect(
    host: &dyn Host,
    target: &DeploymentTarget,
    settings: &Settings,
    layout: &StorageLayout,
) -> Result<StatusReport, DeployError> {
    let process = match supervisor::describe(host, &target.app_name).await? {
        Some(p) => ProcessStatus {
            registered: true,
            status: p.pm2_env.status.clone(),
            pid: p.live_pid(),
            restarts: p.pm2_env.restart_time,
            uptime_secs: p
                .pm2_env
                .pm_uptime
                .filter(|_| p.is_online())
                .map(|started| (chrono::Utc::now().timestamp_millis() - started) / 1000),
        },
        None => ProcessStatus {
            registered: false,
            status: "not registered".to_string(),
            pid: None,
            restarts: 0,
            uptime_secs: None,
        },
    };

    let owner = host.port_owner(target.app_port).await?;
    let ours = match (&owner, process.pid) {
        (Some(owner), Some(pid)) => owner.pid.is_some_and(|o| host.in_process_tree(o, pid)),
        _ => false,
    };
    let port = PortStatus {
        port: target.app_port,
        owner: owner.map(|o| o.to_string()),
        ours,
    };

    let active = Cmd::new("systemctl")
        .args(["is-active", "--quiet", "nginx"])
        .timeout(Duration::from_secs(10));
    let proxy_active = host.exec(&active).await?.success();

    let creds = credentials::load_existing(layout, settings).await?;
    let database_reachable = match &creds {
        Some(c) => database::check_connection(host, settings, c).await.is_ok(),
        None => false,
    };

    let env = layout
        .env_file()
        .read_optional()
        .await?
        .map(|text| EnvDescriptor::parse(&text).render_redacted());

    Ok(StatusReport {
        app_name: target.app_name.clone(),
        process,
        port,
        proxy_active,
        route_enabled: proxy::is_enabled(layout).await,
        database_reachable,
        artifact_present: layout.artifact_file().is_non_empty().await,
        env: env.map(|text| redact_with(&text, creds.as_ref())),
    })
}

fn redact_with(text: &str, creds: Option<&Credentials>) -> String {
    let secrets = creds.map(|c| c.secret_values()).unwrap_or_default();
    redact(text, &secrets)
}

/// Process log tail followed by the proxy's error and access logs
pub async fn logs(
    host: &dyn Host,
    target: &DeploymentTarget,
    settings: &Settings,
    layout: &StorageLayout,
    lines: usize,
) -> Result<String, DeployError> {
    let creds = credentials::load_existing(layout, settings).await?;
    let mut out = String::new();
    out.push_str(&format!("==> pm2 logs {} <==\n", target.app_name));
    out.push_str(&supervisor::log_tail(host, &target.app_name, lines).await);
    for path in [&settings.proxy.error_log, &settings.proxy.access_log] {
        out.push_str(&format!("\n\n==> {} <==\n", path.display()));
        out.push_str(&File::new(path).tail(lines).await);
    }
    out.push('\n');
    Ok(redact_with(&out, creds.as_ref()))
}
