//! System prerequisite installation

use std::time::Duration;

use tracing::{debug, info};

use crate::deploy::fsm::Step;
use crate::errors::DeployError;
use crate::host::{exec_checked, Cmd, Host};
use crate::storage::settings::Settings;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// A system package or tool the deployment depends on
#[derive(Debug, Clone)]
pub struct Prerequisite {
    pub name: &'static str,

    /// Prints a version string when the tool is present
    pub probe: Cmd,

    /// Minimum `major.minor`; `None` accepts any version
    pub min_version: Option<(u64, u64)>,

    /// Commands that install the tool, run in order
    pub install: Vec<Cmd>,

    /// Install commands use apt and need a fresh package index
    pub uses_apt: bool,

    /// systemd unit to enable and start
    pub service: Option<&'static str>,
}

/// What the installer changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrereqReport {
    pub installed: Vec<String>,
    pub services_started: Vec<String>,
}

impl PrereqReport {
    /// No mutating action was performed
    pub fn is_noop(&self) -> bool {
        self.installed.is_empty() && self.services_started.is_empty()
    }
}

fn apt_install(packages: &[&str]) -> Cmd {
    Cmd::new("apt-get")
        .args(["install", "-y"])
        .args(packages.iter().copied())
        .env("DEBIAN_FRONTEND", "noninteractive")
        .timeout(INSTALL_TIMEOUT)
}

fn probe(program: &str, arg: &str) -> Cmd {
    Cmd::new(program).arg(arg).timeout(PROBE_TIMEOUT)
}

/// Prerequisites for the configured deployment, in install order
pub fn prerequisites_for(settings: &Settings) -> Vec<Prerequisite> {
    let mut list = vec![
        Prerequisite {
            name: "nodejs",
            probe: probe("node", "--version"),
            min_version: Some((18, 0)),
            install: vec![
                Cmd::shell("curl -fsSL https://deb.nodesource.com/setup_20.x | bash -")
                    .timeout(INSTALL_TIMEOUT),
                apt_install(&["nodejs"]),
            ],
            uses_apt: true,
            service: None,
        },
        Prerequisite {
            name: "postgresql",
            probe: probe("psql", "--version"),
            min_version: Some((12, 0)),
            install: vec![apt_install(&["postgresql", "postgresql-contrib"])],
            uses_apt: true,
            service: Some("postgresql"),
        },
        Prerequisite {
            name: "nginx",
            probe: probe("nginx", "-v"),
            min_version: None,
            install: vec![apt_install(&["nginx"])],
            uses_apt: true,
            service: Some("nginx"),
        },
        Prerequisite {
            name: "pm2",
            probe: probe("pm2", "--version"),
            min_version: None,
            install: vec![Cmd::new("npm")
                .args(["install", "-g", "pm2"])
                .timeout(INSTALL_TIMEOUT)],
            uses_apt: false,
            service: None,
        },
    ];

    if settings.tls.is_some() {
        list.push(Prerequisite {
            name: "certbot",
            probe: probe("certbot", "--version"),
            min_version: None,
            install: vec![apt_install(&["certbot", "python3-certbot-nginx"])],
            uses_apt: true,
            service: None,
        });
    }

    list
}

/// First dotted number in `text`: `v20.11.0` -> [20, 11, 0],
/// `nginx version: nginx/1.18.0` -> [1, 18, 0]
pub fn parse_version(text: &str) -> Option<Vec<u64>> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let run: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let parts: Vec<u64> = run
        .split('.')
        .filter(|p| !p.is_empty())
        .map(|p| p.parse().ok())
        .collect::<Option<_>>()?;
    (!parts.is_empty()).then_some(parts)
}

fn meets_minimum(version: &[u64], min: (u64, u64)) -> bool {
    let major = version.first().copied().unwrap_or(0);
    let minor = version.get(1).copied().unwrap_or(0);
    (major, minor) >= min
}

/// Installed and new enough?
async fn is_satisfied(host: &dyn Host, prereq: &Prerequisite) -> Result<bool, DeployError> {
    let output = match host.exec(&prereq.probe).await {
        Ok(output) if output.success() => output,
        Ok(_) | Err(DeployError::SpawnError { .. }) | Err(DeployError::Timeout { .. }) => {
            return Ok(false)
        }
        Err(e) => return Err(e),
    };

    let Some(min) = prereq.min_version else {
        return Ok(true);
    };
    match parse_version(&output.combined()) {
        Some(version) if meets_minimum(&version, min) => Ok(true),
        Some(version) => {
            info!(
                "{} {:?} is older than required {}.{}",
                prereq.name, version, min.0, min.1
            );
            Ok(false)
        }
        None => Ok(false),
    }
}

async fn service_running(host: &dyn Host, unit: &str) -> Result<bool, DeployError> {
    for check in ["is-enabled", "is-active"] {
        let cmd = Cmd::new("systemctl")
            .args([check, "--quiet", unit])
            .timeout(PROBE_TIMEOUT);
        if !host.exec(&cmd).await?.success() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Bring every prerequisite to its installed, enabled and running state.
///
/// Nothing is mutated for prerequisites that are already satisfied.
pub async fn ensure(
    host: &dyn Host,
    prerequisites: &[Prerequisite],
) -> Result<PrereqReport, DeployError> {
    let mut report = PrereqReport::default();
    let mut apt_updated = false;

    for prereq in prerequisites {
        if is_satisfied(host, prereq).await? {
            debug!("{} present", prereq.name);
        } else {
            info!("Installing {}", prereq.name);
            if prereq.uses_apt && !apt_updated {
                let update = Cmd::new("apt-get")
                    .arg("update")
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .timeout(INSTALL_TIMEOUT);
                exec_checked(host, &update, Step::Prerequisites).await?;
                apt_updated = true;
            }
            for cmd in &prereq.install {
                exec_checked(host, cmd, Step::Prerequisites).await?;
            }
            if !is_satisfied(host, prereq).await? {
                let probe = host.exec(&prereq.probe).await.map(|o| o.diagnostics());
                return Err(DeployError::fatal(
                    Step::Prerequisites,
                    format!("{} still missing or too old after install", prereq.name),
                    probe.unwrap_or_else(|e| e.to_string()),
                ));
            }
            report.installed.push(prereq.name.to_string());
        }

        if let Some(unit) = prereq.service {
            if !service_running(host, unit).await? {
                info!("Enabling and starting {}", unit);
                let enable = Cmd::new("systemctl").args(["enable", "--now", unit]);
                exec_checked(host, &enable, Step::Prerequisites).await?;
                report.services_started.push(unit.to_string());
            }
        }
    }

    Ok(report)
}
