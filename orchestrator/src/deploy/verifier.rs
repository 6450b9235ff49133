//! Post-deployment health checks.
//!
//! Checks run in a fixed order and each one is polled with exponential
//! backoff up to a fixed number of attempts. The first check that fails ends
//! verification; the error carries the responsible component's output.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::deploy::fsm::Step;
use crate::deploy::supervisor;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::host::{Host, DIAGNOSTIC_LINES};
use crate::models::deployment::{CheckOutcome, DeploymentTarget};
use crate::storage::settings::{Settings, VerifySettings};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Verdict of one attempt
#[derive(Debug)]
pub enum Probe {
    Pass(String),

    /// Not healthy yet; try again after the backoff
    Retry(String),

    /// Cannot become healthy by waiting
    Abort(String),
}

/// Backoff policy from the verify settings
pub fn cooldown(settings: &VerifySettings) -> CooldownOptions {
    CooldownOptions {
        base_delay: Duration::from_millis(settings.base_delay_ms),
        max_delay: Duration::from_millis(settings.max_delay_ms),
        multiplier: 2.0,
    }
}

/// Poll `probe` until it passes, aborts, or the attempt budget runs out
pub async fn poll<F, Fut>(name: &str, settings: &VerifySettings, mut probe: F) -> CheckOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe>,
{
    let options = cooldown(settings);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let (passed, detail, last) = match probe().await {
            Probe::Pass(detail) => (true, detail, true),
            Probe::Abort(detail) => (false, detail, true),
            Probe::Retry(detail) => (false, detail, attempt >= settings.attempts),
        };
        if last {
            return CheckOutcome {
                name: name.to_string(),
                passed,
                attempts: attempt,
                detail,
            };
        }
        let delay = calc_exp_backoff(&options, attempt - 1);
        debug!("{} not ready ({}); retrying in {:?}", name, detail, delay);
        sleep(delay).await;
    }
}

async fn process_online(host: &dyn Host, name: &str) -> Probe {
    match supervisor::describe(host, name).await {
        Ok(Some(process)) if process.is_online() => match process.live_pid() {
            Some(pid) => Probe::Pass(format!(
                "pid {}, {} restarts",
                pid, process.pm2_env.restart_time
            )),
            None => Probe::Retry("online without a pid".to_string()),
        },
        Ok(Some(process)) => Probe::Retry(format!("status {}", process.pm2_env.status)),
        Ok(None) => Probe::Abort(format!("{} is not registered with pm2", name)),
        Err(e) => Probe::Retry(e.to_string()),
    }
}

async fn port_bound(host: &dyn Host, target: &DeploymentTarget, clustered: bool) -> Probe {
    let pid = match supervisor::describe(host, &target.app_name).await {
        Ok(Some(process)) => process.live_pid(),
        _ => None,
    };
    let Some(pid) = pid else {
        return Probe::Retry("supervised process has no pid".to_string());
    };
    match host.port_owner(target.app_port).await {
        Ok(None) => Probe::Retry(format!("nothing listening on {}", target.app_port)),
        Ok(Some(owner)) => match owner.pid {
            Some(owner_pid) if host.in_process_tree(owner_pid, pid) => {
                Probe::Pass(format!("bound by {}", owner))
            }
            // In cluster mode the PM2 daemon holds the socket for its workers.
            Some(owner_pid) if clustered && host.in_process_tree(pid, owner_pid) => {
                Probe::Pass(format!("bound by {}", owner))
            }
            _ => Probe::Abort(format!(
                "port {} is bound by {}, not by the supervised process (pid {})",
                target.app_port, owner, pid
            )),
        },
        Err(e) => Probe::Retry(e.to_string()),
    }
}

async fn http_ok(host: &dyn Host, url: &str, host_header: Option<&str>, timeout: Duration) -> Probe {
    match host.http_probe(url, host_header, timeout).await {
        Ok(status) if status < 500 => Probe::Pass(format!("HTTP {}", status)),
        Ok(status) => Probe::Retry(format!("HTTP {}", status)),
        Err(e) => Probe::Retry(e.to_string()),
    }
}

fn failure(outcome: &CheckOutcome, diagnostics: String) -> DeployError {
    DeployError::operator(
        Step::Verify,
        format!(
            "{} failed after {} attempt(s): {}",
            outcome.name, outcome.attempts, outcome.detail
        ),
        diagnostics,
    )
}

/// Run every check in order, appending outcomes to `checks`
pub async fn verify(
    host: &dyn Host,
    target: &DeploymentTarget,
    settings: &Settings,
    checks: &mut Vec<CheckOutcome>,
) -> Result<(), DeployError> {
    let verify = &settings.verify;
    let timeout = Duration::from_secs(verify.probe_timeout_secs);
    let name = target.app_name.as_str();
    let supervisor_logs = || supervisor::log_tail(host, name, DIAGNOSTIC_LINES);

    let outcome = poll("process online", verify, || process_online(host, name)).await;
    checks.push(outcome.clone());
    if !outcome.passed {
        return Err(failure(&outcome, supervisor_logs().await));
    }

    let clustered = settings.supervisor.instances > 1;
    let outcome = poll("port bound", verify, || port_bound(host, target, clustered)).await;
    checks.push(outcome.clone());
    if !outcome.passed {
        return Err(failure(&outcome, supervisor_logs().await));
    }

    let local = format!("http://127.0.0.1:{}/", target.app_port);
    let outcome = poll("application responds", verify, || {
        http_ok(host, &local, None, timeout)
    })
    .await;
    checks.push(outcome.clone());
    if !outcome.passed {
        return Err(failure(&outcome, supervisor_logs().await));
    }

    let public = format!("http://127.0.0.1:{}/", target.public_port);
    let host_header = target.primary_domain();
    let outcome = poll("proxy responds", verify, || {
        http_ok(host, &public, host_header, timeout)
    })
    .await;
    checks.push(outcome.clone());
    if !outcome.passed {
        let log = File::new(&settings.proxy.error_log)
            .tail(DIAGNOSTIC_LINES)
            .await;
        return Err(failure(&outcome, log));
    }

    info!("All {} checks passed", checks.len());
    Ok(())
}

/// Log a summary line per check
pub fn log_outcomes(checks: &[CheckOutcome]) {
    for check in checks {
        if check.passed {
            info!("check {}: ok ({})", check.name, check.detail);
        } else {
            warn!("check {}: FAILED ({})", check.name, check.detail);
        }
    }
}
