//! PM2 process supervision

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::deploy::fsm::Step;
use crate::errors::DeployError;
use crate::filesys::file::tail_lines;
use crate::host::{describe_status, exec_checked, Cmd, Host, DIAGNOSTIC_LINES};
use crate::models::credentials::Credentials;
use crate::models::deployment::DeploymentTarget;
use crate::models::service::{parse_jlist, Ecosystem, Pm2Process, ServiceDescriptor};
use crate::storage::envfile::application_env;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

const PM2_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a stopped process gets to release its port
const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);
const PORT_RELEASE_POLL: Duration = Duration::from_millis(250);

fn pm2(args: &[&str]) -> Cmd {
    Cmd::new("pm2").args(args.iter().copied()).timeout(PM2_TIMEOUT)
}

/// Build the process descriptor for a deployment
pub fn descriptor(
    target: &DeploymentTarget,
    settings: &Settings,
    layout: &StorageLayout,
    credentials: &Credentials,
) -> Result<ServiceDescriptor, DeployError> {
    let sup = &settings.supervisor;
    Ok(ServiceDescriptor {
        name: target.app_name.clone(),
        script: layout.artifact_relative().to_string_lossy().into_owned(),
        cwd: layout.install_dir.to_string_lossy().into_owned(),
        instances: sup.instances,
        exec_mode: if sup.instances > 1 { "cluster" } else { "fork" }.to_string(),
        env: application_env(target, settings, credentials)?.into_iter().collect(),
        autorestart: sup.autorestart,
        max_restarts: sup.max_restarts,
        min_uptime: sup.min_uptime_secs * 1000,
        restart_delay: sup.restart_delay_ms,
        max_memory_restart: format!("{}M", sup.memory_ceiling_mib),
        error_file: layout.err_log().path().to_string_lossy().into_owned(),
        out_file: layout.out_log().path().to_string_lossy().into_owned(),
        merge_logs: true,
        time: true,
    })
}

/// The registry entry for `name`, if PM2 knows it
pub async fn describe(host: &dyn Host, name: &str) -> Result<Option<Pm2Process>, DeployError> {
    let output = host.exec(&pm2(&["jlist"])).await?;
    if !output.success() {
        return Err(DeployError::operator(
            Step::Supervisor,
            "pm2 jlist failed",
            output.diagnostics(),
        ));
    }
    let list = parse_jlist(&output.stdout)?;
    Ok(list.into_iter().find(|p| p.name == name))
}

/// Stop the managed process if it is registered
pub async fn stop(host: &dyn Host, name: &str) -> Result<bool, DeployError> {
    if describe(host, name).await?.is_none() {
        return Ok(false);
    }
    info!("Stopping {}", name);
    exec_checked(host, &pm2(&["stop", name]), Step::Supervisor).await?;
    Ok(true)
}

/// Restart the registered process with its current descriptor
pub async fn restart(host: &dyn Host, name: &str) -> Result<(), DeployError> {
    if describe(host, name).await?.is_none() {
        return Err(DeployError::NotFound(format!(
            "{} is not registered with pm2; run deploy first",
            name
        )));
    }
    exec_checked(host, &pm2(&["restart", name, "--update-env"]), Step::Supervisor).await?;
    Ok(())
}

/// Recent PM2 log lines for `name`
pub async fn log_tail(host: &dyn Host, name: &str, lines: usize) -> String {
    let lines = lines.to_string();
    match host
        .exec(&pm2(&["logs", name, "--nostream", "--lines", &lines]))
        .await
    {
        Ok(output) => output.combined(),
        Err(e) => format!("unable to read pm2 logs: {}", e),
    }
}

/// Wait for `port` to be free; a remaining listener is a conflict
pub async fn ensure_port_free(host: &dyn Host, port: u16) -> Result<(), DeployError> {
    let deadline = Instant::now() + PORT_RELEASE_TIMEOUT;
    loop {
        let Some(owner) = host.port_owner(port).await? else {
            return Ok(());
        };
        if Instant::now() >= deadline {
            return Err(DeployError::PortConflict {
                port,
                owner: owner.to_string(),
            });
        }
        debug!("Port {} still held by {}", port, owner);
        sleep(PORT_RELEASE_POLL).await;
    }
}

/// Write the descriptor, prove the app starts, then hand it to PM2.
///
/// The caller guarantees the build artifact exists.
pub async fn apply(
    host: &dyn Host,
    target: &DeploymentTarget,
    settings: &Settings,
    layout: &StorageLayout,
    credentials: &Credentials,
) -> Result<(), DeployError> {
    let step = Step::Supervisor;
    let artifact = layout.artifact_file();
    if !artifact.is_non_empty().await {
        return Err(DeployError::fatal(
            step,
            format!("build artifact {} is missing", artifact.path().display()),
            String::new(),
        ));
    }

    let descriptor = descriptor(target, settings, layout, credentials)?;
    layout.log_dir().create().await?;
    let ecosystem_file = layout.ecosystem_file();
    ecosystem_file
        .write_json(&Ecosystem {
            apps: vec![descriptor.clone()],
        })
        .await?;
    ecosystem_file.set_permissions_600().await?;
    debug!("Wrote {:?}", descriptor);

    let registered = stop(host, &target.app_name).await?;
    ensure_port_free(host, target.app_port)
        .await
        .map_err(|e| e.in_step(step))?;

    trial_start(host, target, settings, layout, &descriptor).await?;

    if registered {
        exec_checked(host, &pm2(&["delete", &target.app_name]), step).await?;
    }
    let file = ecosystem_file.path().to_string_lossy().into_owned();
    exec_checked(host, &pm2(&["start", &file]), step).await?;
    exec_checked(host, &pm2(&["save"]), step).await?;

    ensure_boot_persistence(host, settings).await?;
    info!("{} started under pm2", target.app_name);
    Ok(())
}

/// Start the artifact by hand, outside PM2, so a crash on startup shows its
/// own output instead of disappearing into PM2's restart loop
async fn trial_start(
    host: &dyn Host,
    target: &DeploymentTarget,
    settings: &Settings,
    layout: &StorageLayout,
    descriptor: &ServiceDescriptor,
) -> Result<(), DeployError> {
    let limit = settings.supervisor.manual_start_timeout();
    let mut cmd = Cmd::new("node")
        .arg(descriptor.script.clone())
        .cwd(&layout.install_dir)
        .timeout(limit);
    for (key, value) in &descriptor.env {
        cmd = cmd.env(key.clone(), value.clone());
    }

    info!("Manual start check on port {} ({:?})", target.app_port, limit);
    let trial = host.trial_start(&cmd, target.app_port, limit).await?;
    if !trial.bound {
        let reason = match trial.exited {
            Some(code) => format!(
                "application exited ({}) before binding port {}",
                describe_status(code),
                target.app_port
            ),
            None => format!(
                "application did not bind port {} within {:?}",
                target.app_port, limit
            ),
        };
        return Err(DeployError::fatal(
            Step::Supervisor,
            reason,
            tail_lines(&trial.output, DIAGNOSTIC_LINES),
        ));
    }

    // The trial process is gone; make sure its socket is too.
    ensure_port_free(host, target.app_port)
        .await
        .map_err(|e| e.in_step(Step::Supervisor))
}

/// Register PM2 with systemd so the process list survives reboots
async fn ensure_boot_persistence(host: &dyn Host, settings: &Settings) -> Result<(), DeployError> {
    let sup = &settings.supervisor;
    let unit = format!("pm2-{}", sup.run_as);
    let enabled = Cmd::new("systemctl")
        .args(["is-enabled", "--quiet", unit.as_str()])
        .timeout(Duration::from_secs(15));
    if host.exec(&enabled).await?.success() {
        return Ok(());
    }

    let home = sup.run_as_home.to_string_lossy().into_owned();
    let startup = pm2(&["startup", "systemd", "-u", &sup.run_as, "--hp", &home]);
    if let Err(e) = exec_checked(host, &startup, Step::Supervisor).await {
        // The app is already running; a missing boot hook is not worth
        // aborting for.
        warn!("Unable to register pm2 with systemd: {}", e);
    }
    Ok(())
}
