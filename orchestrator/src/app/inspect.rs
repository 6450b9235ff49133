//! Read-only commands and restart

use colored::Colorize;

use crate::deploy::status::{self, StatusReport};
use crate::deploy::supervisor;
use crate::errors::DeployError;
use crate::host::Host;
use crate::models::deployment::DeploymentTarget;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

fn flag(ok: bool, yes: &str, no: &str) -> colored::ColoredString {
    if ok {
        yes.green()
    } else {
        no.red()
    }
}

fn print_status(report: &StatusReport) {
    let p = &report.process;
    println!("{} {}", "Application".bold(), report.app_name);
    println!(
        "  process:   {} pid={} restarts={} uptime={}",
        flag(p.status == "online", &p.status, &p.status),
        p.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string()),
        p.restarts,
        p.uptime_secs
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "-".to_string())
    );
    let owner = report.port.owner.as_deref().unwrap_or("nothing listening");
    println!(
        "  port {}: {} {}",
        report.port.port,
        flag(report.port.ours, "ours", "not ours"),
        owner
    );
    println!("  nginx:     {}", flag(report.proxy_active, "active", "inactive"));
    println!("  route:     {}", flag(report.route_enabled, "enabled", "disabled"));
    println!(
        "  database:  {}",
        flag(report.database_reachable, "reachable", "unreachable")
    );
    println!(
        "  artifact:  {}",
        flag(report.artifact_present, "present", "missing")
    );
    if let Some(env) = &report.env {
        println!("{}", "Environment".bold());
        for line in env.lines() {
            println!("  {}", line);
        }
    }
}

/// Print the health summary; `Ok(false)` when something is unhealthy
pub async fn status(
    host: &dyn Host,
    settings: &Settings,
    target: &DeploymentTarget,
    json: bool,
) -> Result<bool, DeployError> {
    let layout = StorageLayout::new(target, settings);
    let report = status::collect(host, target, settings, &layout).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_status(&report);
    }
    Ok(report.is_healthy())
}

/// Print process and proxy log tails
pub async fn logs(
    host: &dyn Host,
    settings: &Settings,
    target: &DeploymentTarget,
    lines: usize,
) -> Result<(), DeployError> {
    let layout = StorageLayout::new(target, settings);
    let text = status::logs(host, target, settings, &layout, lines).await?;
    print!("{}", text);
    Ok(())
}

/// Restart the supervised process; nothing else is touched
pub async fn restart(host: &dyn Host, target: &DeploymentTarget) -> Result<(), DeployError> {
    supervisor::restart(host, &target.app_name).await?;
    println!("{} {}", "✓ Restarted".green().bold(), target.app_name);
    Ok(())
}
