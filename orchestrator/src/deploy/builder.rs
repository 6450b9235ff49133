//! Dependency installation and application build

use std::time::Duration;

use tracing::{info, warn};

use crate::deploy::fsm::Step;
use crate::errors::DeployError;
use crate::host::{describe_status, exec_checked, Cmd, Host};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Lowest heap ceiling a build is given
pub const MIN_BUILD_MEMORY_MIB: u64 = 256;

/// Heap ceiling for the first build attempt.
///
/// On hosts below the constrained-memory threshold the configured ceiling
/// is capped at three quarters of physical memory.
pub fn memory_ceiling(settings: &Settings, total_mib: u64) -> u64 {
    let configured = settings.build.memory_ceiling_mib;
    if total_mib >= settings.build.constrained_memory_mib {
        return configured;
    }
    let cap = (total_mib * 3 / 4).max(MIN_BUILD_MEMORY_MIB);
    configured.min(cap)
}

/// Heap ceiling for the retry after a timeout
pub fn reduced_ceiling(previous: u64) -> u64 {
    (previous / 2).max(MIN_BUILD_MEMORY_MIB)
}

/// `npm ci` when a lockfile exists, `npm install` otherwise.
/// Dev dependencies are always included; the bundler lives there.
pub async fn install_command(layout: &StorageLayout, settings: &Settings) -> Cmd {
    let cmd = match &settings.build.install_command {
        Some(custom) => Cmd::shell(custom.clone()),
        None if layout.lock_file().exists().await => {
            Cmd::new("npm").args(["ci", "--include=dev"])
        }
        None => Cmd::new("npm").args(["install", "--include=dev"]),
    };
    cmd.cwd(&layout.install_dir)
        .timeout(Duration::from_secs(settings.build.install_timeout_secs))
}

/// Install declared dependencies
pub async fn install_dependencies(
    host: &dyn Host,
    layout: &StorageLayout,
    settings: &Settings,
) -> Result<(), DeployError> {
    let cmd = install_command(layout, settings).await;
    info!("Installing dependencies: {}", cmd);
    exec_checked(host, &cmd, Step::Build).await?;
    Ok(())
}

/// One build attempt under `memory_mib`.
///
/// A timeout is recoverable; a failing build or a missing artifact is fatal
/// and carries the build's own output.
pub async fn build(
    host: &dyn Host,
    layout: &StorageLayout,
    settings: &Settings,
    memory_mib: u64,
) -> Result<(), DeployError> {
    let timeout = Duration::from_secs(settings.build.timeout_secs);
    let cmd = Cmd::shell(settings.build.build_command.clone())
        .cwd(&layout.install_dir)
        .env("NODE_OPTIONS", format!("--max-old-space-size={}", memory_mib))
        .timeout(timeout);
    info!("Building with {} MiB heap ceiling: {}", memory_mib, cmd);

    let output = match host.exec(&cmd).await {
        Ok(output) => output,
        Err(DeployError::Timeout { .. }) => {
            warn!("Build timed out after {:?}", timeout);
            return Err(DeployError::recoverable(
                Step::Build,
                format!("build timed out after {:?} at {} MiB", timeout, memory_mib),
                String::new(),
            ));
        }
        Err(e) => return Err(e.in_step(Step::Build)),
    };

    if !output.success() {
        return Err(DeployError::fatal(
            Step::Build,
            format!("`{}` exited with {}", cmd, describe_status(output.status)),
            output.diagnostics(),
        ));
    }

    let artifact = layout.artifact_file();
    if !artifact.is_non_empty().await {
        return Err(DeployError::fatal(
            Step::Build,
            format!("build artifact {} is missing or empty", artifact.path().display()),
            output.diagnostics(),
        ));
    }
    Ok(())
}
