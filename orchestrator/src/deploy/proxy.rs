//! Reverse proxy configuration.
//!
//! The route is written, enabled and validated with `nginx -t` before the
//! running proxy is told about it. Everything touched is snapshotted first.
//! The snapshot is put back when validation or the reload fails, and also
//! when the run is cancelled before the new route is accepted, so the
//! configuration nginx would load next never contains an unvalidated route.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::deploy::fsm::Step;
use crate::errors::DeployError;
use crate::filesys::dir::{links_to, read_link, remove_link, replace_symlink};
use crate::filesys::file::File;
use crate::host::{describe_status, Cmd, Host, DIAGNOSTIC_LINES};
use crate::models::deployment::DeploymentTarget;
use crate::models::route::{conflicts_with, ProxyRoute, TlsPaths};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

const PROXY_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of applying a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOutcome {
    /// New configuration validated and reloaded
    Applied,

    /// Route and links already as desired; nothing written, no reload
    Unchanged,

    /// The reload failed; previous files restored. Carries the diagnostics.
    RolledBack(String),
}

/// Certificate pair for `domain`, when certbot has issued one
pub async fn existing_certificate(settings: &Settings, domain: &str) -> Option<TlsPaths> {
    let live = settings.proxy.cert_dir.join(domain);
    let paths = TlsPaths {
        certificate: live.join("fullchain.pem"),
        key: live.join("privkey.pem"),
    };
    let present = File::new(&paths.certificate).is_non_empty().await
        && File::new(&paths.key).is_non_empty().await;
    present.then_some(paths)
}

/// The route for a target, with HTTPS when a certificate is available
pub async fn route_for(target: &DeploymentTarget, settings: &Settings) -> ProxyRoute {
    let tls = match target.primary_domain() {
        Some(domain) => existing_certificate(settings, domain).await,
        None => None,
    };
    ProxyRoute {
        name: target.app_name.clone(),
        listen_port: target.public_port,
        server_names: target.server_names().into_iter().map(String::from).collect(),
        upstream_port: target.app_port,
        client_max_body_size: settings.proxy.client_max_body_size.clone(),
        access_log: settings.proxy.access_log.clone(),
        error_log: settings.proxy.error_log.clone(),
        tls,
    }
}

fn command(argv: &[String]) -> Result<Cmd, DeployError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| DeployError::ConfigError("empty proxy command".to_string()))?;
    Ok(Cmd::new(program.clone())
        .args(args.iter().cloned())
        .timeout(PROXY_COMMAND_TIMEOUT))
}

/// A file or link as it was before the swap
#[derive(Debug)]
struct Saved {
    path: PathBuf,
    link_target: Option<PathBuf>,
    contents: Option<String>,
}

impl Saved {
    async fn capture(path: &Path) -> Result<Self, DeployError> {
        let link_target = read_link(path).await;
        let contents = if link_target.is_some() {
            None
        } else {
            File::new(path).read_optional().await?
        };
        Ok(Self {
            path: path.to_path_buf(),
            link_target,
            contents,
        })
    }

    /// Put the entry back. Synchronous so it can run from `Drop`.
    fn restore(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        match (&self.link_target, &self.contents) {
            (Some(target), _) => std::os::unix::fs::symlink(target, &self.path),
            (None, Some(contents)) => std::fs::write(&self.path, contents),
            (None, None) => Ok(()),
        }
    }
}

/// Site files and links as they were before the swap.
///
/// Restored when dropped unless released, so a run cancelled while
/// `nginx -t` or the reload is in flight leaves the previous files behind.
#[derive(Debug)]
struct Snapshot {
    saved: Vec<Saved>,
    armed: bool,
}

impl Snapshot {
    fn new(saved: Vec<Saved>) -> Self {
        Self { saved, armed: true }
    }

    fn restore(&mut self) {
        if !std::mem::take(&mut self.armed) {
            return;
        }
        for saved in &self.saved {
            if let Err(e) = saved.restore() {
                warn!("Unable to restore {}: {}", saved.path.display(), e);
            }
        }
    }

    /// Keep the new configuration
    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if self.armed {
            warn!("Proxy update interrupted; restoring previous site files");
        }
        self.restore();
    }
}

/// Enabled sites, other than ours, that claim the route's listener
async fn conflicting_sites(
    layout: &StorageLayout,
    route: &ProxyRoute,
) -> Result<Vec<PathBuf>, DeployError> {
    let ours = layout.site_link();
    let mut found = Vec::new();
    for entry in layout.sites_enabled_dir().list_entries().await? {
        if entry == ours {
            continue;
        }
        let is_default = entry.file_name().is_some_and(|n| n == "default");
        let claims = match File::new(&entry).read_optional().await {
            Ok(Some(config)) => conflicts_with(&config, route.listen_port, &route.server_names),
            _ => false,
        };
        if is_default || claims {
            found.push(entry);
        }
    }
    Ok(found)
}

async fn proxy_diagnostics(settings: &Settings, output: &str) -> String {
    let log = File::new(&settings.proxy.error_log).tail(DIAGNOSTIC_LINES).await;
    if log.is_empty() {
        output.to_string()
    } else {
        format!("{}\n--- {} ---\n{}", output, settings.proxy.error_log.display(), log)
    }
}

/// Write, enable and validate the route, then reload the proxy.
///
/// A configuration that fails validation is fatal and leaves the previous
/// configuration in effect. A failed reload is rolled back and reported
/// without failing the run.
pub async fn apply(
    host: &dyn Host,
    layout: &StorageLayout,
    settings: &Settings,
    route: &ProxyRoute,
) -> Result<ProxyOutcome, DeployError> {
    route.validate().map_err(|e| e.in_step(Step::Proxy))?;
    let validate = command(&settings.proxy.validate_command)?;
    let reload = command(&settings.proxy.reload_command)?;
    let rendered = route.render();
    let site = layout.site_file();
    let link = layout.site_link();

    let conflicts = conflicting_sites(layout, route).await?;
    let current = site.read_optional().await?;
    if current.as_deref() == Some(rendered.as_str())
        && links_to(&link, site.path()).await
        && conflicts.is_empty()
    {
        info!("Proxy route for {} unchanged", route.name);
        return Ok(ProxyOutcome::Unchanged);
    }

    let mut saved = vec![
        Saved::capture(site.path()).await?,
        Saved::capture(&link).await?,
    ];
    for path in &conflicts {
        saved.push(Saved::capture(path).await?);
    }
    let mut snapshot = Snapshot::new(saved);

    layout.setup().await?;
    site.write_atomic(rendered.as_bytes()).await?;
    replace_symlink(site.path(), &link).await?;
    for path in &conflicts {
        info!("Disabling conflicting site {}", path.display());
        remove_link(path).await?;
    }

    let output = match host.exec(&validate).await {
        Ok(output) => output,
        Err(e) => {
            snapshot.restore();
            return Err(e.in_step(Step::Proxy));
        }
    };
    if !output.success() {
        snapshot.restore();
        return Err(DeployError::fatal(
            Step::Proxy,
            format!(
                "`{}` rejected the route ({}); previous configuration kept",
                validate,
                describe_status(output.status)
            ),
            output.diagnostics(),
        ));
    }
    debug!("Proxy configuration valid");

    let failure = match host.exec(&reload).await {
        Ok(output) if output.success() => None,
        Ok(output) => Some(format!(
            "`{}` exited with {}\n{}",
            reload,
            describe_status(output.status),
            output.diagnostics()
        )),
        Err(e) => Some(e.to_string()),
    };
    let Some(failure) = failure else {
        snapshot.release();
        info!("Proxy route for {} applied", route.name);
        return Ok(ProxyOutcome::Applied);
    };

    warn!("Proxy reload failed; restoring previous configuration");
    snapshot.restore();
    match host.exec(&reload).await {
        Ok(output) if output.success() => {}
        Ok(output) => warn!("Reload after rollback failed: {}", output.diagnostics()),
        Err(e) => warn!("Reload after rollback failed: {}", e),
    }
    Ok(ProxyOutcome::RolledBack(
        proxy_diagnostics(settings, &failure).await,
    ))
}

/// Whether our route is enabled
pub async fn is_enabled(layout: &StorageLayout) -> bool {
    links_to(&layout.site_link(), layout.site_file().path()).await
}
