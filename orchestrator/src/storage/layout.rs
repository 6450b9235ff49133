//! On-host file layout for one deployment

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::DeploymentTarget;
use crate::storage::settings::Settings;

/// Paths the orchestrator reads and writes on the host
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Installation directory
    pub install_dir: PathBuf,

    /// Process log directory
    pub log_dir: PathBuf,

    /// nginx site definitions
    pub sites_available: PathBuf,

    /// nginx enabled sites (symlinks)
    pub sites_enabled: PathBuf,

    app_name: String,
    artifact: PathBuf,
}

impl StorageLayout {
    /// Resolve the layout for a target
    pub fn new(target: &DeploymentTarget, settings: &Settings) -> Self {
        let log_dir = settings
            .supervisor
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/log").join(&target.app_name));

        Self {
            install_dir: target.install_dir.clone(),
            log_dir,
            sites_available: settings.proxy.sites_available.clone(),
            sites_enabled: settings.proxy.sites_enabled.clone(),
            app_name: target.app_name.clone(),
            artifact: settings.build.artifact.clone(),
        }
    }

    /// Environment descriptor consumed by the application
    pub fn env_file(&self) -> File {
        File::new(self.install_dir.join(".env"))
    }

    /// PM2 process descriptor
    pub fn ecosystem_file(&self) -> File {
        File::new(self.install_dir.join("ecosystem.config.json"))
    }

    /// Build artifact (application entry point)
    pub fn artifact_file(&self) -> File {
        File::new(self.install_dir.join(&self.artifact))
    }

    /// Entry point as written into the process descriptor
    pub fn artifact_relative(&self) -> &std::path::Path {
        &self.artifact
    }

    /// npm lockfile; its presence selects `npm ci`
    pub fn lock_file(&self) -> File {
        File::new(self.install_dir.join("package-lock.json"))
    }

    /// Installed dependencies
    pub fn node_modules(&self) -> Dir {
        Dir::new(self.install_dir.join("node_modules"))
    }

    pub fn out_log(&self) -> File {
        File::new(self.log_dir.join("out.log"))
    }

    pub fn err_log(&self) -> File {
        File::new(self.log_dir.join("error.log"))
    }

    /// Route definition in sites-available
    pub fn site_file(&self) -> File {
        File::new(self.sites_available.join(&self.app_name))
    }

    /// Route symlink in sites-enabled
    pub fn site_link(&self) -> PathBuf {
        self.sites_enabled.join(&self.app_name)
    }

    pub fn sites_enabled_dir(&self) -> Dir {
        Dir::new(self.sites_enabled.clone())
    }

    pub fn log_dir(&self) -> Dir {
        Dir::new(self.log_dir.clone())
    }

    /// Create directories the run writes into
    pub async fn setup(&self) -> Result<(), crate::errors::DeployError> {
        self.log_dir().create().await?;
        Dir::new(self.sites_available.clone()).create().await?;
        self.sites_enabled_dir().create().await?;
        Ok(())
    }
}
