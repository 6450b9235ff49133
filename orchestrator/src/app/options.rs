//! Application configuration options

use std::path::PathBuf;

use crate::deploy::credentials::CredentialMode;
use crate::models::deployment::DeploymentTarget;
use crate::storage::settings::Settings;

/// Command-line overrides of the settings file's `target` section
#[derive(Debug, Clone, Default)]
pub struct TargetOverrides {
    pub app_name: Option<String>,
    pub install_dir: Option<PathBuf>,
    pub app_port: Option<u16>,
    pub public_port: Option<u16>,
    pub domain: Option<String>,
}

impl TargetOverrides {
    /// Resolve the deployment target; overrides win over the settings file
    pub fn resolve(&self, settings: &Settings) -> DeploymentTarget {
        let file = &settings.target;
        let app_name = self
            .app_name
            .clone()
            .unwrap_or_else(|| file.app_name.clone());
        let install_dir = self
            .install_dir
            .clone()
            .or_else(|| file.install_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/var/www").join(&app_name));

        DeploymentTarget {
            app_name,
            install_dir,
            public_port: self.public_port.unwrap_or(file.public_port),
            app_port: self.app_port.unwrap_or(file.app_port),
            domain: self.domain.clone().unwrap_or_else(|| file.domain.clone()),
        }
    }
}

/// What a mutating run does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Deploy { credentials: CredentialMode },
    Fix { force_reset: bool },
}

/// Options for a deploy or fix run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,

    /// Write a run log into the process log directory
    pub log_to_file: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Deploy {
                credentials: CredentialMode::Fresh,
            },
            log_to_file: true,
        }
    }
}
