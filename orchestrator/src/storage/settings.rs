//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::logs::LogLevel;
use crate::models::deployment::is_name;

/// Default settings file location
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/vpsctl/vpsctl.json";

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,

    /// Deployment target
    #[serde(default)]
    pub target: TargetSettings,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseSettings,

    /// Build configuration
    #[serde(default)]
    pub build: BuildSettings,

    /// Process supervisor configuration
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Reverse proxy configuration
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Certificate issuance; disabled when absent
    #[serde(default)]
    pub tls: Option<TlsSettings>,

    /// Verifier configuration
    #[serde(default)]
    pub verify: VerifySettings,

    /// Credential generation
    #[serde(default)]
    pub credentials: CredentialSettings,

    /// Value of NODE_ENV for the application
    #[serde(default = "default_runtime_mode")]
    pub runtime_mode: String,
}

fn default_true() -> bool {
    true
}

fn default_runtime_mode() -> String {
    "production".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            target: TargetSettings::default(),
            database: DatabaseSettings::default(),
            build: BuildSettings::default(),
            supervisor: SupervisorSettings::default(),
            proxy: ProxySettings::default(),
            tls: None,
            verify: VerifySettings::default(),
            credentials: CredentialSettings::default(),
            runtime_mode: default_runtime_mode(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. A missing file yields defaults.
    pub async fn load(path: &std::path::Path) -> Result<Self, DeployError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| DeployError::ConfigError(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(DeployError::ConfigError(format!("{}: {}", path.display(), e))),
        }
    }

    /// Check values that are spliced into SQL, file paths or commands
    pub fn validate(&self) -> Result<(), DeployError> {
        if !is_name(&self.database.name, false) {
            return Err(DeployError::ValidationError(format!(
                "database name {:?} must match [a-z_][a-z0-9_]*",
                self.database.name
            )));
        }
        if !is_name(&self.database.user, false) {
            return Err(DeployError::ValidationError(format!(
                "database user {:?} must match [a-z_][a-z0-9_]*",
                self.database.user
            )));
        }
        if self.credentials.password_length < 16 {
            return Err(DeployError::ValidationError(
                "password length must be at least 16".to_string(),
            ));
        }
        if self.credentials.session_secret_bytes < 32 {
            return Err(DeployError::ValidationError(
                "session secret must carry at least 32 bytes".to_string(),
            ));
        }
        if self.verify.attempts == 0 {
            return Err(DeployError::ValidationError(
                "verify attempts must be at least 1".to_string(),
            ));
        }
        if self.proxy.validate_command.is_empty() || self.proxy.reload_command.is_empty() {
            return Err(DeployError::ValidationError(
                "proxy validate and reload commands must not be empty".to_string(),
            ));
        }
        if self.build.artifact.is_absolute() {
            return Err(DeployError::ValidationError(
                "build artifact must be relative to the install dir".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deployment target settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSettings {
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Defaults to `/var/www/<app_name>`
    #[serde(default)]
    pub install_dir: Option<PathBuf>,

    #[serde(default = "default_public_port")]
    pub public_port: u16,

    #[serde(default = "default_app_port")]
    pub app_port: u16,

    #[serde(default = "default_domain")]
    pub domain: String,
}

fn default_app_name() -> String {
    "finance-tracker".to_string()
}

fn default_public_port() -> u16 {
    80
}

fn default_app_port() -> u16 {
    5000
}

fn default_domain() -> String {
    "_".to_string()
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            install_dir: None,
            public_port: default_public_port(),
            app_port: default_app_port(),
            domain: default_domain(),
        }
    }
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_name")]
    pub name: String,

    #[serde(default = "default_db_user")]
    pub user: String,

    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Percent-encode the password inside DATABASE_URL
    #[serde(default = "default_true")]
    pub encode_password_in_url: bool,

    /// Schema migration command, run from the install dir
    #[serde(default = "default_migrate_command")]
    pub migrate_command: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_db_name() -> String {
    "finance_tracker".to_string()
}

fn default_db_user() -> String {
    "finance_user".to_string()
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_migrate_command() -> String {
    "npm run db:push".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            name: default_db_name(),
            user: default_db_user(),
            host: default_db_host(),
            port: default_db_port(),
            encode_password_in_url: true,
            migrate_command: default_migrate_command(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Build settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Overrides `npm ci` / `npm install` detection
    #[serde(default)]
    pub install_command: Option<String>,

    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Entry point produced by the build, relative to the install dir
    #[serde(default = "default_artifact")]
    pub artifact: PathBuf,

    /// Node heap ceiling for the build, in MiB
    #[serde(default = "default_build_memory")]
    pub memory_ceiling_mib: u64,

    /// Hosts with less total memory get a lowered ceiling
    #[serde(default = "default_constrained_memory")]
    pub constrained_memory_mib: u64,

    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
}

fn default_build_command() -> String {
    "npm run build".to_string()
}

fn default_artifact() -> PathBuf {
    PathBuf::from("dist/index.js")
}

fn default_build_memory() -> u64 {
    2048
}

fn default_constrained_memory() -> u64 {
    2048
}

fn default_build_timeout() -> u64 {
    900
}

fn default_install_timeout() -> u64 {
    900
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            install_command: None,
            build_command: default_build_command(),
            artifact: default_artifact(),
            memory_ceiling_mib: default_build_memory(),
            constrained_memory_mib: default_constrained_memory(),
            timeout_secs: default_build_timeout(),
            install_timeout_secs: default_install_timeout(),
        }
    }
}

/// Process supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_instances")]
    pub instances: u32,

    #[serde(default = "default_true")]
    pub autorestart: bool,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_min_uptime")]
    pub min_uptime_secs: u64,

    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    #[serde(default = "default_process_memory")]
    pub memory_ceiling_mib: u64,

    /// Defaults to `/var/log/<app_name>`
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Bound on the manual start used to surface startup errors
    #[serde(default = "default_manual_start_timeout")]
    pub manual_start_timeout_secs: u64,

    /// System user PM2 runs under
    #[serde(default = "default_run_as")]
    pub run_as: String,

    #[serde(default = "default_run_as_home")]
    pub run_as_home: PathBuf,
}

fn default_instances() -> u32 {
    1
}

fn default_max_restarts() -> u32 {
    10
}

fn default_min_uptime() -> u64 {
    10
}

fn default_restart_delay() -> u64 {
    4000
}

fn default_process_memory() -> u64 {
    512
}

fn default_manual_start_timeout() -> u64 {
    10
}

fn default_run_as() -> String {
    "root".to_string()
}

fn default_run_as_home() -> PathBuf {
    PathBuf::from("/root")
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            instances: default_instances(),
            autorestart: true,
            max_restarts: default_max_restarts(),
            min_uptime_secs: default_min_uptime(),
            restart_delay_ms: default_restart_delay(),
            memory_ceiling_mib: default_process_memory(),
            log_dir: None,
            manual_start_timeout_secs: default_manual_start_timeout(),
            run_as: default_run_as(),
            run_as_home: default_run_as_home(),
        }
    }
}

impl SupervisorSettings {
    pub fn manual_start_timeout(&self) -> Duration {
        Duration::from_secs(self.manual_start_timeout_secs)
    }
}

/// Reverse proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_sites_available")]
    pub sites_available: PathBuf,

    #[serde(default = "default_sites_enabled")]
    pub sites_enabled: PathBuf,

    #[serde(default = "default_error_log")]
    pub error_log: PathBuf,

    #[serde(default = "default_access_log")]
    pub access_log: PathBuf,

    #[serde(default = "default_body_size")]
    pub client_max_body_size: String,

    /// Where certbot keeps live certificates
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Checks the on-disk configuration without applying it
    #[serde(default = "default_validate_command")]
    pub validate_command: Vec<String>,

    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
}

fn default_sites_available() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-available")
}

fn default_sites_enabled() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled")
}

fn default_error_log() -> PathBuf {
    PathBuf::from("/var/log/nginx/error.log")
}

fn default_access_log() -> PathBuf {
    PathBuf::from("/var/log/nginx/access.log")
}

fn default_body_size() -> String {
    "10M".to_string()
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_validate_command() -> Vec<String> {
    vec!["nginx".to_string(), "-t".to_string()]
}

fn default_reload_command() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "reload".to_string(),
        "nginx".to_string(),
    ]
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            sites_available: default_sites_available(),
            sites_enabled: default_sites_enabled(),
            error_log: default_error_log(),
            access_log: default_access_log(),
            client_max_body_size: default_body_size(),
            cert_dir: default_cert_dir(),
            validate_command: default_validate_command(),
            reload_command: default_reload_command(),
        }
    }
}

/// Certificate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// ACME account contact
    pub email: String,

    #[serde(default = "default_certbot_timeout")]
    pub timeout_secs: u64,
}

fn default_certbot_timeout() -> u64 {
    180
}

/// Verifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySettings {
    /// Attempts per check
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Per-attempt timeout
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    8000
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// Credential generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSettings {
    #[serde(default = "default_password_length")]
    pub password_length: usize,

    #[serde(default = "default_secret_bytes")]
    pub session_secret_bytes: usize,
}

fn default_password_length() -> usize {
    32
}

fn default_secret_bytes() -> usize {
    32
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            password_length: default_password_length(),
            session_secret_bytes: default_secret_bytes(),
        }
    }
}
