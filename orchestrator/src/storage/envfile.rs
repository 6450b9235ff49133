//! Environment descriptor (`.env`) read by the application at startup

use secrecy::ExposeSecret;
use url::Url;

use crate::errors::DeployError;
use crate::models::credentials::Credentials;
use crate::models::deployment::DeploymentTarget;
use crate::storage::settings::Settings;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const PGHOST: &str = "PGHOST";
pub const PGPORT: &str = "PGPORT";
pub const PGUSER: &str = "PGUSER";
pub const PGPASSWORD: &str = "PGPASSWORD";
pub const PGDATABASE: &str = "PGDATABASE";
pub const NODE_ENV: &str = "NODE_ENV";
pub const PORT: &str = "PORT";
pub const SESSION_SECRET: &str = "SESSION_SECRET";

/// Keys the orchestrator owns; anything else in the file is left alone
pub const RECOGNIZED_KEYS: &[&str] = &[
    NODE_ENV,
    PORT,
    DATABASE_URL,
    PGHOST,
    PGPORT,
    PGUSER,
    PGPASSWORD,
    PGDATABASE,
    SESSION_SECRET,
];

/// Keys whose values are never shown
pub const SECRET_KEYS: &[&str] = &[DATABASE_URL, PGPASSWORD, SESSION_SECRET];

/// Ordered `KEY=value` entries
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EnvDescriptor {
    entries: Vec<(String, String)>,
}

impl std::fmt::Debug for EnvDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(key, _)| key))
            .finish()
    }
}

impl EnvDescriptor {
    /// Parse `KEY=value` lines. Comments, blank lines and `export ` prefixes
    /// are accepted; matching surrounding quotes are stripped.
    pub fn parse(text: &str) -> Self {
        let mut descriptor = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            descriptor.set(key.trim(), unquote(value.trim()));
        }
        descriptor
    }

    /// The full descriptor for a deployment
    pub fn for_deployment(
        target: &DeploymentTarget,
        settings: &Settings,
        credentials: &Credentials,
    ) -> Result<Self, DeployError> {
        let mut descriptor = Self::default();
        for (key, value) in application_env(target, settings, credentials)? {
            descriptor.set(&key, value);
        }
        Ok(descriptor)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace, keeping the original position of existing keys
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Overwrite recognized keys with `update`'s values; other keys in
    /// `self` survive untouched
    pub fn merge(&mut self, update: &EnvDescriptor) {
        for (key, value) in &update.entries {
            if RECOGNIZED_KEYS.contains(&key.as_str()) {
                self.set(key, value.clone());
            }
        }
    }

    /// Credentials recorded in the descriptor, if complete
    pub fn credentials(&self, settings: &Settings) -> Option<Credentials> {
        let user = self.get(PGUSER)?;
        let password = self.get(PGPASSWORD)?;
        let database = self.get(PGDATABASE)?;
        let secret = self.get(SESSION_SECRET)?;
        if password.is_empty() || secret.is_empty() {
            return None;
        }
        if user != settings.database.user || database != settings.database.name {
            return None;
        }
        Some(Credentials::new(database, user, password, secret))
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# Managed by vpsctl; recognized keys are overwritten on deploy\n");
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Render with secret values masked
    pub fn render_redacted(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| {
                if SECRET_KEYS.contains(&key.as_str()) {
                    format!("{}=********", key)
                } else {
                    format!("{}={}", key, value)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Connection string for the application
pub fn database_url(settings: &Settings, credentials: &Credentials) -> Result<String, DeployError> {
    let db = &settings.database;
    let password = credentials.database_password.expose_secret();

    if !db.encode_password_in_url {
        return Ok(format!(
            "postgresql://{}:{}@{}:{}/{}",
            credentials.database_user, password, db.host, db.port, credentials.database_name
        ));
    }

    let mut url = Url::parse(&format!(
        "postgresql://{}:{}/{}",
        db.host, db.port, credentials.database_name
    ))
    .map_err(|e| DeployError::ConfigError(format!("database url: {}", e)))?;
    url.set_username(&credentials.database_user)
        .map_err(|_| DeployError::ConfigError("database url: cannot set user".to_string()))?;
    url.set_password(Some(password))
        .map_err(|_| DeployError::ConfigError("database url: cannot set password".to_string()))?;
    Ok(url.to_string())
}

/// Environment handed to the application, both in `.env` and in the
/// process descriptor. One source so the two can never disagree.
pub fn application_env(
    target: &DeploymentTarget,
    settings: &Settings,
    credentials: &Credentials,
) -> Result<Vec<(String, String)>, DeployError> {
    Ok(vec![
        (NODE_ENV.to_string(), settings.runtime_mode.clone()),
        (PORT.to_string(), target.app_port.to_string()),
        (DATABASE_URL.to_string(), database_url(settings, credentials)?),
        (PGHOST.to_string(), settings.database.host.clone()),
        (PGPORT.to_string(), settings.database.port.to_string()),
        (PGUSER.to_string(), credentials.database_user.clone()),
        (
            PGPASSWORD.to_string(),
            credentials.database_password.expose_secret().to_string(),
        ),
        (PGDATABASE.to_string(), credentials.database_name.clone()),
        (
            SESSION_SECRET.to_string(),
            credentials.session_secret.expose_secret().to_string(),
        ),
    ])
}
