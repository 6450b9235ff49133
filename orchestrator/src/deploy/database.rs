//! PostgreSQL database and role provisioning

use std::path::Path;
use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::deploy::fsm::Step;
use crate::errors::DeployError;
use crate::host::{exec_checked, Cmd, Host};
use crate::models::credentials::Credentials;
use crate::models::deployment::DeploymentTarget;
use crate::storage::envfile::application_env;
use crate::storage::settings::Settings;

const ADMIN_TIMEOUT: Duration = Duration::from_secs(60);
const MIGRATE_TIMEOUT: Duration = Duration::from_secs(300);

/// How to treat an existing database and role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbMode {
    /// Create what is missing, update the role password
    Ensure,

    /// Drop both, then create them again
    Reset,
}

/// Quote a value as a SQL string literal
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// psql script that converges the role and database on `credentials`.
///
/// Identifiers are validated by `Settings::validate`, so they are spliced in
/// unquoted.
pub fn provision_script(credentials: &Credentials, mode: DbMode) -> String {
    let db = &credentials.database_name;
    let user = &credentials.database_user;
    let password = literal(credentials.database_password.expose_secret());
    let mut sql = String::new();

    if mode == DbMode::Reset {
        sql.push_str(&format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = {db_lit} AND pid <> pg_backend_pid();\n\
             DROP DATABASE IF EXISTS {db};\n\
             DROP ROLE IF EXISTS {user};\n",
            db_lit = literal(db),
        ));
    }

    sql.push_str(&format!(
        "DO $$\nBEGIN\n  IF NOT EXISTS (SELECT FROM pg_catalog.pg_roles WHERE rolname = {user_lit}) THEN\n    \
         CREATE ROLE {user} LOGIN PASSWORD {password};\n  ELSE\n    \
         ALTER ROLE {user} WITH LOGIN PASSWORD {password};\n  END IF;\nEND\n$$;\n\
         SELECT 'CREATE DATABASE {db} OWNER {user}' \
         WHERE NOT EXISTS (SELECT FROM pg_database WHERE datname = {db_lit})\\gexec\n\
         ALTER DATABASE {db} OWNER TO {user};\n\
         GRANT ALL PRIVILEGES ON DATABASE {db} TO {user};\n\
         \\connect {db}\n\
         GRANT ALL ON SCHEMA public TO {user};\n\
         ALTER SCHEMA public OWNER TO {user};\n",
        user_lit = literal(user),
        db_lit = literal(db),
    ));

    sql
}

/// Run the provisioning script as the postgres superuser
pub async fn provision(
    host: &dyn Host,
    credentials: &Credentials,
    mode: DbMode,
) -> Result<(), DeployError> {
    info!(
        "Provisioning database {} for role {} ({:?})",
        credentials.database_name, credentials.database_user, mode
    );
    let cmd = Cmd::new("sudo")
        .args(["-u", "postgres", "psql", "-v", "ON_ERROR_STOP=1", "--no-psqlrc", "-q"])
        .cwd("/tmp")
        .stdin(provision_script(credentials, mode))
        .timeout(ADMIN_TIMEOUT);
    exec_checked(host, &cmd, Step::Database).await?;
    Ok(())
}

/// Trial connection with the application's own credentials
pub async fn check_connection(
    host: &dyn Host,
    settings: &Settings,
    credentials: &Credentials,
) -> Result<(), DeployError> {
    let db = &settings.database;
    let cmd = Cmd::new("psql")
        .args(["-h", db.host.as_str(), "-p", db.port.to_string().as_str()])
        .args([
            "-U",
            credentials.database_user.as_str(),
            "-d",
            credentials.database_name.as_str(),
        ])
        .args(["-tAc", "SELECT 1"])
        .env("PGPASSWORD", credentials.database_password.expose_secret())
        .env("PGCONNECT_TIMEOUT", db.connect_timeout_secs.to_string())
        .timeout(Duration::from_secs(db.connect_timeout_secs + 5));

    let output = host.exec(&cmd).await.map_err(|e| e.in_step(Step::Database))?;
    if output.success() && output.stdout.trim() == "1" {
        return Ok(());
    }
    Err(DeployError::recoverable(
        Step::Database,
        format!(
            "trial connection as {} to {} failed",
            credentials.database_user, credentials.database_name
        ),
        output.diagnostics(),
    ))
}

/// Apply the application's schema with its own migration tool
pub async fn migrate(
    host: &dyn Host,
    target: &DeploymentTarget,
    settings: &Settings,
    credentials: &Credentials,
    install_dir: &Path,
) -> Result<(), DeployError> {
    info!("Applying schema: {}", settings.database.migrate_command);
    let mut cmd = Cmd::shell(settings.database.migrate_command.clone())
        .cwd(install_dir)
        .timeout(MIGRATE_TIMEOUT);
    for (key, value) in application_env(target, settings, credentials)? {
        cmd = cmd.env(key, value);
    }
    exec_checked(host, &cmd, Step::Database).await?;
    Ok(())
}

/// Provision, then prove the credentials work.
///
/// A failed trial connection is returned as a recoverable error so the
/// caller can retry once in [`DbMode::Reset`].
pub async fn provision_verified(
    host: &dyn Host,
    settings: &Settings,
    credentials: &Credentials,
    mode: DbMode,
) -> Result<(), DeployError> {
    provision(host, credentials, mode).await?;
    match check_connection(host, settings, credentials).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("Database verification failed after {:?}: {}", mode, e);
            Err(e)
        }
    }
}
