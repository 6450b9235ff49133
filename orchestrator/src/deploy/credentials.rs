//! Credential generation

use rand::rngs::OsRng;
use rand::{CryptoRng, Rng, RngCore};
use tracing::info;

use crate::errors::DeployError;
use crate::models::credentials::Credentials;
use crate::models::deployment::DeploymentTarget;
use crate::storage::envfile::EnvDescriptor;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::hex;

/// Characters that survive shells, URLs and SQL literals unescaped
pub const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Where a run's credentials come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// Generate new ones
    Fresh,

    /// Reuse the ones in the installed environment descriptor
    Preserve,
}

/// Random password drawn from [`PASSWORD_ALPHABET`]
pub fn generate_password<R: RngCore + CryptoRng>(rng: &mut R, length: usize) -> String {
    (0..length)
        .map(|_| PASSWORD_ALPHABET[rng.gen_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

/// Hex-encoded random secret of `bytes` bytes
pub fn generate_session_secret<R: RngCore + CryptoRng>(rng: &mut R, bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Fresh credentials for the configured database
pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R, settings: &Settings) -> Credentials {
    Credentials::new(
        settings.database.name.clone(),
        settings.database.user.clone(),
        generate_password(rng, settings.credentials.password_length),
        generate_session_secret(rng, settings.credentials.session_secret_bytes),
    )
}

/// Fresh credentials from the operating system's random source
pub fn generate(settings: &Settings) -> Credentials {
    generate_with(&mut OsRng, settings)
}

/// Credentials recorded in the installed environment descriptor
pub async fn load_existing(
    layout: &StorageLayout,
    settings: &Settings,
) -> Result<Option<Credentials>, DeployError> {
    let env_file = layout.env_file();
    let Some(contents) = env_file.read_optional().await? else {
        return Ok(None);
    };
    Ok(EnvDescriptor::parse(&contents).credentials(settings))
}

/// Resolve credentials for a run
pub async fn resolve(
    mode: CredentialMode,
    layout: &StorageLayout,
    settings: &Settings,
) -> Result<Credentials, DeployError> {
    match mode {
        CredentialMode::Fresh => {
            info!("Generating fresh credentials");
            Ok(generate(settings))
        }
        CredentialMode::Preserve => match load_existing(layout, settings).await? {
            Some(existing) => {
                info!("Reusing credentials from {}", layout.env_file().path().display());
                Ok(existing)
            }
            None => {
                info!("No existing credentials found; generating fresh ones");
                Ok(generate(settings))
            }
        },
    }
}

/// Write the environment descriptor for `credentials`, keeping entries the
/// operator added by hand. The file is readable by its owner only.
pub async fn persist(
    layout: &StorageLayout,
    target: &DeploymentTarget,
    settings: &Settings,
    credentials: &Credentials,
) -> Result<(), DeployError> {
    let env_file = layout.env_file();
    let mut descriptor = match env_file.read_optional().await? {
        Some(contents) => EnvDescriptor::parse(&contents),
        None => EnvDescriptor::default(),
    };
    descriptor.merge(&EnvDescriptor::for_deployment(target, settings, credentials)?);
    env_file.write_atomic(descriptor.render().as_bytes()).await?;
    env_file.set_permissions_600().await?;
    info!("Wrote {}", env_file.path().display());
    Ok(())
}
