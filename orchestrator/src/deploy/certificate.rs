//! Let's Encrypt certificates through certbot

use std::time::Duration;

use tracing::info;

use crate::deploy::fsm::Step;
use crate::deploy::proxy::existing_certificate;
use crate::errors::DeployError;
use crate::host::{exec_checked, Cmd, Host};
use crate::models::deployment::DeploymentTarget;
use crate::storage::settings::Settings;

/// What the certificate step decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateOutcome {
    /// Nothing to do; carries the reason
    Skipped(String),

    /// A certificate was already in place
    Present,

    /// certbot issued a new certificate; the route must be re-applied
    Issued,
}

/// Obtain a certificate for the primary domain if TLS is configured and
/// none exists yet. Errors are for the caller to downgrade to warnings.
pub async fn ensure(
    host: &dyn Host,
    target: &DeploymentTarget,
    settings: &Settings,
) -> Result<CertificateOutcome, DeployError> {
    let Some(tls) = &settings.tls else {
        return Ok(CertificateOutcome::Skipped("tls not configured".to_string()));
    };
    let Some(domain) = target.primary_domain() else {
        return Ok(CertificateOutcome::Skipped(format!(
            "{:?} has no public host name",
            target.domain
        )));
    };
    if existing_certificate(settings, domain).await.is_some() {
        return Ok(CertificateOutcome::Present);
    }

    info!("Requesting certificate for {}", domain);
    let cmd = Cmd::new("certbot")
        .args(["certonly", "--nginx", "--non-interactive", "--agree-tos"])
        .args(["-m", tls.email.as_str(), "-d", domain])
        .timeout(Duration::from_secs(tls.timeout_secs));
    exec_checked(host, &cmd, Step::Certificate).await?;

    if existing_certificate(settings, domain).await.is_none() {
        return Err(DeployError::recoverable(
            Step::Certificate,
            format!(
                "certbot succeeded but no certificate found under {}",
                settings.proxy.cert_dir.display()
            ),
            String::new(),
        ));
    }
    Ok(CertificateOutcome::Issued)
}
