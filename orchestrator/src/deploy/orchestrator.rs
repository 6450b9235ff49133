//! The deployment pipeline.
//!
//! Steps run strictly one after another against a single host. Each step is
//! recorded in the run's ledger, which refuses to start a step before every
//! earlier one has settled.

use tracing::{info, warn};

use crate::deploy::builder;
use crate::deploy::certificate::{self, CertificateOutcome};
use crate::deploy::credentials::{self, CredentialMode};
use crate::deploy::database::{self, DbMode};
use crate::deploy::fsm::Step;
use crate::deploy::prereqs;
use crate::deploy::proxy::{self, ProxyOutcome};
use crate::deploy::supervisor;
use crate::deploy::verifier;
use crate::errors::{DeployError, Severity};
use crate::host::Host;
use crate::models::credentials::Credentials;
use crate::models::deployment::{DeploymentResult, DeploymentTarget};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Steps of a full deployment, in execution order
pub const DEPLOY_PLAN: &[Step] = &[
    Step::Credentials,
    Step::Prerequisites,
    Step::Database,
    Step::Build,
    Step::Supervisor,
    Step::Proxy,
    Step::Certificate,
    Step::Verify,
];

/// Parts of the build step to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BuildScope {
    pub install: bool,
    pub migrate: bool,
    pub compile: bool,
}

impl BuildScope {
    pub const FULL: BuildScope = BuildScope {
        install: true,
        migrate: true,
        compile: true,
    };

    pub fn is_empty(&self) -> bool {
        !(self.install || self.migrate || self.compile)
    }
}

/// Record the outcome of the running step in the ledger
pub(crate) fn settle<T>(
    result: &mut DeploymentResult,
    step: Step,
    outcome: Result<T, DeployError>,
) -> Result<T, DeployError> {
    match outcome {
        Ok(value) => {
            result.succeed(step)?;
            Ok(value)
        }
        Err(e) => {
            result.fail(step, e.to_string())?;
            Err(e)
        }
    }
}

/// Drives one host toward one deployment target
pub struct Orchestrator<'a> {
    pub(crate) host: &'a dyn Host,
    pub(crate) settings: &'a Settings,
    pub(crate) target: &'a DeploymentTarget,
    pub(crate) layout: StorageLayout,
}

impl<'a> Orchestrator<'a> {
    pub fn new(host: &'a dyn Host, settings: &'a Settings, target: &'a DeploymentTarget) -> Self {
        Self {
            host,
            settings,
            target,
            layout: StorageLayout::new(target, settings),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Run the full pipeline. `result` must be planned with [`DEPLOY_PLAN`].
    pub async fn deploy(
        &self,
        result: &mut DeploymentResult,
        mode: CredentialMode,
    ) -> Result<(), DeployError> {
        self.target.validate()?;
        self.settings.validate()?;
        info!(
            "Deploying {} to {} (app port {}, public port {})",
            self.target.app_name,
            self.target.install_dir.display(),
            self.target.app_port,
            self.target.public_port
        );

        result.begin(Step::Credentials)?;
        let outcome = credentials::resolve(mode, &self.layout, self.settings).await;
        let creds = settle(result, Step::Credentials, outcome)?;
        result.set_credentials(creds.clone());

        result.begin(Step::Prerequisites)?;
        let outcome = prereqs::ensure(self.host, &prereqs::prerequisites_for(self.settings)).await;
        let report = settle(result, Step::Prerequisites, outcome)?;
        if report.is_noop() {
            info!("All prerequisites already present");
        }

        result.begin(Step::Database)?;
        let outcome = self.provision_database(result, &creds, DbMode::Ensure).await;
        settle(result, Step::Database, outcome)?;

        result.begin(Step::Build)?;
        let outcome = self.build(result, &creds, BuildScope::FULL).await;
        settle(result, Step::Build, outcome)?;

        result.begin(Step::Supervisor)?;
        let outcome =
            supervisor::apply(self.host, self.target, self.settings, &self.layout, &creds).await;
        settle(result, Step::Supervisor, outcome)?;

        result.begin(Step::Proxy)?;
        self.configure_proxy(result).await?;

        result.begin(Step::Certificate)?;
        self.certificate(result).await?;

        result.begin(Step::Verify)?;
        let outcome =
            verifier::verify(self.host, self.target, self.settings, &mut result.checks).await;
        settle(result, Step::Verify, outcome)
    }

    /// Provision the role and database, retrying once in reset mode when the
    /// trial connection fails, then persist the environment descriptor
    pub(crate) async fn provision_database(
        &self,
        result: &mut DeploymentResult,
        creds: &Credentials,
        mode: DbMode,
    ) -> Result<(), DeployError> {
        match database::provision_verified(self.host, self.settings, creds, mode).await {
            Ok(()) => {}
            Err(e) if e.severity() == Severity::Recoverable && mode == DbMode::Ensure => {
                warn!("{}; resetting database and retrying once", e);
                result.fail(Step::Database, e.to_string())?;
                result.retry(Step::Database)?;
                database::provision_verified(self.host, self.settings, creds, DbMode::Reset)
                    .await
                    .map_err(DeployError::escalate)?;
            }
            Err(e) => return Err(e.escalate()),
        }

        credentials::persist(&self.layout, self.target, self.settings, creds).await?;
        result.mark_credentials_applied();
        Ok(())
    }

    /// Install dependencies, apply the schema and compile, as scoped.
    ///
    /// Schema application lives here because the migration tool is itself
    /// one of the application's dependencies.
    pub(crate) async fn build(
        &self,
        result: &mut DeploymentResult,
        creds: &Credentials,
        scope: BuildScope,
    ) -> Result<(), DeployError> {
        if scope.install {
            builder::install_dependencies(self.host, &self.layout, self.settings).await?;
        }
        if scope.migrate {
            database::migrate(
                self.host,
                self.target,
                self.settings,
                creds,
                &self.layout.install_dir,
            )
            .await?;
        }
        if !scope.compile {
            return Ok(());
        }

        let ceiling = builder::memory_ceiling(self.settings, self.host.total_memory_mib());
        match builder::build(self.host, &self.layout, self.settings, ceiling).await {
            Ok(()) => Ok(()),
            Err(e) if e.severity() == Severity::Recoverable => {
                let reduced = builder::reduced_ceiling(ceiling);
                warn!("{}; retrying once with {} MiB", e, reduced);
                result.fail(Step::Build, e.to_string())?;
                result.retry(Step::Build)?;
                builder::build(self.host, &self.layout, self.settings, reduced)
                    .await
                    .map_err(DeployError::escalate)
            }
            Err(e) => Err(e),
        }
    }

    async fn configure_proxy(&self, result: &mut DeploymentResult) -> Result<(), DeployError> {
        let route = proxy::route_for(self.target, self.settings).await;
        match proxy::apply(self.host, &self.layout, self.settings, &route).await {
            Ok(ProxyOutcome::Applied) => result.succeed(Step::Proxy),
            Ok(ProxyOutcome::Unchanged) => result.skip(Step::Proxy, "route unchanged"),
            Ok(ProxyOutcome::RolledBack(diagnostics)) => {
                warn!("Proxy reload failed and was rolled back:\n{}", diagnostics);
                result.skip(Step::Proxy, "reload failed; previous configuration restored")
            }
            Err(e) => {
                result.fail(Step::Proxy, e.to_string())?;
                Err(e)
            }
        }
    }

    /// Certificate problems never fail the run; the HTTP route stays live
    async fn certificate(&self, result: &mut DeploymentResult) -> Result<(), DeployError> {
        match certificate::ensure(self.host, self.target, self.settings).await {
            Ok(CertificateOutcome::Skipped(why)) => result.skip(Step::Certificate, why),
            Ok(CertificateOutcome::Present) => result.succeed(Step::Certificate),
            Ok(CertificateOutcome::Issued) => {
                let route = proxy::route_for(self.target, self.settings).await;
                match proxy::apply(self.host, &self.layout, self.settings, &route).await {
                    Ok(ProxyOutcome::RolledBack(diagnostics)) => {
                        warn!("HTTPS route rolled back:\n{}", diagnostics)
                    }
                    Ok(_) => info!("HTTPS route enabled"),
                    Err(e) => warn!("HTTPS route rejected: {}", e),
                }
                result.succeed(Step::Certificate)
            }
            Err(e) => {
                warn!("Certificate not issued: {}", e);
                result.skip(Step::Certificate, format!("certificate not issued: {}", e))
            }
        }
    }
}
