//! Operator-invoked recovery.
//!
//! A bounded subset of the pipeline: capture logs, stop the process, settle
//! credentials, rebuild only what is missing, then supervise and verify
//! again. Prerequisites and the proxy route are left alone.

use tracing::info;

use crate::deploy::credentials;
use crate::deploy::database::{self, DbMode};
use crate::deploy::fsm::Step;
use crate::deploy::orchestrator::{settle, BuildScope, Orchestrator};
use crate::deploy::supervisor;
use crate::deploy::verifier;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::host::DIAGNOSTIC_LINES;
use crate::models::credentials::Credentials;
use crate::models::deployment::DeploymentResult;
use crate::utils::redact;

/// Steps of a fix run, in execution order
pub const FIX_PLAN: &[Step] = &[
    Step::Credentials,
    Step::Database,
    Step::Build,
    Step::Supervisor,
    Step::Verify,
];

impl Orchestrator<'_> {
    /// Recover a partially working deployment. With `force_reset` the
    /// credentials are regenerated and the database reset even when the
    /// current ones still connect.
    pub async fn fix(
        &self,
        result: &mut DeploymentResult,
        force_reset: bool,
    ) -> Result<(), DeployError> {
        self.target.validate()?;
        self.settings.validate()?;

        let existing = credentials::load_existing(&self.layout, self.settings).await?;
        let snapshot = self.capture_diagnostics(&result.run_id, existing.as_ref()).await?;
        info!("Diagnostics captured in {}", snapshot.path().display());

        supervisor::stop(self.host, &self.target.app_name).await?;

        result.begin(Step::Credentials)?;
        let reusable = match existing {
            Some(creds) if !force_reset => {
                match database::check_connection(self.host, self.settings, &creds).await {
                    Ok(()) => Some(creds),
                    Err(e) => {
                        info!("Existing credentials do not connect: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };
        let (creds, reset) = match reusable {
            Some(creds) => {
                info!("Database reachable; keeping existing credentials");
                (creds, false)
            }
            None => {
                info!("Regenerating credentials; the database will be reset");
                (credentials::generate(self.settings), true)
            }
        };
        result.set_credentials(creds.clone());
        result.succeed(Step::Credentials)?;

        result.begin(Step::Database)?;
        if reset {
            let outcome = self.provision_database(result, &creds, DbMode::Reset).await;
            settle(result, Step::Database, outcome)?;
        } else {
            // Rewrite the descriptor so it and the process environment agree.
            let outcome =
                credentials::persist(&self.layout, self.target, self.settings, &creds).await;
            settle(result, Step::Database, outcome)?;
        }

        result.begin(Step::Build)?;
        let scope = self.fix_build_scope(reset).await;
        if scope.is_empty() {
            result.skip(Step::Build, "artifact present")?;
        } else {
            let outcome = self.build(result, &creds, scope).await;
            settle(result, Step::Build, outcome)?;
        }

        result.begin(Step::Supervisor)?;
        let outcome =
            supervisor::apply(self.host, self.target, self.settings, &self.layout, &creds).await;
        settle(result, Step::Supervisor, outcome)?;

        result.begin(Step::Verify)?;
        let outcome =
            verifier::verify(self.host, self.target, self.settings, &mut result.checks).await;
        settle(result, Step::Verify, outcome)
    }

    /// Rebuild only when the artifact is gone; re-apply the schema when the
    /// database was reset
    async fn fix_build_scope(&self, reset: bool) -> BuildScope {
        let compile = !self.layout.artifact_file().is_non_empty().await;
        let needs_modules = compile || reset;
        let install = needs_modules && !self.layout.node_modules().exists().await;
        BuildScope {
            install,
            migrate: reset,
            compile,
        }
    }

    /// Save process and proxy logs as they were before anything changed
    async fn capture_diagnostics(
        &self,
        run_id: &str,
        creds: Option<&Credentials>,
    ) -> Result<File, DeployError> {
        let name = &self.target.app_name;
        let process = match supervisor::describe(self.host, name).await {
            Ok(Some(p)) => format!(
                "status={} pid={:?} restarts={}",
                p.pm2_env.status,
                p.live_pid(),
                p.pm2_env.restart_time
            ),
            Ok(None) => "not registered".to_string(),
            Err(e) => e.to_string(),
        };
        let logs = supervisor::log_tail(self.host, name, DIAGNOSTIC_LINES * 5).await;
        let proxy_log = File::new(&self.settings.proxy.error_log)
            .tail(DIAGNOSTIC_LINES)
            .await;

        let text = format!(
            "vpsctl fix {}\ncaptured {}\n\n== process ==\n{}\n\n== pm2 logs ==\n{}\n\n== {} ==\n{}\n",
            run_id,
            chrono::Utc::now().to_rfc3339(),
            process,
            logs,
            self.settings.proxy.error_log.display(),
            proxy_log
        );
        let secrets = creds.map(|c| c.secret_values()).unwrap_or_default();
        let file = File::new(self.layout.log_dir.join(format!(
            "fix-{}.log",
            chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
        )));
        file.write_atomic(redact(&text, &secrets).as_bytes()).await?;
        file.set_permissions_600().await?;
        Ok(file)
    }
}
