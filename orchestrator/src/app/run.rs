//! Deploy and fix runs

use std::future::Future;

use colored::Colorize;
use secrecy::ExposeSecret;
use tracing::{error, info, info_span, Instrument};

use crate::app::options::{RunMode, RunOptions};
use crate::deploy::fixer::FIX_PLAN;
use crate::deploy::fsm::StepState;
use crate::deploy::orchestrator::{Orchestrator, DEPLOY_PLAN};
use crate::errors::DeployError;
use crate::host::Host;
use crate::models::deployment::{DeploymentResult, DeploymentTarget};
use crate::storage::settings::Settings;
use crate::utils::generate_uuid;

/// Everything a finished (or aborted) run has to say
#[derive(Debug)]
pub struct RunReport {
    pub result: DeploymentResult,
    pub error: Option<DeployError>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map(DeployError::exit_code).unwrap_or(0)
    }
}

/// Run the pipeline selected by `options` until it finishes or
/// `shutdown_signal` fires. The ledger always reflects where the run stopped.
pub async fn run(
    host: &dyn Host,
    settings: &Settings,
    target: &DeploymentTarget,
    options: &RunOptions,
    shutdown_signal: impl Future<Output = ()>,
) -> RunReport {
    let run_id = generate_uuid();
    let plan = match options.mode {
        RunMode::Deploy { .. } => DEPLOY_PLAN,
        RunMode::Fix { .. } => FIX_PLAN,
    };
    let mut result = DeploymentResult::new(run_id.clone(), plan);
    let orchestrator = Orchestrator::new(host, settings, target);
    let span = info_span!("run", run_id = %run_id, app = %target.app_name);

    let outcome = {
        let pipeline = async {
            match options.mode {
                RunMode::Deploy { credentials } => orchestrator.deploy(&mut result, credentials).await,
                RunMode::Fix { force_reset } => orchestrator.fix(&mut result, force_reset).await,
            }
        }
        .instrument(span);

        tokio::select! {
            outcome = pipeline => outcome,
            _ = shutdown_signal => {
                info!("Shutdown signal received, aborting run {}", run_id);
                Err(DeployError::Aborted)
            }
        }
    };

    if let Err(e) = &outcome {
        error!("Run {} stopped: {}", run_id, e);
        result.fail_running(&e.to_string());
    }
    RunReport {
        result,
        error: outcome.err(),
    }
}

/// Print the ledger, the checks and the failure. Credentials this run
/// applied to the host are printed once, last, whether or not a later step
/// failed.
///
/// Failure details go to stderr; everything else to stdout.
pub fn print_report(report: &mut RunReport) {
    println!();
    println!("{} {}", "Run".bold(), report.result.run_id);
    for fsm in report.result.steps() {
        let label = format!("{:<14}", fsm.step().to_string());
        let note = fsm.note().map(|n| format!(" ({})", n)).unwrap_or_default();
        let attempts = if fsm.attempts() > 1 {
            format!(" [{} attempts]", fsm.attempts())
        } else {
            String::new()
        };
        let state = match fsm.state() {
            StepState::Succeeded => "✓ done".green(),
            StepState::Skipped => "- skipped".yellow(),
            StepState::Failed => "✗ failed".red().bold(),
            StepState::Running => "… interrupted".red(),
            StepState::Pending => "· not run".dimmed(),
        };
        println!("  {} {}{}{}", label, state, attempts, note);
    }

    if !report.result.checks.is_empty() {
        println!();
        println!("{}", "Checks".bold());
        for check in &report.result.checks {
            let mark = if check.passed { "✓".green() } else { "✗".red() };
            println!(
                "  {} {} ({}, {} attempt(s))",
                mark, check.name, check.detail, check.attempts
            );
        }
    }

    if let Some(e) = &report.error {
        eprintln!();
        eprintln!("{} {}", "✗".red().bold(), e.to_string().red().bold());
        if let Some(diagnostics) = e.diagnostics() {
            eprintln!("{}", "--- diagnostics ---".yellow());
            eprintln!("{}", diagnostics);
        }
        if matches!(e, DeployError::StepFailed { .. }) {
            eprintln!("Run `vpsctl fix` once the cause is addressed.");
        }
    } else {
        println!();
        println!("{}", "✓ Deployment healthy".green().bold());
    }

    if let Some(creds) = report.result.take_credentials() {
        println!();
        println!("{}", "Credentials (shown once; store them now)".yellow().bold());
        println!("  database:       {}", creds.database_name);
        println!("  user:           {}", creds.database_user);
        println!("  password:       {}", creds.database_password.expose_secret());
        println!("  session secret: {}", creds.session_secret.expose_secret());
    }
}
