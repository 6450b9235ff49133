//! Error types for the deployment orchestrator

use std::time::Duration;

use thiserror::Error;

use crate::deploy::fsm::Step;

/// How a failure is allowed to propagate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Aborts the run immediately
    Fatal,

    /// Handled by a bounded retry inside the step
    Recoverable,

    /// Reported; the operator must run `fix`
    Operator,
}

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Command `{command}` could not be started: {reason}")]
    SpawnError { command: String, reason: String },

    #[error("Command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Port {port} is bound by a process outside the deployment: {owner}")]
    PortConflict { port: u16, owner: String },

    #[error("{step} failed: {reason}")]
    StepFailed {
        step: Step,
        reason: String,
        diagnostics: String,
        severity: Severity,
    },

    #[error("Invalid step transition: {0}")]
    TransitionError(String),

    #[error("Aborted by operator")]
    Aborted,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// A step failure that aborts the run
    pub fn fatal(step: Step, reason: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        DeployError::StepFailed {
            step,
            reason: reason.into(),
            diagnostics: diagnostics.into(),
            severity: Severity::Fatal,
        }
    }

    /// A step failure that the caller may retry within its budget
    pub fn recoverable(
        step: Step,
        reason: impl Into<String>,
        diagnostics: impl Into<String>,
    ) -> Self {
        DeployError::StepFailed {
            step,
            reason: reason.into(),
            diagnostics: diagnostics.into(),
            severity: Severity::Recoverable,
        }
    }

    /// A failure that needs an explicit `fix`
    pub fn operator(step: Step, reason: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        DeployError::StepFailed {
            step,
            reason: reason.into(),
            diagnostics: diagnostics.into(),
            severity: Severity::Operator,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            DeployError::StepFailed { severity, .. } => *severity,
            DeployError::HttpError(_) | DeployError::Timeout { .. } => Severity::Recoverable,
            DeployError::Aborted => Severity::Operator,
            _ => Severity::Fatal,
        }
    }

    /// Raw output captured from the responsible subsystem
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            DeployError::StepFailed { diagnostics, .. } if !diagnostics.is_empty() => {
                Some(diagnostics)
            }
            _ => None,
        }
    }

    /// The step the error was raised in, if any
    pub fn step(&self) -> Option<Step> {
        match self {
            DeployError::StepFailed { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::ConfigError(_) | DeployError::ValidationError(_) => 2,
            DeployError::Aborted => 130,
            _ => 1,
        }
    }

    /// The retry budget is spent: a recoverable failure becomes fatal
    pub fn escalate(self) -> Self {
        match self {
            DeployError::StepFailed {
                step,
                reason,
                diagnostics,
                severity: Severity::Recoverable,
            } => DeployError::StepFailed {
                step,
                reason: format!("{} (after retry)", reason),
                diagnostics,
                severity: Severity::Fatal,
            },
            other => other,
        }
    }

    /// Re-tag an error as belonging to `step`, keeping its diagnostics
    pub fn in_step(self, step: Step) -> Self {
        match self {
            err @ DeployError::StepFailed { .. } => err,
            DeployError::PortConflict { port, owner } => DeployError::fatal(
                step,
                format!("port {port} is bound by a process outside the deployment"),
                owner,
            ),
            other => DeployError::fatal(step, other.to_string(), String::new()),
        }
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}
