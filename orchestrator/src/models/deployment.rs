//! Deployment models

use std::path::PathBuf;

use serde::Serialize;

use crate::deploy::fsm::{Step, StepEvent, StepFsm, StepState};
use crate::errors::DeployError;
use crate::models::credentials::Credentials;

/// The declared state a run drives the host towards.
///
/// Built once from settings and CLI overrides; never mutated during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentTarget {
    /// Application name; doubles as the PM2 process name and nginx site name
    pub app_name: String,

    /// Installation directory holding the application checkout
    pub install_dir: PathBuf,

    /// Port nginx listens on
    pub public_port: u16,

    /// Port the application binds
    pub app_port: u16,

    /// nginx `server_name` pattern (`_` matches any host)
    pub domain: String,
}

impl DeploymentTarget {
    /// Validate the target before any host mutation
    pub fn validate(&self) -> Result<(), DeployError> {
        if !is_name(&self.app_name, true) {
            return Err(DeployError::ValidationError(format!(
                "app name {:?} must match [a-z_][a-z0-9_-]*",
                self.app_name
            )));
        }
        if !self.install_dir.is_absolute() {
            return Err(DeployError::ValidationError(format!(
                "install dir {:?} must be absolute",
                self.install_dir
            )));
        }
        if self.public_port == 0 || self.app_port == 0 {
            return Err(DeployError::ValidationError("ports must be non-zero".to_string()));
        }
        if self.public_port == self.app_port {
            return Err(DeployError::ValidationError(format!(
                "public port and app port are both {}",
                self.app_port
            )));
        }
        if self.server_names().is_empty() {
            return Err(DeployError::ValidationError("domain is empty".to_string()));
        }
        for name in self.server_names() {
            if !is_server_name(name) {
                return Err(DeployError::ValidationError(format!(
                    "invalid server name {:?}",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Names listed in the `server_name` directive
    pub fn server_names(&self) -> Vec<&str> {
        self.domain.split_whitespace().collect()
    }

    /// The first real host name, if any; used for certificates and probes
    pub fn primary_domain(&self) -> Option<&str> {
        self.server_names().into_iter().find(|name| {
            *name != "_"
                && !name.starts_with('*')
                && !name.starts_with('~')
                && name.parse::<std::net::IpAddr>().is_err()
                && name.contains('.')
        })
    }
}

/// `[a-z_][a-z0-9_]*`, optionally allowing `-`
pub fn is_name(value: &str, allow_dash: bool) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || (allow_dash && c == '-')
    })
}

fn is_server_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*'))
}

/// Outcome of a single verification check
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub attempts: u32,
    pub detail: String,
}

/// Everything a run reports back to the operator.
///
/// Produced once per run and discarded after being printed.
#[derive(Debug)]
pub struct DeploymentResult {
    pub run_id: String,
    steps: Vec<StepFsm>,
    pub checks: Vec<CheckOutcome>,
    credentials: Option<Credentials>,
    credentials_applied: bool,
}

impl DeploymentResult {
    /// Create a result for the given plan; steps run in the order given
    pub fn new(run_id: impl Into<String>, plan: &[Step]) -> Self {
        Self {
            run_id: run_id.into(),
            steps: plan.iter().map(|s| StepFsm::new(*s)).collect(),
            checks: Vec::new(),
            credentials: None,
            credentials_applied: false,
        }
    }

    pub fn steps(&self) -> &[StepFsm] {
        &self.steps
    }

    pub fn state(&self, step: Step) -> Option<&StepState> {
        self.steps.iter().find(|s| s.step() == step).map(|s| s.state())
    }

    /// Enter a step. Every earlier planned step must be settled.
    pub fn begin(&mut self, step: Step) -> Result<(), DeployError> {
        let index = self.index(step)?;
        if let Some(blocker) = self.steps[..index]
            .iter()
            .find(|s| !s.state().is_settled())
        {
            return Err(DeployError::TransitionError(format!(
                "{} cannot start while {} is {:?}",
                step,
                blocker.step(),
                blocker.state()
            )));
        }
        self.event(step, StepEvent::Begin)
    }

    /// Re-enter a failed step
    pub fn retry(&mut self, step: Step) -> Result<(), DeployError> {
        self.event(step, StepEvent::Retry)
    }

    pub fn succeed(&mut self, step: Step) -> Result<(), DeployError> {
        self.event(step, StepEvent::Succeed)
    }

    pub fn skip(&mut self, step: Step, why: impl Into<String>) -> Result<(), DeployError> {
        self.event(step, StepEvent::Skip(why.into()))
    }

    pub fn fail(&mut self, step: Step, why: impl Into<String>) -> Result<(), DeployError> {
        self.event(step, StepEvent::Fail(why.into()))
    }

    /// Mark the running step failed, ignoring steps that never started
    pub fn fail_running(&mut self, why: &str) {
        for fsm in self.steps.iter_mut() {
            if fsm.state() == &StepState::Running {
                let _ = fsm.process(StepEvent::Fail(why.to_string()));
            }
        }
    }

    /// Record credentials generated or loaded by this run
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
        self.credentials_applied = false;
    }

    /// Credentials are now persisted on the host
    pub fn mark_credentials_applied(&mut self) {
        self.credentials_applied = true;
    }

    /// Hand the credentials to the reporter. Returns `None` on every later
    /// call, and when the credentials never reached the host.
    pub fn take_credentials(&mut self) -> Option<Credentials> {
        if !self.credentials_applied {
            return None;
        }
        self.credentials.take()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|s| s.state().is_settled())
    }

    fn index(&self, step: Step) -> Result<usize, DeployError> {
        self.steps
            .iter()
            .position(|s| s.step() == step)
            .ok_or_else(|| DeployError::TransitionError(format!("{} is not part of this run", step)))
    }

    fn event(&mut self, step: Step, event: StepEvent) -> Result<(), DeployError> {
        let index = self.index(step)?;
        self.steps[index]
            .process(event)
            .map_err(DeployError::TransitionError)
    }
}
