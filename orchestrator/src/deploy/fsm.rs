//! Finite state machine for pipeline steps

use std::fmt;

use serde::{Deserialize, Serialize};

/// A pipeline step, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Credentials,
    Prerequisites,
    Database,
    Build,
    Supervisor,
    Proxy,
    Certificate,
    Verify,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Credentials => "credentials",
            Step::Prerequisites => "prerequisites",
            Step::Database => "database",
            Step::Build => "build",
            Step::Supervisor => "supervisor",
            Step::Proxy => "proxy",
            Step::Certificate => "certificate",
            Step::Verify => "verify",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    /// Not started
    Pending,

    /// In progress
    Running,

    /// Completed and verified
    Succeeded,

    /// Nothing to do
    Skipped,

    /// Failed
    Failed,
}

impl StepState {
    /// Whether a later step may rely on this step's postcondition
    pub fn is_settled(&self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Skipped)
    }
}

/// Step event
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// Start the step
    Begin,

    /// Postcondition verified
    Succeed,

    /// Postcondition already held
    Skip(String),

    /// Step failed
    Fail(String),

    /// Re-enter a failed step
    Retry,
}

/// State machine for one step
#[derive(Debug, Clone)]
pub struct StepFsm {
    step: Step,
    state: StepState,
    note: Option<String>,
    attempts: u32,
}

impl StepFsm {
    /// Create a new FSM in pending state
    pub fn new(step: Step) -> Self {
        Self {
            step,
            state: StepState::Pending,
            note: None,
            attempts: 0,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Get current state
    pub fn state(&self) -> &StepState {
        &self.state
    }

    /// Failure reason or skip note
    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    /// Number of times the step was entered
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: StepEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (StepState::Pending, StepEvent::Begin) => {
                self.attempts += 1;
                StepState::Running
            }

            (StepState::Running, StepEvent::Succeed) => {
                self.note = None;
                StepState::Succeeded
            }
            (StepState::Running, StepEvent::Skip(why)) => {
                self.note = Some(why.clone());
                StepState::Skipped
            }
            (StepState::Running, StepEvent::Fail(err)) => {
                self.note = Some(err.clone());
                StepState::Failed
            }

            (StepState::Failed, StepEvent::Retry) => {
                self.attempts += 1;
                StepState::Running
            }

            (state, event) => {
                return Err(format!("{}: {:?} -> {:?}", self.step, state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }

    /// Check if the step can be retried
    pub fn can_retry(&self, max_attempts: u32) -> bool {
        self.state == StepState::Failed && self.attempts < max_attempts
    }
}
