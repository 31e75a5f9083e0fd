// Uniform step outcome produced by builtin actions and plugins alike.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{CANCELED_REASON, UNKNOWN_STEP_REASON};

/// Closed set of step statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    Success,
    Fail,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Success => write!(f, "Success"),
            StepStatus::Fail => write!(f, "Fail"),
        }
    }
}

/// The result of one step: a status plus a free-text reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub reason: String,
}

impl StepResult {
    pub fn success() -> Self {
        Self {
            status: StepStatus::Success,
            reason: String::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Fail,
            reason: reason.into(),
        }
    }

    /// The step was stopped because the job was canceled.
    pub fn canceled() -> Self {
        Self::fail(CANCELED_REASON)
    }

    /// Dispatch miss: the action is neither builtin nor a staged plugin.
    pub fn unknown_step(action_name: &str) -> Self {
        Self::fail(format!("{UNKNOWN_STEP_REASON}: {action_name}"))
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    /// True when this result came from cancellation rather than the step itself.
    pub fn is_canceled(&self) -> bool {
        self.status == StepStatus::Fail && self.reason == CANCELED_REASON
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{} ({})", self.status, self.reason)
        }
    }
}
