//! Error taxonomy shared by the replay core, the engine and the providers.
//!
//! Three layers exist:
//! - [`FailureDetails`]: a task failure exactly as a dispatcher reported it.
//!   Failures flagged `retriable` are transient and may be absorbed by a
//!   [`crate::RetryPolicy`].
//! - [`OrchestrationError`]: what orchestrator code observes and what a failed
//!   instance records in its history.
//! - [`EngineError`]: synchronous caller errors from the engine API; returning
//!   one never mutates instance state.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::history::{HistoryError, TaskKind};

/// Failure payload delivered for a task by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FailureDetails {
    pub kind: String,
    pub message: String,
    pub retriable: bool,
}

impl FailureDetails {
    /// A failure that a retry policy is allowed to absorb.
    pub fn transient(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retriable: true,
        }
    }

    /// A failure that is never retried, regardless of policy.
    pub fn permanent(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retriable: false,
        }
    }
}

/// One failed branch of a fan-out, by submission index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFailure {
    pub index: usize,
    pub error: OrchestrationError,
}

/// Errors visible to orchestrator code and recorded as terminal results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum OrchestrationError {
    #[error("task {task_id} ({name}) failed after {attempts} attempt(s): {failure}")]
    PermanentTaskFailure {
        task_id: u64,
        name: String,
        attempts: u32,
        failure: FailureDetails,
    },
    #[error("{} of {total} fanned-out tasks failed", .failures.len())]
    FanIn { total: usize, failures: Vec<BranchFailure> },
    #[error("{0}")]
    Application(String),
    #[error("nondeterministic: {0}")]
    DeterminismViolation(String),
    #[error("history ordering violation: expected sequence {expected}, found {found}")]
    OrderingViolation { expected: u64, found: u64 },
    #[error("orchestrator panicked: {0}")]
    Panicked(String),
    #[error("terminated: {0}")]
    Terminated(String),
}

impl OrchestrationError {
    /// Short, stable name of the error class. Used as `FailureDetails::kind`
    /// when a sub-orchestration failure is reported to its parent.
    pub fn kind_name(&self) -> &'static str {
        match self {
            OrchestrationError::PermanentTaskFailure { .. } => "PermanentTaskFailure",
            OrchestrationError::FanIn { .. } => "FanIn",
            OrchestrationError::Application(_) => "Application",
            OrchestrationError::DeterminismViolation(_) => "DeterminismViolation",
            OrchestrationError::OrderingViolation { .. } => "OrderingViolation",
            OrchestrationError::Panicked(_) => "Panicked",
            OrchestrationError::Terminated(_) => "Terminated",
        }
    }

    /// Engine-level failures: never retried, always surfaced to an operator.
    pub fn is_engine_failure(&self) -> bool {
        matches!(
            self,
            OrchestrationError::DeterminismViolation(_) | OrchestrationError::OrderingViolation { .. }
        )
    }
}

impl From<String> for OrchestrationError {
    fn from(message: String) -> Self {
        OrchestrationError::Application(message)
    }
}

impl From<&str> for OrchestrationError {
    fn from(message: &str) -> Self {
        OrchestrationError::Application(message.to_string())
    }
}

impl From<HistoryError> for OrchestrationError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::OrderingViolation { expected, found } => {
                OrchestrationError::OrderingViolation { expected, found }
            }
        }
    }
}

/// Aggregate result of a failed `wait_all`: every branch outcome, in
/// submission order, so callers can inspect partial results.
#[derive(Debug, Clone, PartialEq)]
pub struct FanInError<T> {
    pub outcomes: Vec<Result<T, OrchestrationError>>,
}

impl<T> FanInError<T> {
    pub fn failures(&self) -> impl Iterator<Item = (usize, &OrchestrationError)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().err().map(|e| (i, e)))
    }

    pub fn successes(&self) -> impl Iterator<Item = (usize, &T)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().ok().map(|v| (i, v)))
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_err()).count()
    }
}

impl<T> fmt::Display for FanInError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} fanned-out tasks failed",
            self.failure_count(),
            self.outcomes.len()
        )
    }
}

impl<T: fmt::Debug> std::error::Error for FanInError<T> {}

impl<T> From<FanInError<T>> for OrchestrationError {
    fn from(err: FanInError<T>) -> Self {
        let total = err.outcomes.len();
        let failures = err
            .outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(index, o)| o.err().map(|error| BranchFailure { index, error }))
            .collect();
        OrchestrationError::FanIn { total, failures }
    }
}

/// Synchronous errors returned by the engine API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    #[error("unknown task {task_id} for instance {instance}")]
    UnknownTask { instance: String, task_id: u64 },
    #[error("orchestration not registered: {0}")]
    UnknownOrchestration(String),
    #[error("completion for task {task_id} does not match its kind ({kind})")]
    CompletionKindMismatch { task_id: u64, kind: TaskKind },
    #[error("history store: {0}")]
    Store(String),
}
