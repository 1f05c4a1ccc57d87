//! Core types and error definitions for the Cohort coordination kernel.
//!
//! This crate provides the foundational types shared across all Cohort crates:
//! the error taxonomy, task priorities, and the step-executor capability that
//! the scheduler and the workflow engine invoke to actually run work.
//!
//! # Main types
//!
//! - [`CohortError`] — Unified error enum for every kernel component.
//! - [`CohortResult`] — Convenience alias for `Result<T, CohortError>`.
//! - [`ErrorKind`] / [`TaskError`] — Serializable error records attached to tasks and runs.
//! - [`Priority`] — Ordered priority level shared by queues, tasks and delegation.
//! - [`StepExecutor`] — The opaque capability that executes a unit of work on an agent.

/// Step-executor capability consumed by the scheduler and the workflow engine.
pub mod executor;

pub use executor::{StepExecutor, StepInput, StepOrigin};

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for the Cohort kernel.
///
/// Each variant corresponds to one entry of the kernel's error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    /// A bounded queue is at its configured capacity.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// An unknown task, queue, barrier, hierarchy, workflow or step was referenced.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Scheduling or delegation found no eligible agent.
    #[error("No agent available: {0}")]
    NoAgentAvailable(String),

    /// An execution or a barrier wait exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Reserved for the agent catalog: an agent's declared dependencies are not met.
    #[error("Dependency unsatisfied: {0}")]
    DependencyUnsatisfied(String),

    /// Opaque failure reported by the step executor.
    #[error("Execution failed: {message}")]
    ExecutionFailed {
        /// Human-readable failure description.
        message: String,
        /// Whether the scheduler may retry the work.
        retryable: bool,
    },

    /// A caller violated an operation's contract (missing fields, malformed graph).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`CohortError`].
pub type CohortResult<T> = Result<T, CohortError>;

impl CohortError {
    /// Build a retryable [`CohortError::ExecutionFailed`].
    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
            retryable: true,
        }
    }

    /// Build an [`CohortError::ExecutionFailed`] that must not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
            retryable: false,
        }
    }

    /// The taxonomy entry this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CohortError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            CohortError::NotFound(_) => ErrorKind::NotFound,
            CohortError::NoAgentAvailable(_) => ErrorKind::NoAgentAvailable,
            CohortError::Timeout(_) => ErrorKind::Timeout,
            CohortError::DependencyUnsatisfied(_) => ErrorKind::DependencyUnsatisfied,
            CohortError::ExecutionFailed { .. } | CohortError::Json(_) | CohortError::Io(_) => {
                ErrorKind::ExecutionFailed
            }
            CohortError::InvalidInput(_) | CohortError::Config(_) => ErrorKind::InvalidInput,
        }
    }

    /// Whether a failed execution carrying this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            CohortError::ExecutionFailed { retryable, .. } => *retryable,
            CohortError::InvalidInput(_) | CohortError::NotFound(_) | CohortError::Config(_) => {
                false
            }
            _ => true,
        }
    }
}

/// Serializable classification of a [`CohortError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`CohortError::CapacityExceeded`].
    CapacityExceeded,
    /// See [`CohortError::NotFound`].
    NotFound,
    /// See [`CohortError::NoAgentAvailable`].
    NoAgentAvailable,
    /// See [`CohortError::Timeout`].
    Timeout,
    /// See [`CohortError::DependencyUnsatisfied`].
    DependencyUnsatisfied,
    /// See [`CohortError::ExecutionFailed`].
    ExecutionFailed,
    /// See [`CohortError::InvalidInput`].
    InvalidInput,
}

/// Error record attached to a task or a workflow run once it fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Taxonomy entry.
    pub kind: ErrorKind,
    /// Rendered error message.
    pub message: String,
}

impl From<&CohortError> for TaskError {
    fn from(err: &CohortError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<CohortError> for TaskError {
    fn from(err: CohortError) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// --- Priority ---

/// Priority level of a queued item or task. Ordered `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// The default level. Also accepted as `medium`.
    #[default]
    #[serde(alias = "medium")]
    Normal,
    /// Preferred over normal work.
    High,
    /// Always dequeued first.
    Critical,
}

impl Priority {
    /// All levels, lowest first.
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}
