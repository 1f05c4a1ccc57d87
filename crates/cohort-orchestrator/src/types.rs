use chrono::{DateTime, Utc};
use cohort_core::{CohortError, Priority, TaskError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Status of a task, shared by the scheduler and the delegation engine.
///
/// `Pending -> Assigned -> Executing -> {Completed | Failed | Cancelled}`;
/// a retried failure moves back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in a queue or a task table.
    Pending,
    /// An agent has been chosen.
    Assigned,
    /// The agent is running the task. Also accepted as `in_progress`.
    #[serde(alias = "in_progress")]
    Executing,
    /// Finished successfully.
    Completed,
    /// Finished with an error and no retries left.
    Failed,
    /// Withdrawn by a caller.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Executing => write!(f, "executing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a caller submits: the work itself plus routing and retry hints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Free-text description handed to the executor.
    pub description: String,
    /// Short label; defaults to the description.
    #[serde(default)]
    pub title: Option<String>,
    /// Only agents declaring this capability are eligible.
    #[serde(default)]
    pub required_capability: Option<String>,
    /// Only agents carrying this tag are eligible.
    #[serde(default)]
    pub tag: Option<String>,
    /// Opaque payload passed through to the executor.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Overrides the scheduler's retry ceiling.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides the scheduler's execution timeout, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Free-form caller metadata, never inspected.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capability = Some(capability.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// A unit of work tracked by the scheduler or a hierarchy's task table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Set whenever the status is `Assigned` or `Executing`.
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub required_capability: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set on every terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Task {
    pub fn new(description: impl Into<String>, priority: Priority) -> Self {
        let description = description.into();
        Self {
            id: Uuid::new_v4(),
            title: description.clone(),
            description,
            priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            required_capability: None,
            tag: None,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 0,
            timeout_ms: None,
            result: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Build a pending task from a submission, falling back to
    /// `default_max_retries` when the `TaskSpec` carries no override.
    pub fn from_spec(spec: TaskSpec, priority: Priority, default_max_retries: u32) -> Self {
        let mut task = Task::new(spec.description, priority);
        if let Some(title) = spec.title {
            task.title = title;
        }
        task.required_capability = spec.required_capability;
        task.tag = spec.tag;
        task.payload = spec.payload;
        task.max_retries = spec.max_retries.unwrap_or(default_max_retries);
        task.timeout_ms = spec.timeout_ms;
        task.metadata = spec.metadata;
        task
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn mark_assigned(&mut self, agent_id: &str) {
        self.status = TaskStatus::Assigned;
        self.assigned_agent = Some(agent_id.to_string());
        self.assigned_at = Some(Utc::now());
    }

    pub(crate) fn mark_executing(&mut self) {
        self.status = TaskStatus::Executing;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self, result: Option<serde_json::Value>) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = result;
        self.error = None;
    }

    pub(crate) fn mark_failed(&mut self, err: &CohortError) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(TaskError::from(err));
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Back to `Pending` for another attempt; the last error stays attached.
    pub(crate) fn reset_for_retry(&mut self, err: &CohortError) {
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.assigned_agent = None;
        self.assigned_at = None;
        self.started_at = None;
        self.error = Some(TaskError::from(err));
    }

    /// Milliseconds between start and completion, when both are known.
    pub fn duration_ms(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds().max(0) as f64)
    }
}

/// Criteria for listing tasks. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assigned_agent: Option<String>,
    pub priority: Option<Priority>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn assigned_to(agent_id: impl Into<String>) -> Self {
        Self {
            assigned_agent: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.priority.map_or(true, |p| task.priority == p)
            && self
                .assigned_agent
                .as_deref()
                .map_or(true, |a| task.assigned_agent.as_deref() == Some(a))
    }
}
