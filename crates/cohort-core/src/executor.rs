use crate::CohortResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Where a unit of work came from. Executors may use it for tracing or to
/// look at workflow variables; the kernel never inspects the payload itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOrigin {
    /// A task dispatched by the scheduler.
    Task {
        /// Scheduler task id.
        task_id: Uuid,
        /// Zero-based attempt number (equals the task's retry counter).
        attempt: u32,
    },
    /// An `EXECUTE` step of a workflow run.
    Workflow {
        /// Registered workflow id.
        workflow_id: String,
        /// Run id.
        execution_id: String,
        /// Step being executed.
        step_id: String,
        /// Current loop counter of the run.
        iteration: u32,
        /// Snapshot of the run's variables at invocation time.
        variables: HashMap<String, serde_json::Value>,
    },
}

/// One invocation of the step executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    /// Agent chosen to run the work.
    pub agent_id: String,
    /// Free-text task description or instruction.
    pub task: String,
    /// Opaque caller-supplied payload, decoded only by the executor.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Context of the invocation.
    pub origin: StepOrigin,
}

/// The capability that actually runs a task on an agent (an LLM call, a tool,
/// a subprocess). The kernel awaits it and treats every error uniformly,
/// except errors that report themselves as non-retryable.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute `input` and return its result payload.
    async fn execute(&self, input: StepInput) -> CohortResult<serde_json::Value>;
}
