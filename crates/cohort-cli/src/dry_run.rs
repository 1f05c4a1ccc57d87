use async_trait::async_trait;
use cohort_core::{CohortResult, StepExecutor, StepInput};
use serde_json::{json, Value};
use tracing::info;

/// Executor that performs no work and echoes what it was asked to do.
pub struct EchoExecutor;

#[async_trait]
impl StepExecutor for EchoExecutor {
    async fn execute(&self, input: StepInput) -> CohortResult<Value> {
        info!(agent = %input.agent_id, task = %input.task, "Dry-run step");
        Ok(json!({
            "agent": input.agent_id,
            "task": input.task,
            "payload": input.payload,
        }))
    }
}
