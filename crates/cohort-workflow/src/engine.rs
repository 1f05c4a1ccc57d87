use crate::condition::Condition;
use crate::types::{
    ExecutionFilter, ExecutionMode, MergeStrategy, StepKind, WorkflowConfig,
    WorkflowExecutionContext, WorkflowExecutionResult, WorkflowState, WorkflowStatistics,
    WorkflowStep,
};
use chrono::Utc;
use cohort_core::{CohortError, CohortResult, StepExecutor, StepInput, StepOrigin, TaskError};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Interpreter timings and guards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Delay between retries of a failed `EXECUTE` step.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Poll period of `WAIT` steps and of paused runs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A run fails once any single step is entered more often than this.
    #[serde(default = "default_max_step_visits")]
    pub max_step_visits: u32,
}

fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_max_step_visits() -> u32 {
    1000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_step_visits: default_max_step_visits(),
        }
    }
}

impl EngineSettings {
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_step_visits(mut self, max: u32) -> Self {
        self.max_step_visits = max;
        self
    }
}

/// Why interpretation stopped before the graph was exhausted.
enum Halt {
    Cancelled,
    Failed(CohortError),
}

impl From<CohortError> for Halt {
    fn from(err: CohortError) -> Self {
        Halt::Failed(err)
    }
}

/// Interprets registered step graphs against a [`StepExecutor`].
///
/// Every run is tracked by execution id. The interpreter owns the run's
/// context while it executes and publishes it to the tracked table at each
/// step transition; that is also where external pause, resume and cancel
/// requests take effect. An `EXECUTE` call already in flight is never
/// interrupted by them.
pub struct WorkflowEngine {
    executor: Arc<dyn StepExecutor>,
    settings: EngineSettings,
    workflows: RwLock<HashMap<String, Arc<WorkflowConfig>>>,
    executions: RwLock<HashMap<String, WorkflowExecutionContext>>,
    /// Variables set from outside, applied at the run's next transition.
    signals: Mutex<HashMap<String, Vec<(String, Value)>>>,
}

impl WorkflowEngine {
    pub fn new(executor: Arc<dyn StepExecutor>) -> Self {
        Self::with_settings(executor, EngineSettings::default())
    }

    pub fn with_settings(executor: Arc<dyn StepExecutor>, settings: EngineSettings) -> Self {
        Self {
            executor,
            settings,
            workflows: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Validate and register `config`, replacing any workflow with the same id.
    pub fn register_workflow(&self, config: WorkflowConfig) -> CohortResult<()> {
        config.validate()?;
        info!(workflow_id = %config.id, steps = config.steps.len(), "Workflow registered");
        self.workflows
            .write()
            .insert(config.id.clone(), Arc::new(config));
        Ok(())
    }

    pub fn unregister_workflow(&self, workflow_id: &str) -> bool {
        self.workflows.write().remove(workflow_id).is_some()
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowConfig>> {
        self.workflows.read().get(workflow_id).cloned()
    }

    /// Registered workflows, sorted by id.
    pub fn workflows(&self) -> Vec<Arc<WorkflowConfig>> {
        let mut all: Vec<_> = self.workflows.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn clear_workflows(&self) {
        self.workflows.write().clear();
    }

    /// Start a new run of `workflow_id` and drive it to a terminal state.
    ///
    /// Step failures do not surface as `Err`; they end the run in
    /// [`WorkflowState::Failed`] with the error attached to the result.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        variables: HashMap<String, Value>,
    ) -> CohortResult<WorkflowExecutionResult> {
        let config = self
            .workflow(workflow_id)
            .ok_or_else(|| CohortError::NotFound(format!("Workflow '{workflow_id}'")))?;

        let mut ctx = WorkflowExecutionContext::new(
            workflow_id,
            Uuid::new_v4().to_string(),
            Some(config.start_step_id.clone()),
            variables,
        );
        ctx.state = WorkflowState::Running;
        info!(workflow_id, execution_id = %ctx.execution_id, "Workflow run started");

        self.executions
            .write()
            .insert(ctx.execution_id.clone(), ctx.clone());
        Ok(self.drive(&config, ctx).await)
    }

    /// Continue a run from a previously captured context, usually a paused
    /// snapshot that was serialized and restored. The run keeps its execution id.
    pub async fn resume_from(
        &self,
        mut ctx: WorkflowExecutionContext,
    ) -> CohortResult<WorkflowExecutionResult> {
        let config = self
            .workflow(&ctx.workflow_id)
            .ok_or_else(|| CohortError::NotFound(format!("Workflow '{}'", ctx.workflow_id)))?;
        if ctx.state.is_terminal() {
            return Err(CohortError::InvalidInput(format!(
                "Execution '{}' is already {}",
                ctx.execution_id, ctx.state
            )));
        }

        ctx.state = WorkflowState::Running;
        info!(
            workflow_id = %ctx.workflow_id,
            execution_id = %ctx.execution_id,
            step = ?ctx.current_step_id,
            "Workflow run resumed from context"
        );
        self.executions
            .write()
            .insert(ctx.execution_id.clone(), ctx.clone());
        Ok(self.drive(&config, ctx).await)
    }

    /// Request a running run to pause at its next step transition.
    pub fn pause(&self, execution_id: &str) -> bool {
        self.transition(execution_id, &[WorkflowState::Running], WorkflowState::Paused)
    }

    pub fn resume(&self, execution_id: &str) -> bool {
        self.transition(execution_id, &[WorkflowState::Paused], WorkflowState::Running)
    }

    /// Request a running or paused run to stop at its next step transition.
    pub fn cancel(&self, execution_id: &str) -> bool {
        self.transition(
            execution_id,
            &[WorkflowState::Running, WorkflowState::Paused],
            WorkflowState::Cancelled,
        )
    }

    /// Set `name` on an active run. Takes effect at the run's next step
    /// transition or `WAIT` poll.
    pub fn set_variable(&self, execution_id: &str, name: impl Into<String>, value: Value) -> bool {
        let active = self
            .executions
            .read()
            .get(execution_id)
            .is_some_and(|ctx| !ctx.state.is_terminal());
        if active {
            self.signals
                .lock()
                .entry(execution_id.to_string())
                .or_default()
                .push((name.into(), value));
        }
        active
    }

    /// Latest published context of a run.
    pub fn execution(&self, execution_id: &str) -> Option<WorkflowExecutionContext> {
        self.executions.read().get(execution_id).cloned()
    }

    /// Tracked runs matching `filter`, oldest first.
    pub fn executions(&self, filter: &ExecutionFilter) -> Vec<WorkflowExecutionContext> {
        let mut runs: Vec<_> = self
            .executions
            .read()
            .values()
            .filter(|ctx| filter.matches(ctx))
            .cloned()
            .collect();
        runs.sort_by_key(|ctx| ctx.started_at);
        runs
    }

    /// Forget finished runs. Active runs stay tracked.
    pub fn clear_executions(&self) {
        self.executions
            .write()
            .retain(|_, ctx| !ctx.state.is_terminal());
    }

    pub fn statistics(&self) -> WorkflowStatistics {
        let executions = self.executions.read();
        let total = executions.len();
        let active = executions
            .values()
            .filter(|c| matches!(c.state, WorkflowState::Running | WorkflowState::Paused))
            .count();
        let finished = executions.values().filter(|c| c.state.is_terminal()).count();
        let completed = executions
            .values()
            .filter(|c| c.state == WorkflowState::Completed)
            .count();
        let visits: u64 = executions
            .values()
            .map(|c| c.visits.values().map(|v| u64::from(*v)).sum::<u64>())
            .sum();

        WorkflowStatistics {
            total_workflows: self.workflows.read().len(),
            total_executions: total,
            active_executions: active,
            avg_steps_per_execution: if total == 0 {
                0.0
            } else {
                visits as f64 / total as f64
            },
            success_rate: if finished == 0 {
                1.0
            } else {
                completed as f64 / finished as f64
            },
        }
    }

    fn transition(&self, execution_id: &str, from: &[WorkflowState], to: WorkflowState) -> bool {
        let mut executions = self.executions.write();
        match executions.get_mut(execution_id) {
            Some(ctx) if from.contains(&ctx.state) => {
                info!(execution_id, from = %ctx.state, to = %to, "Workflow run state changed");
                ctx.state = to;
                true
            }
            _ => false,
        }
    }

    /// Run the interpreter under the global timeout and publish the outcome.
    async fn drive(
        &self,
        config: &WorkflowConfig,
        mut ctx: WorkflowExecutionContext,
    ) -> WorkflowExecutionResult {
        let outcome = match config.timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(ms),
                    self.interpret(config, &mut ctx),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Halt::Failed(CohortError::Timeout(format!(
                        "Workflow timeout after {ms}ms"
                    )))),
                }
            }
            None => self.interpret(config, &mut ctx).await,
        };

        match outcome {
            Ok(()) => {
                ctx.state = WorkflowState::Completed;
                info!(workflow_id = %ctx.workflow_id, execution_id = %ctx.execution_id, "Workflow run completed");
            }
            Err(Halt::Cancelled) => {
                ctx.state = WorkflowState::Cancelled;
                info!(workflow_id = %ctx.workflow_id, execution_id = %ctx.execution_id, "Workflow run cancelled");
            }
            Err(Halt::Failed(err)) => {
                error!(
                    workflow_id = %ctx.workflow_id,
                    execution_id = %ctx.execution_id,
                    step = ?ctx.current_step_id,
                    error = %err,
                    "Workflow run failed"
                );
                ctx.error = Some(TaskError::from(&err));
                ctx.state = WorkflowState::Failed;
            }
        }

        self.signals.lock().remove(&ctx.execution_id);
        self.executions
            .write()
            .insert(ctx.execution_id.clone(), ctx.clone());

        let duration_ms = (Utc::now() - ctx.started_at).num_milliseconds().max(0) as u64;
        WorkflowExecutionResult {
            workflow_id: ctx.workflow_id,
            execution_id: ctx.execution_id,
            success: ctx.state == WorkflowState::Completed,
            state: ctx.state,
            duration_ms,
            steps_executed: ctx.visits.values().map(|v| *v as usize).sum(),
            result: ctx.variables.get("result").cloned(),
            step_results: ctx.step_results,
            error: ctx.error,
        }
    }

    async fn interpret(
        &self,
        config: &WorkflowConfig,
        ctx: &mut WorkflowExecutionContext,
    ) -> Result<(), Halt> {
        loop {
            self.checkpoint(ctx).await?;
            let Some(step_id) = ctx.current_step_id.clone() else {
                return Ok(());
            };
            let step = config.step(&step_id).ok_or_else(|| {
                CohortError::NotFound(format!(
                    "Step '{step_id}' in workflow '{}'",
                    config.id
                ))
            })?;

            let visits = ctx.visits.entry(step_id.clone()).or_insert(0);
            *visits += 1;
            if *visits > self.settings.max_step_visits {
                return Err(CohortError::fatal(format!(
                    "Step '{step_id}' entered more than {} times",
                    self.settings.max_step_visits
                ))
                .into());
            }
            debug!(execution_id = %ctx.execution_id, step = %step_id, kind = %step.kind, "Entering step");

            match step.kind {
                StepKind::Execute => {
                    let (outcome, used) = self.run_execute(config, step, ctx).await;
                    ctx.retries.insert(step.id.clone(), used);
                    match outcome {
                        Ok(value) => {
                            ctx.record_result(&step.id, value);
                            ctx.current_step_id = step.next_step.clone();
                        }
                        Err(err) => self.route_failure(step, err, ctx)?,
                    }
                }
                StepKind::Wait => {
                    if let Some(text) = &step.wait_condition {
                        let condition = Condition::parse(text)?;
                        while !condition.evaluate(ctx) {
                            tokio::time::sleep(self.poll_interval()).await;
                            self.checkpoint(ctx).await?;
                        }
                    }
                    self.advance(step, ctx);
                }
                StepKind::Branch => {
                    // With no true arm, `next_step` acts as the else arm.
                    let mut target = step.next_step.clone();
                    for arm in &step.branches {
                        if Condition::parse(&arm.condition)?.evaluate(ctx) {
                            target = Some(arm.target.clone());
                            break;
                        }
                    }
                    debug!(step = %step.id, target = ?target, "Branch taken");
                    ctx.step_results.insert(step.id.clone(), Value::Null);
                    ctx.current_step_id = target;
                }
                StepKind::Loop => self.run_loop(config, step, ctx).await?,
                StepKind::Parallel => self.run_parallel(config, step, ctx).await?,
                StepKind::Merge => self.advance(step, ctx),
            }
        }
    }

    /// Publish `ctx` and apply external requests. Blocks while the run is paused.
    async fn checkpoint(&self, ctx: &mut WorkflowExecutionContext) -> Result<(), Halt> {
        loop {
            let pending = self.signals.lock().remove(&ctx.execution_id);
            if let Some(pending) = pending {
                ctx.variables.extend(pending);
            }

            let requested = {
                let mut executions = self.executions.write();
                let tracked = executions
                    .entry(ctx.execution_id.clone())
                    .or_insert_with(|| ctx.clone());
                let requested = tracked.state;
                *tracked = ctx.clone();
                tracked.state = requested;
                requested
            };

            match requested {
                WorkflowState::Paused => {
                    tokio::time::sleep(self.poll_interval()).await;
                }
                WorkflowState::Cancelled => return Err(Halt::Cancelled),
                _ => return Ok(()),
            }
        }
    }

    /// Run `body` of a `LOOP` once if the guard holds, otherwise leave the loop.
    async fn run_loop(
        &self,
        config: &WorkflowConfig,
        step: &WorkflowStep,
        ctx: &mut WorkflowExecutionContext,
    ) -> Result<(), Halt> {
        let holds = match &step.loop_condition {
            Some(text) => Condition::parse(text)?.evaluate(ctx),
            None => false,
        };
        if !holds || ctx.iteration >= step.max_iterations {
            debug!(step = %step.id, iterations = ctx.iteration, "Loop finished");
            ctx.iteration = 0;
            self.advance(step, ctx);
            return Ok(());
        }

        ctx.iteration += 1;
        for child_id in &step.loop_steps {
            let child = Self::child(config, child_id)?;
            let (outcome, used) = self.run_execute(config, child, ctx).await;
            ctx.retries.insert(child.id.clone(), used);
            match outcome {
                Ok(value) => ctx.record_result(&child.id, value),
                Err(err) => {
                    ctx.iteration = 0;
                    return self.route_failure(step, err, ctx);
                }
            }
        }
        Ok(())
    }

    async fn run_parallel(
        &self,
        config: &WorkflowConfig,
        step: &WorkflowStep,
        ctx: &mut WorkflowExecutionContext,
    ) -> Result<(), Halt> {
        let children = step
            .parallel_steps
            .iter()
            .map(|id| Self::child(config, id))
            .collect::<CohortResult<Vec<_>>>()?;

        let outcomes = if config.execution_mode == ExecutionMode::Parallel {
            let snapshot: &WorkflowExecutionContext = ctx;
            join_all(
                children
                    .iter()
                    .map(|child| self.run_execute(config, child, snapshot)),
            )
            .await
        } else {
            let mut outcomes = Vec::with_capacity(children.len());
            for child in &children {
                let outcome = self.run_execute(config, child, ctx).await;
                let failed = outcome.0.is_err();
                outcomes.push(outcome);
                if failed {
                    break;
                }
            }
            outcomes
        };

        let mut values = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for (child, (outcome, used)) in children.iter().zip(outcomes) {
            ctx.retries.insert(child.id.clone(), used);
            match outcome {
                Ok(value) => {
                    ctx.record_result(&child.id, value.clone());
                    values.push(value);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return self.route_failure(step, err, ctx);
        }

        let merged = match step.merge_strategy {
            MergeStrategy::Concat => Value::Array(values),
            MergeStrategy::Merge => {
                let mut union = serde_json::Map::new();
                for value in values {
                    if let Value::Object(fields) = value {
                        union.extend(fields);
                    }
                }
                Value::Object(union)
            }
        };
        ctx.variables
            .insert(format!("parallel_{}", step.id), merged.clone());
        ctx.step_results.insert(step.id.clone(), merged);
        ctx.current_step_id = step.next_step.clone();
        Ok(())
    }

    /// Invoke the executor for an `EXECUTE` step, retrying within the run's
    /// per-step budget. Returns the outcome and the retries consumed so far.
    async fn run_execute(
        &self,
        config: &WorkflowConfig,
        step: &WorkflowStep,
        ctx: &WorkflowExecutionContext,
    ) -> (CohortResult<Value>, u32) {
        let mut used = ctx.retries.get(&step.id).copied().unwrap_or(0);
        loop {
            let input = StepInput {
                agent_id: step.agent_id.clone().unwrap_or_default(),
                task: step.task.clone().unwrap_or_default(),
                payload: step.payload.clone(),
                origin: StepOrigin::Workflow {
                    workflow_id: ctx.workflow_id.clone(),
                    execution_id: ctx.execution_id.clone(),
                    step_id: step.id.clone(),
                    iteration: ctx.iteration,
                    variables: ctx.variables.clone(),
                },
            };

            let call = self.executor.execute(input);
            let outcome = match step.timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
                    .await
                    .unwrap_or_else(|_| {
                        Err(CohortError::Timeout(format!(
                            "Step '{}' timeout after {ms}ms",
                            step.id
                        )))
                    }),
                None => call.await,
            };

            match outcome {
                Ok(value) => return (Ok(value), used),
                Err(err)
                    if config.retry_on_failure
                        && used < config.max_retries
                        && err.is_retryable() =>
                {
                    used += 1;
                    warn!(
                        execution_id = %ctx.execution_id,
                        step = %step.id,
                        retry = used,
                        max_retries = config.max_retries,
                        error = %err,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(self.settings.retry_delay_ms)).await;
                }
                Err(err) => return (Err(err), used),
            }
        }
    }

    /// Follow `on_failure` if the step declares one, otherwise fail the run.
    fn route_failure(
        &self,
        step: &WorkflowStep,
        err: CohortError,
        ctx: &mut WorkflowExecutionContext,
    ) -> Result<(), Halt> {
        match &step.on_failure {
            Some(target) => {
                warn!(
                    execution_id = %ctx.execution_id,
                    step = %step.id,
                    target = %target,
                    error = %err,
                    "Step failed, following failure path"
                );
                ctx.current_step_id = Some(target.clone());
                Ok(())
            }
            None => Err(Halt::Failed(err)),
        }
    }

    fn advance(&self, step: &WorkflowStep, ctx: &mut WorkflowExecutionContext) {
        ctx.step_results.insert(step.id.clone(), Value::Null);
        ctx.current_step_id = step.next_step.clone();
    }

    fn child<'a>(config: &'a WorkflowConfig, id: &str) -> CohortResult<&'a WorkflowStep> {
        config
            .step(id)
            .ok_or_else(|| CohortError::NotFound(format!("Step '{id}' in workflow '{}'", config.id)))
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.settings.poll_interval_ms)
    }
}
