use crate::condition::Condition;
use chrono::{DateTime, Utc};
use cohort_core::{CohortError, CohortResult, TaskError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Kind of node in a workflow's step graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Run `task` on `agent_id` through the step executor.
    Execute,
    /// Poll `wait_condition` until it holds.
    Wait,
    /// Jump to the target of the first arm whose condition holds.
    Branch,
    /// Run `loop_steps` while `loop_condition` holds, up to `max_iterations`.
    Loop,
    /// Run `parallel_steps` and merge their results.
    Parallel,
    /// Join point; passes straight through.
    Merge,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Execute => write!(f, "execute"),
            StepKind::Wait => write!(f, "wait"),
            StepKind::Branch => write!(f, "branch"),
            StepKind::Loop => write!(f, "loop"),
            StepKind::Parallel => write!(f, "parallel"),
            StepKind::Merge => write!(f, "merge"),
        }
    }
}

/// Lifecycle of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowState::Pending => write!(f, "pending"),
            WorkflowState::Running => write!(f, "running"),
            WorkflowState::Paused => write!(f, "paused"),
            WorkflowState::Completed => write!(f, "completed"),
            WorkflowState::Failed => write!(f, "failed"),
            WorkflowState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How `PARALLEL` children are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    /// Children of a `PARALLEL` step run concurrently.
    Parallel,
    /// Children of a `PARALLEL` step run one after another.
    Mixed,
}

/// How `PARALLEL` child results are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Array of child results in declaration order.
    #[default]
    Concat,
    /// Shallow union of object results; later children win.
    Merge,
}

/// One arm of a `BRANCH` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchArm {
    pub condition: String,
    pub target: String,
}

impl BranchArm {
    pub fn new(condition: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            target: target.into(),
        }
    }
}

/// A node of the step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    /// Opaque payload passed to the executor for `EXECUTE` steps.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub wait_condition: Option<String>,
    /// Evaluated in order; the first true arm wins.
    #[serde(default)]
    pub branches: Vec<BranchArm>,
    #[serde(default)]
    pub loop_condition: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// `EXECUTE` steps run on every loop iteration.
    #[serde(default)]
    pub loop_steps: Vec<String>,
    /// `EXECUTE` steps fanned out by a `PARALLEL` step.
    #[serde(default)]
    pub parallel_steps: Vec<String>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub next_step: Option<String>,
    /// Successor taken when this step fails.
    #[serde(default)]
    pub on_failure: Option<String>,
    /// Bound on a single executor invocation.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_max_iterations() -> u32 {
    10
}

impl WorkflowStep {
    fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            agent_id: None,
            task: None,
            payload: serde_json::Value::Null,
            wait_condition: None,
            branches: Vec::new(),
            loop_condition: None,
            max_iterations: default_max_iterations(),
            loop_steps: Vec::new(),
            parallel_steps: Vec::new(),
            merge_strategy: MergeStrategy::default(),
            next_step: None,
            on_failure: None,
            timeout_ms: None,
        }
    }

    pub fn execute(id: impl Into<String>, agent_id: impl Into<String>, task: impl Into<String>) -> Self {
        let mut step = Self::new(id, StepKind::Execute);
        step.agent_id = Some(agent_id.into());
        step.task = Some(task.into());
        step
    }

    pub fn wait(id: impl Into<String>, condition: impl Into<String>) -> Self {
        let mut step = Self::new(id, StepKind::Wait);
        step.wait_condition = Some(condition.into());
        step
    }

    pub fn branch(id: impl Into<String>, arms: Vec<BranchArm>) -> Self {
        let mut step = Self::new(id, StepKind::Branch);
        step.branches = arms;
        step
    }

    pub fn looping(
        id: impl Into<String>,
        condition: impl Into<String>,
        max_iterations: u32,
        body: &[&str],
    ) -> Self {
        let mut step = Self::new(id, StepKind::Loop);
        step.loop_condition = Some(condition.into());
        step.max_iterations = max_iterations;
        step.loop_steps = body.iter().map(|s| (*s).to_string()).collect();
        step
    }

    pub fn parallel(id: impl Into<String>, children: &[&str], merge: MergeStrategy) -> Self {
        let mut step = Self::new(id, StepKind::Parallel);
        step.parallel_steps = children.iter().map(|s| (*s).to_string()).collect();
        step.merge_strategy = merge;
        step
    }

    pub fn merge(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Merge)
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next_step = Some(next.into());
        self
    }

    pub fn on_failure(mut self, step_id: impl Into<String>) -> Self {
        self.on_failure = Some(step_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Every step id this step may transfer control to or run.
    fn references(&self) -> impl Iterator<Item = &String> {
        self.next_step
            .iter()
            .chain(self.on_failure.iter())
            .chain(self.branches.iter().map(|arm| &arm.target))
            .chain(self.loop_steps.iter())
            .chain(self.parallel_steps.iter())
    }

    fn conditions(&self) -> impl Iterator<Item = &String> {
        self.wait_condition
            .iter()
            .chain(self.loop_condition.iter())
            .chain(self.branches.iter().map(|arm| &arm.condition))
    }
}

/// A registered step graph and its run policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub start_step_id: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Retry failed `EXECUTE` steps up to `max_retries` times each.
    #[serde(default)]
    pub retry_on_failure: bool,
    #[serde(default)]
    pub max_retries: u32,
    /// Bound on the whole run.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WorkflowConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        start_step_id: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            steps,
            start_step_id: start_step_id.into(),
            execution_mode: ExecutionMode::default(),
            retry_on_failure: false,
            max_retries: 0,
            timeout_ms: None,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry_on_failure = max_retries > 0;
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Check the graph is well formed: ids unique, every reference resolves,
    /// `EXECUTE` steps are complete and every condition parses.
    pub fn validate(&self) -> CohortResult<()> {
        let invalid = |msg: String| Err(CohortError::InvalidInput(format!("Workflow '{}': {msg}", self.id)));

        if self.id.trim().is_empty() {
            return Err(CohortError::InvalidInput("Workflow id must not be empty".into()));
        }
        if self.steps.is_empty() {
            return invalid("no steps".into());
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return invalid(format!("duplicate step id '{}'", step.id));
            }
        }
        if !ids.contains(self.start_step_id.as_str()) {
            return invalid(format!("start step '{}' does not exist", self.start_step_id));
        }

        for step in &self.steps {
            if let Some(missing) = step.references().find(|r| !ids.contains(r.as_str())) {
                return invalid(format!("step '{}' references unknown step '{missing}'", step.id));
            }
            for condition in step.conditions() {
                Condition::parse(condition)?;
            }
            match step.kind {
                StepKind::Execute if step.agent_id.is_none() || step.task.is_none() => {
                    return invalid(format!("execute step '{}' needs an agent and a task", step.id));
                }
                StepKind::Loop if step.max_iterations == 0 => {
                    return invalid(format!("loop step '{}' needs max_iterations >= 1", step.id));
                }
                _ => {}
            }
            for child in step.loop_steps.iter().chain(step.parallel_steps.iter()) {
                let is_execute = self
                    .step(child)
                    .is_some_and(|c| c.kind == StepKind::Execute);
                if !is_execute {
                    return invalid(format!(
                        "step '{}' may only run execute steps, '{child}' is not one",
                        step.id
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Mutable state of one run. Serializable so a paused run can be persisted
/// and continued with `WorkflowEngine::resume_from`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionContext {
    pub workflow_id: String,
    pub execution_id: String,
    /// Step about to run; `None` once the graph is exhausted.
    pub current_step_id: Option<String>,
    pub state: WorkflowState,
    pub step_results: HashMap<String, serde_json::Value>,
    pub variables: HashMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    /// Loop counter of the active `LOOP` step.
    pub iteration: u32,
    /// Retries consumed per step.
    #[serde(default)]
    pub retries: HashMap<String, u32>,
    /// Times each step has been entered.
    #[serde(default)]
    pub visits: HashMap<String, u32>,
    #[serde(default)]
    pub error: Option<TaskError>,
}

impl WorkflowExecutionContext {
    pub fn new(
        workflow_id: impl Into<String>,
        execution_id: impl Into<String>,
        start_step_id: Option<String>,
        variables: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: execution_id.into(),
            current_step_id: start_step_id,
            state: WorkflowState::Pending,
            step_results: HashMap::new(),
            variables,
            started_at: Utc::now(),
            iteration: 0,
            retries: HashMap::new(),
            visits: HashMap::new(),
            error: None,
        }
    }

    /// Store the result of `step_id` and expose it as `step_<id>`.
    pub(crate) fn record_result(&mut self, step_id: &str, value: serde_json::Value) {
        self.variables
            .insert(format!("step_{step_id}"), value.clone());
        self.step_results.insert(step_id.to_string(), value);
    }
}

/// Outcome of `execute_workflow` or `resume_from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionResult {
    pub workflow_id: String,
    pub execution_id: String,
    pub success: bool,
    pub state: WorkflowState,
    pub duration_ms: u64,
    pub steps_executed: usize,
    /// The run's `result` variable, if set.
    pub result: Option<serde_json::Value>,
    pub step_results: HashMap<String, serde_json::Value>,
    pub error: Option<TaskError>,
}

/// Criteria for listing runs. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
    pub state: Option<WorkflowState>,
}

impl ExecutionFilter {
    pub fn matches(&self, ctx: &WorkflowExecutionContext) -> bool {
        self.workflow_id
            .as_deref()
            .map_or(true, |id| ctx.workflow_id == id)
            && self.state.map_or(true, |s| ctx.state == s)
    }
}

/// Aggregate counters across registered workflows and tracked runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total_workflows: usize,
    pub total_executions: usize,
    pub active_executions: usize,
    pub avg_steps_per_execution: f64,
    /// Completed runs over tracked runs; 1.0 when nothing ran.
    pub success_rate: f64,
}
