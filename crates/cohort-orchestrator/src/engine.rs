use crate::directory::{AgentDescriptor, AgentDirectory};
use crate::ledger::AgentLedger;
use crate::types::{Task, TaskFilter, TaskSpec, TaskStatus};
use chrono::{DateTime, Utc};
use cohort_coordination::{PriorityQueue, QueueConfig};
use cohort_core::{CohortError, CohortResult, Priority, StepExecutor, StepInput, StepOrigin};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How the scheduler picks one agent out of the eligible candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// First candidate in registration order.
    FirstAvailable,
    /// Candidate with the highest declared priority; earliest registered wins ties.
    #[default]
    HighestPriority,
    /// Never-used candidates first, then the one assigned longest ago.
    LeastRecentlyUsed,
    /// Global counter modulo the candidate count.
    RoundRobin,
}

/// Filters and strategy for one agent selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub capability: Option<String>,
    pub tag: Option<String>,
    /// Uses the scheduler's default strategy when unset.
    pub strategy: Option<SelectionStrategy>,
    pub exclude: Vec<String>,
}

impl SelectionCriteria {
    pub fn with_strategy(strategy: SelectionStrategy) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::default()
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Admission limit on simultaneous executions.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Execution timeout applied when a task carries no override.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default)]
    pub default_priority: Priority,
    #[serde(default)]
    pub default_strategy: SelectionStrategy,
    #[serde(default = "default_enable_retry")]
    pub enable_retry: bool,
    /// Retry ceiling applied when a task carries no override.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Capacity of the pending queue.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_enable_retry() -> bool {
    true
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_max_queue_size() -> usize {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_ms: default_task_timeout_ms(),
            default_priority: Priority::default(),
            default_strategy: SelectionStrategy::default(),
            enable_retry: default_enable_retry(),
            max_retry_attempts: default_max_retry_attempts(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatistics {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Executions holding an admission slot, including cancelled ones that
    /// have not settled yet.
    pub in_flight: usize,
}

struct SchedulerState {
    tasks: HashMap<Uuid, Task>,
    pending: PriorityQueue<Uuid>,
    in_flight: HashSet<Uuid>,
    round_robin: u64,
    last_used: HashMap<String, DateTime<Utc>>,
}

struct Inner {
    config: SchedulerConfig,
    directory: Arc<dyn AgentDirectory>,
    executor: Arc<dyn StepExecutor>,
    ledger: Arc<AgentLedger>,
    state: Mutex<SchedulerState>,
    changes: watch::Sender<u64>,
}

/// An execution started by the scheduling loop.
struct Dispatch {
    task_id: Uuid,
    agent_id: String,
    input: StepInput,
    timeout: Duration,
}

/// Priority task scheduler with admission control, agent selection,
/// per-execution timeouts and transparent retry.
///
/// The scheduling loop runs after every submission and every settled
/// execution. Executions are spawned on the ambient Tokio runtime, so
/// `submit`, `cancel` and `schedule` must be called from within one.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        directory: Arc<dyn AgentDirectory>,
        executor: Arc<dyn StepExecutor>,
        ledger: Arc<AgentLedger>,
    ) -> Self {
        let pending = PriorityQueue::new(
            QueueConfig::named("scheduler").with_max_size(config.max_queue_size),
        );
        let (changes, _) = watch::channel(0);
        info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            strategy = ?config.default_strategy,
            "Scheduler initialized"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                directory,
                executor,
                ledger,
                state: Mutex::new(SchedulerState {
                    tasks: HashMap::new(),
                    pending,
                    in_flight: HashSet::new(),
                    round_robin: 0,
                    last_used: HashMap::new(),
                }),
                changes,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> &Arc<AgentLedger> {
        &self.inner.ledger
    }

    /// Queue a task and run the scheduling loop.
    ///
    /// Fails with `InvalidInput` for an empty description and with
    /// `CapacityExceeded` when the pending queue is full.
    pub fn submit(&self, spec: TaskSpec, priority: Option<Priority>) -> CohortResult<Uuid> {
        if spec.description.trim().is_empty() {
            return Err(CohortError::InvalidInput(
                "Task description must not be empty".to_string(),
            ));
        }
        let priority = priority.unwrap_or(self.inner.config.default_priority);
        let task = Task::from_spec(spec, priority, self.inner.config.max_retry_attempts);
        let task_id = task.id;
        {
            let mut state = self.inner.state.lock();
            state.pending.enqueue_with_id(task_id, task_id, priority)?;
            state.tasks.insert(task_id, task);
        }
        info!(task_id = %task_id, priority = %priority, "Task submitted");
        self.inner.notify();
        Inner::pump(&self.inner);
        Ok(task_id)
    }

    /// Cancel a task that has not reached a terminal state.
    ///
    /// A pending task leaves the queue; an executing task keeps its slot
    /// until the in-flight call settles, and its outcome is discarded.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(task) = state.tasks.get_mut(&task_id) else {
                warn!(task_id = %task_id, "Cancel requested for unknown task");
                return false;
            };
            if task.is_terminal() {
                return false;
            }
            let was_pending = task.status == TaskStatus::Pending;
            task.mark_cancelled();
            if was_pending {
                state.pending.remove(task_id);
            }
        }
        info!(task_id = %task_id, "Task cancelled");
        self.inner.notify();
        Inner::pump(&self.inner);
        true
    }

    /// Re-run the scheduling loop, e.g. after agents came back online.
    pub fn schedule(&self) {
        Inner::pump(&self.inner);
    }

    /// Pick an agent for `criteria` without assigning anything.
    ///
    /// The round-robin counter advances on every call that finds candidates.
    pub fn select_agent(&self, criteria: &SelectionCriteria) -> Option<String> {
        let mut state = self.inner.state.lock();
        self.inner.select(&mut state, criteria)
    }

    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.inner.state.lock().tasks.get(&task_id).cloned()
    }

    /// Tasks matching `filter`, oldest first.
    pub fn tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.inner.state.lock();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        let state = self.inner.state.lock();
        let mut stats = SchedulerStatistics {
            total: state.tasks.len(),
            in_flight: state.in_flight.len(),
            ..SchedulerStatistics::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Executing => stats.executing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Wait until the task reaches a terminal state. Returns `None` for an
    /// unknown (or cleared) task.
    pub async fn wait_for(&self, task_id: Uuid) -> Option<Task> {
        self.wait_until(task_id, Task::is_terminal).await
    }

    /// Wait until `predicate` holds for the task.
    pub async fn wait_until<F>(&self, task_id: Uuid, predicate: F) -> Option<Task>
    where
        F: Fn(&Task) -> bool,
    {
        let mut changes = self.inner.changes.subscribe();
        loop {
            let task = self.task(task_id)?;
            if predicate(&task) {
                return Some(task);
            }
            if changes.changed().await.is_err() {
                return self.task(task_id);
            }
        }
    }

    /// Forget every task. In-flight executions keep their admission slots
    /// until they settle, and their outcomes are discarded.
    pub fn clear(&self) {
        {
            let mut state = self.inner.state.lock();
            state.tasks.clear();
            state.pending.clear();
        }
        info!("Scheduler cleared");
        self.inner.notify();
    }
}

impl Inner {
    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn candidates(&self, criteria: &SelectionCriteria) -> Vec<AgentDescriptor> {
        self.directory
            .agents()
            .into_iter()
            .filter(|a| {
                criteria
                    .capability
                    .as_deref()
                    .map_or(true, |c| a.has_capability(c))
            })
            .filter(|a| criteria.tag.as_deref().map_or(true, |t| a.has_tag(t)))
            .filter(|a| !criteria.exclude.contains(&a.id))
            .filter(|a| self.directory.is_running(&a.id))
            .collect()
    }

    fn select(&self, state: &mut SchedulerState, criteria: &SelectionCriteria) -> Option<String> {
        let candidates = self.candidates(criteria);
        if candidates.is_empty() {
            debug!(
                capability = ?criteria.capability,
                tag = ?criteria.tag,
                "No eligible agent"
            );
            return None;
        }

        let strategy = criteria.strategy.unwrap_or(self.config.default_strategy);
        let chosen = match strategy {
            SelectionStrategy::FirstAvailable => candidates.first(),
            SelectionStrategy::HighestPriority => candidates
                .iter()
                .enumerate()
                .max_by_key(|(i, a)| (a.priority, Reverse(*i)))
                .map(|(_, a)| a),
            SelectionStrategy::LeastRecentlyUsed => candidates
                .iter()
                .min_by_key(|a| state.last_used.get(&a.id).copied()),
            SelectionStrategy::RoundRobin => {
                let index = (state.round_robin % candidates.len() as u64) as usize;
                state.round_robin = state.round_robin.wrapping_add(1);
                candidates.get(index)
            }
        };
        chosen.map(|a| a.id.clone())
    }

    /// Start executions until the queue drains, the admission limit is hit,
    /// or the head task has no eligible agent.
    fn pump(self: &Arc<Self>) {
        let started = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut started = Vec::new();

            while state.in_flight.len() < self.config.max_concurrent_tasks {
                let Some(item) = state.pending.dequeue() else {
                    break;
                };
                let task_id = item.data;
                let criteria = match state.tasks.get(&task_id) {
                    Some(task) if task.status == TaskStatus::Pending => SelectionCriteria {
                        capability: task.required_capability.clone(),
                        tag: task.tag.clone(),
                        ..SelectionCriteria::default()
                    },
                    _ => continue,
                };

                let Some(agent_id) = self.select(state, &criteria) else {
                    warn!(task_id = %task_id, "No agent available, task stays at queue head");
                    if let Err(e) = state.pending.push_front(item) {
                        if let Some(task) = state.tasks.get_mut(&task_id) {
                            task.mark_failed(&e);
                        }
                        error!(task_id = %task_id, error = %e, "Task could not be requeued");
                    }
                    break;
                };

                let Some(task) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                task.mark_assigned(&agent_id);
                task.mark_executing();
                let timeout = Duration::from_millis(
                    task.timeout_ms.unwrap_or(self.config.task_timeout_ms),
                );
                let input = StepInput {
                    agent_id: agent_id.clone(),
                    task: task.description.clone(),
                    payload: task.payload.clone(),
                    origin: StepOrigin::Task {
                        task_id,
                        attempt: task.retry_count,
                    },
                };
                info!(
                    task_id = %task_id,
                    agent = %agent_id,
                    attempt = task.retry_count,
                    "Task assigned"
                );

                state.last_used.insert(agent_id.clone(), Utc::now());
                state.in_flight.insert(task_id);
                self.ledger.record_assignment(&agent_id);
                started.push(Dispatch {
                    task_id,
                    agent_id,
                    input,
                    timeout,
                });
            }
            started
        };

        if started.is_empty() {
            return;
        }
        self.notify();
        for dispatch in started {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = match tokio::time::timeout(
                    dispatch.timeout,
                    inner.executor.execute(dispatch.input),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CohortError::Timeout(format!(
                        "Task execution timeout after {}ms",
                        dispatch.timeout.as_millis()
                    ))),
                };
                inner.settle(dispatch.task_id, &dispatch.agent_id, outcome);
            });
        }
    }

    fn settle(self: &Arc<Self>, task_id: Uuid, agent_id: &str, outcome: CohortResult<serde_json::Value>) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.in_flight.remove(&task_id) {
                debug!(task_id = %task_id, "Settled execution no longer tracked");
            }

            match state.tasks.get_mut(&task_id) {
                None => self.ledger.release(agent_id),
                Some(task) if task.status == TaskStatus::Cancelled => {
                    self.ledger.release(agent_id);
                    debug!(task_id = %task_id, "Discarding outcome of cancelled task");
                }
                Some(task) => match outcome {
                    Ok(value) => {
                        task.mark_completed(Some(value));
                        self.ledger
                            .record_completion(agent_id, task.duration_ms().unwrap_or(0.0));
                        info!(task_id = %task_id, agent = %agent_id, "Task completed");
                    }
                    Err(err) => {
                        self.ledger.record_failure(agent_id);
                        let retry = self.config.enable_retry
                            && err.is_retryable()
                            && task.retry_count < task.max_retries;
                        if retry {
                            task.reset_for_retry(&err);
                            warn!(
                                task_id = %task_id,
                                agent = %agent_id,
                                retry_count = task.retry_count,
                                max_retries = task.max_retries,
                                error = %err,
                                "Task failed, retrying"
                            );
                            state.pending.readmit(task_id, task_id, task.priority);
                        } else {
                            task.mark_failed(&err);
                            error!(task_id = %task_id, agent = %agent_id, error = %err, "Task failed");
                        }
                    }
                },
            }
        }
        self.notify();
        self.pump();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl StepExecutor for Echo {
        async fn execute(&self, input: StepInput) -> CohortResult<serde_json::Value> {
            Ok(json!({"agent": input.agent_id, "task": input.task}))
        }
    }

    fn directory(ids: &[&str]) -> Arc<InMemoryDirectory> {
        let dir = Arc::new(InMemoryDirectory::new());
        for id in ids {
            dir.register(AgentDescriptor::new(*id));
        }
        dir
    }

    /// Fails the first attempt of every task whose description is listed.
    struct FailFirst {
        pending: Mutex<HashSet<String>>,
    }

    impl FailFirst {
        fn new(tasks: &[&str]) -> Self {
            Self {
                pending: Mutex::new(tasks.iter().map(ToString::to_string).collect()),
            }
        }
    }

    #[async_trait]
    impl StepExecutor for FailFirst {
        async fn execute(&self, input: StepInput) -> CohortResult<serde_json::Value> {
            if self.pending.lock().remove(&input.task) {
                return Err(CohortError::execution(format!("{} flaked", input.task)));
            }
            Ok(json!(input.task))
        }
    }

    /// Blocks every call until a permit is added.
    struct Gate(tokio::sync::Semaphore);

    #[async_trait]
    impl StepExecutor for Gate {
        async fn execute(&self, input: StepInput) -> CohortResult<serde_json::Value> {
            let _permit = self
                .0
                .acquire()
                .await
                .map_err(|e| CohortError::execution(e.to_string()))?;
            Ok(json!(input.task))
        }
    }

    fn scheduler(dir: Arc<InMemoryDirectory>, config: SchedulerConfig) -> Scheduler {
        Scheduler::new(config, dir, Arc::new(Echo), Arc::new(AgentLedger::new()))
    }

    #[test]
    fn test_config_defaults() {
        let config: SchedulerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.task_timeout_ms, 30_000);
        assert_eq!(config.default_priority, Priority::Normal);
        assert_eq!(config.default_strategy, SelectionStrategy::HighestPriority);
        assert!(config.enable_retry);
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.max_queue_size, 1000);
    }

    #[test]
    fn test_first_available_and_highest_priority() {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.register(AgentDescriptor::new("a").with_priority(1));
        dir.register(AgentDescriptor::new("b").with_priority(5));
        dir.register(AgentDescriptor::new("c").with_priority(5));
        let sched = scheduler(dir, SchedulerConfig::default());

        let first = SelectionCriteria::with_strategy(SelectionStrategy::FirstAvailable);
        assert_eq!(sched.select_agent(&first).as_deref(), Some("a"));
        assert_eq!(
            sched.select_agent(&SelectionCriteria::default()).as_deref(),
            Some("b")
        );
    }

    #[test]
    fn test_selection_filters() {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.register(AgentDescriptor::new("a").with_capabilities(&["search"]));
        dir.register(
            AgentDescriptor::new("b")
                .with_capabilities(&["code"])
                .with_tags(&["gpu"]),
        );
        dir.register(AgentDescriptor::new("c").with_capabilities(&["code"]));
        dir.set_running("c", false);
        let sched = scheduler(Arc::clone(&dir), SchedulerConfig::default());

        let code = SelectionCriteria {
            capability: Some("code".into()),
            ..SelectionCriteria::default()
        };
        assert_eq!(sched.select_agent(&code).as_deref(), Some("b"));

        let not_b = SelectionCriteria {
            exclude: vec!["b".into()],
            ..code.clone()
        };
        assert_eq!(sched.select_agent(&not_b), None);

        let gpu = SelectionCriteria {
            tag: Some("gpu".into()),
            ..SelectionCriteria::default()
        };
        assert_eq!(sched.select_agent(&gpu).as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_least_recently_used_prefers_unused() {
        let sched = scheduler(directory(&["a", "b"]), SchedulerConfig {
            default_strategy: SelectionStrategy::LeastRecentlyUsed,
            ..SchedulerConfig::default()
        });
        let first = sched.submit(TaskSpec::new("one"), None).unwrap();
        let first = sched.wait_for(first).await.unwrap();
        assert_eq!(first.assigned_agent.as_deref(), Some("a"));

        let second = sched.submit(TaskSpec::new("two"), None).unwrap();
        let second = sched.wait_for(second).await.unwrap();
        assert_eq!(second.assigned_agent.as_deref(), Some("b"));

        let third = sched.submit(TaskSpec::new("three"), None).unwrap();
        let third = sched.wait_for(third).await.unwrap();
        assert_eq!(third.assigned_agent.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let sched = scheduler(directory(&["worker"]), SchedulerConfig::default());
        let id = sched
            .submit(TaskSpec::new("write report"), Some(Priority::High))
            .unwrap();
        let task = sched.wait_for(id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.result.as_ref().unwrap()["task"], "write report");
        assert!(task.completed_at.is_some());

        let stats = sched.statistics();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_flight, 0);

        let load = sched.ledger().load("worker").unwrap();
        assert_eq!(load.task_count, 0);
        assert_eq!(load.tasks_completed, 1);
    }

    #[test]
    fn test_empty_description_rejected() {
        let sched = scheduler(directory(&[]), SchedulerConfig::default());
        let err = sched.submit(TaskSpec::new("  "), None).unwrap_err();
        assert!(matches!(err, CohortError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_queue_capacity() {
        let sched = scheduler(directory(&[]), SchedulerConfig {
            max_queue_size: 1,
            ..SchedulerConfig::default()
        });
        sched.submit(TaskSpec::new("one"), None).unwrap();
        let err = sched.submit(TaskSpec::new("two"), None).unwrap_err();
        assert!(matches!(err, CohortError::CapacityExceeded(_)));
    }

    #[tokio::test]
    async fn test_cancel_pending_and_unknown() {
        let sched = scheduler(directory(&[]), SchedulerConfig::default());
        let id = sched.submit(TaskSpec::new("stuck"), None).unwrap();
        assert!(sched.cancel(id));
        assert!(!sched.cancel(id));
        assert!(!sched.cancel(Uuid::new_v4()));
        assert_eq!(sched.task(id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(sched.statistics().pending, 0);
    }

    #[tokio::test]
    async fn test_clear_forgets_tasks() {
        let sched = scheduler(directory(&[]), SchedulerConfig::default());
        let id = sched.submit(TaskSpec::new("t"), None).unwrap();
        sched.clear();
        assert!(sched.task(id).is_none());
        assert!(sched.wait_for(id).await.is_none());
        assert_eq!(sched.statistics(), SchedulerStatistics::default());
    }

    #[tokio::test]
    async fn test_retry_is_queued_when_queue_is_full() {
        let sched = Scheduler::new(
            SchedulerConfig {
                max_concurrent_tasks: 1,
                max_queue_size: 1,
                ..SchedulerConfig::default()
            },
            directory(&["worker"]),
            Arc::new(FailFirst::new(&["a"])),
            Arc::new(AgentLedger::new()),
        );
        let a = sched.submit(TaskSpec::new("a"), None).unwrap();
        let b = sched.submit(TaskSpec::new("b"), None).unwrap();
        assert_eq!(sched.task(b).unwrap().status, TaskStatus::Pending);

        let a = sched.wait_for(a).await.unwrap();
        assert_eq!(a.status, TaskStatus::Completed);
        assert_eq!(a.retry_count, 1);
        assert_eq!(a.result, Some(json!("a")));
        let b = sched.wait_for(b).await.unwrap();
        assert_eq!(b.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_clear_keeps_in_flight_slots() {
        let gate = Arc::new(Gate(tokio::sync::Semaphore::new(0)));
        let sched = Scheduler::new(
            SchedulerConfig {
                max_concurrent_tasks: 1,
                ..SchedulerConfig::default()
            },
            directory(&["worker"]),
            Arc::clone(&gate) as Arc<dyn StepExecutor>,
            Arc::new(AgentLedger::new()),
        );
        sched.submit(TaskSpec::new("before"), None).unwrap();
        sched.clear();
        assert_eq!(sched.statistics().in_flight, 1);

        let after = sched.submit(TaskSpec::new("after"), None).unwrap();
        assert_eq!(sched.task(after).unwrap().status, TaskStatus::Pending);

        gate.0.add_permits(2);
        let after = sched.wait_for(after).await.unwrap();
        assert_eq!(after.status, TaskStatus::Completed);
        assert_eq!(sched.statistics().in_flight, 0);
        assert_eq!(sched.ledger().load("worker").unwrap().task_count, 0);
    }
}
