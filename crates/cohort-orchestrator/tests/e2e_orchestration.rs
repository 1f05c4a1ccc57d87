//! End-to-end scheduling and delegation tests.
//!
//! Drives the scheduler with mock executors to check selection strategies,
//! admission control, back-pressure, retry, timeout and cancellation, and
//! checks delegation strategies against the shared ledger.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use cohort_coordination::Semaphore;
use cohort_core::{CohortError, CohortResult, ErrorKind, Priority, StepExecutor, StepInput};
use cohort_orchestrator::*;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Mock executors
// ---------------------------------------------------------------------------

/// Records the order in which tasks reach it and succeeds.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl StepExecutor for Recorder {
    async fn execute(&self, input: StepInput) -> CohortResult<serde_json::Value> {
        self.seen.lock().push(input.task.clone());
        Ok(json!({"done": input.task}))
    }
}

/// Blocks every execution until the test releases a permit.
struct Gate {
    permits: Arc<Semaphore>,
}

#[async_trait]
impl StepExecutor for Gate {
    async fn execute(&self, input: StepInput) -> CohortResult<serde_json::Value> {
        self.permits.acquire().await;
        Ok(json!(input.task))
    }
}

/// Always fails; takes its agent offline on the second call.
struct Flaky {
    calls: AtomicU32,
    directory: Arc<InMemoryDirectory>,
}

#[async_trait]
impl StepExecutor for Flaky {
    async fn execute(&self, input: StepInput) -> CohortResult<serde_json::Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 2 {
            self.directory.set_running(&input.agent_id, false);
        }
        Err(CohortError::execution(format!("attempt {call} failed")))
    }
}

struct Slow;

#[async_trait]
impl StepExecutor for Slow {
    async fn execute(&self, _input: StepInput) -> CohortResult<serde_json::Value> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!("late"))
    }
}

struct Rejecting {
    calls: AtomicU32,
}

#[async_trait]
impl StepExecutor for Rejecting {
    async fn execute(&self, _input: StepInput) -> CohortResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CohortError::fatal("malformed payload"))
    }
}

fn directory(ids: &[&str]) -> Arc<InMemoryDirectory> {
    let dir = Arc::new(InMemoryDirectory::new());
    for id in ids {
        dir.register(AgentDescriptor::new(*id));
    }
    dir
}

async fn wait_for_idle(scheduler: &Scheduler) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while scheduler.statistics().in_flight > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// ---------------------------------------------------------------------------
// 1. Round-robin over N candidates, 2N calls
// ---------------------------------------------------------------------------

#[test]
fn test_round_robin_visits_each_candidate_twice_in_order() {
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        directory(&["a", "b", "c"]),
        Arc::new(Recorder::default()),
        Arc::new(AgentLedger::new()),
    );
    let criteria = SelectionCriteria::with_strategy(SelectionStrategy::RoundRobin);
    let picks: Vec<String> = (0..6)
        .map(|_| scheduler.select_agent(&criteria).unwrap())
        .collect();
    assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
}

// ---------------------------------------------------------------------------
// 2. Retry ceiling: two failures leave the task pending, the third fails it
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_retry_then_fail_after_max_retries() {
    let dir = directory(&["worker"]);
    let executor = Arc::new(Flaky {
        calls: AtomicU32::new(0),
        directory: Arc::clone(&dir),
    });
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        Arc::clone(&dir) as Arc<dyn AgentDirectory>,
        Arc::clone(&executor) as Arc<dyn StepExecutor>,
        Arc::new(AgentLedger::new()),
    );

    let id = scheduler
        .submit(TaskSpec::new("flaky job").with_max_retries(2), None)
        .unwrap();

    let task = tokio::time::timeout(
        Duration::from_secs(2),
        scheduler.wait_until(id, |t| t.status == TaskStatus::Pending && t.retry_count == 2),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(task.assigned_agent.is_none());
    assert!(task.started_at.is_none());
    assert_eq!(task.error.as_ref().unwrap().kind, ErrorKind::ExecutionFailed);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);

    dir.set_running("worker", true);
    scheduler.schedule();
    let task = tokio::time::timeout(Duration::from_secs(2), scheduler.wait_for(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert!(task.error.unwrap().message.contains("attempt 3 failed"));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

    let load = scheduler.ledger().load("worker").unwrap();
    assert_eq!(load.task_count, 0);
    assert_eq!(load.tasks_failed, 3);
}

#[tokio::test]
async fn test_non_retryable_error_fails_immediately() {
    let executor = Arc::new(Rejecting {
        calls: AtomicU32::new(0),
    });
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        directory(&["worker"]),
        Arc::clone(&executor) as Arc<dyn StepExecutor>,
        Arc::new(AgentLedger::new()),
    );
    let id = scheduler.submit(TaskSpec::new("parse"), None).unwrap();
    let task = scheduler.wait_for(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// 3. Timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_slow_execution_times_out() {
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        directory(&["worker"]),
        Arc::new(Slow),
        Arc::new(AgentLedger::new()),
    );
    let id = scheduler
        .submit(
            TaskSpec::new("crawl")
                .with_timeout(Duration::from_millis(20))
                .with_max_retries(0),
            None,
        )
        .unwrap();
    let task = scheduler.wait_for(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(error.message.contains("timeout after 20ms"), "{}", error.message);
}

// ---------------------------------------------------------------------------
// 4. Back-pressure keeps queue order until an agent appears
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_back_pressure_preserves_priority_order() {
    let dir = Arc::new(InMemoryDirectory::new());
    let recorder = Arc::new(Recorder::default());
    let scheduler = Scheduler::new(
        SchedulerConfig {
            max_concurrent_tasks: 1,
            ..SchedulerConfig::default()
        },
        Arc::clone(&dir) as Arc<dyn AgentDirectory>,
        Arc::clone(&recorder) as Arc<dyn StepExecutor>,
        Arc::new(AgentLedger::new()),
    );

    let low = scheduler.submit(TaskSpec::new("low"), Some(Priority::Low)).unwrap();
    let critical = scheduler
        .submit(TaskSpec::new("critical"), Some(Priority::Critical))
        .unwrap();
    let normal = scheduler.submit(TaskSpec::new("normal"), None).unwrap();
    assert_eq!(scheduler.statistics().pending, 3);
    assert_eq!(scheduler.statistics().in_flight, 0);

    dir.register(AgentDescriptor::new("late-joiner"));
    scheduler.schedule();
    for id in [low, critical, normal] {
        let task = scheduler.wait_for(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_agent.as_deref(), Some("late-joiner"));
    }
    assert_eq!(*recorder.seen.lock(), vec!["critical", "normal", "low"]);
}

#[tokio::test]
async fn test_capability_filter_routes_tasks() {
    let dir = Arc::new(InMemoryDirectory::new());
    dir.register(AgentDescriptor::new("writer").with_capabilities(&["prose"]));
    dir.register(AgentDescriptor::new("coder").with_capabilities(&["rust"]));
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        dir,
        Arc::new(Recorder::default()),
        Arc::new(AgentLedger::new()),
    );
    let id = scheduler
        .submit(TaskSpec::new("fix borrowck").with_capability("rust"), None)
        .unwrap();
    let task = scheduler.wait_for(id).await.unwrap();
    assert_eq!(task.assigned_agent.as_deref(), Some("coder"));
}

// ---------------------------------------------------------------------------
// 5. Admission control and cooperative cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_admission_limit_caps_in_flight_executions() {
    let permits = Arc::new(Semaphore::new("gate", 0));
    let scheduler = Scheduler::new(
        SchedulerConfig {
            max_concurrent_tasks: 2,
            ..SchedulerConfig::default()
        },
        directory(&["a", "b"]),
        Arc::new(Gate {
            permits: Arc::clone(&permits),
        }),
        Arc::new(AgentLedger::new()),
    );
    let ids: Vec<_> = (0..4)
        .map(|i| scheduler.submit(TaskSpec::new(format!("job-{i}")), None).unwrap())
        .collect();

    let stats = scheduler.statistics();
    assert_eq!(stats.executing, 2);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.in_flight, 2);

    for _ in 0..4 {
        permits.release();
    }
    for id in ids {
        assert_eq!(
            scheduler.wait_for(id).await.unwrap().status,
            TaskStatus::Completed
        );
    }
    assert_eq!(scheduler.statistics().completed, 4);
}

#[tokio::test]
async fn test_cancelling_executing_task_frees_slot_on_settle() {
    let permits = Arc::new(Semaphore::new("gate", 0));
    let ledger = Arc::new(AgentLedger::new());
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        directory(&["worker"]),
        Arc::new(Gate {
            permits: Arc::clone(&permits),
        }),
        Arc::clone(&ledger),
    );
    let id = scheduler.submit(TaskSpec::new("long"), None).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.task(id).unwrap().status, TaskStatus::Executing);

    assert!(scheduler.cancel(id));
    assert_eq!(scheduler.task(id).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(scheduler.statistics().in_flight, 1);
    assert_eq!(ledger.task_count("worker"), 1);

    permits.release();
    wait_for_idle(&scheduler).await;
    let task = scheduler.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.result.is_none());
    assert_eq!(ledger.task_count("worker"), 0);
}

// ---------------------------------------------------------------------------
// 6. Delegation strategies
// ---------------------------------------------------------------------------

#[test]
fn test_capability_based_delegation_picks_best_score() {
    let ledger = Arc::new(AgentLedger::new());
    let manager = HierarchyManager::new(Arc::clone(&ledger));
    manager
        .register_hierarchy(
            HierarchyConfig::new("eng", "lead")
                .with_children("lead", &["B", "A"])
                .with_strategy(DelegationStrategy::CapabilityBased),
        )
        .unwrap();
    ledger
        .register_capabilities("A", vec![AgentCapability::new("coding", 0.9)])
        .unwrap();
    ledger
        .register_capabilities("B", vec![AgentCapability::new("coding", 0.3)])
        .unwrap();

    let task = manager
        .delegate_task(
            "eng",
            DelegationRequest::new(Task::new("refactor parser", Priority::High))
                .requiring(&["coding"]),
        )
        .unwrap();
    assert_eq!(task.assigned_agent.as_deref(), Some("A"));
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(ledger.task_count("A"), 1);
}

#[test]
fn test_round_robin_delegation_cycles_per_parent() {
    let manager = HierarchyManager::new(Arc::new(AgentLedger::new()));
    manager
        .register_hierarchy(
            HierarchyConfig::new("ops", "lead")
                .with_children("lead", &["x", "y"])
                .with_strategy(DelegationStrategy::RoundRobin),
        )
        .unwrap();
    let picks: Vec<String> = (0..4)
        .map(|i| {
            manager
                .delegate_task(
                    "ops",
                    DelegationRequest::new(Task::new(format!("job-{i}"), Priority::Normal)),
                )
                .unwrap()
                .assigned_agent
                .unwrap()
        })
        .collect();
    assert_eq!(picks, vec!["x", "y", "x", "y"]);
}

#[tokio::test]
async fn test_load_based_delegation_sees_scheduler_load() {
    let ledger = Arc::new(AgentLedger::new());
    let permits = Arc::new(Semaphore::new("gate", 0));
    let dir = directory(&["x"]);
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        dir,
        Arc::new(Gate {
            permits: Arc::clone(&permits),
        }),
        Arc::clone(&ledger),
    );
    let manager = HierarchyManager::new(Arc::clone(&ledger));
    manager
        .register_hierarchy(
            HierarchyConfig::new("ops", "lead")
                .with_children("lead", &["x", "y"])
                .with_strategy(DelegationStrategy::LoadBased),
        )
        .unwrap();

    let busy = scheduler.submit(TaskSpec::new("busy"), None).unwrap();
    assert_eq!(ledger.task_count("x"), 1);

    let delegated = manager
        .delegate_task("ops", DelegationRequest::new(Task::new("triage", Priority::Normal)))
        .unwrap();
    assert_eq!(delegated.assigned_agent.as_deref(), Some("y"));

    permits.release();
    scheduler.wait_for(busy).await.unwrap();
    let stats = manager.statistics();
    assert_eq!(stats.tasks, 1);
    assert!((stats.average_load - 0.5).abs() < 1e-9);
}
