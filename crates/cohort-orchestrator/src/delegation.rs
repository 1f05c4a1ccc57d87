use crate::ledger::AgentLedger;
use crate::types::{Task, TaskFilter, TaskStatus};
use chrono::{DateTime, Utc};
use cohort_core::{CohortError, CohortResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Policy for choosing which child of a supervisor receives a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStrategy {
    /// The caller names the agent.
    Direct,
    /// Highest summed score for the requested capabilities.
    CapabilityBased,
    /// Fewest current tasks, honouring the per-agent cap.
    #[default]
    LoadBased,
    /// Per-parent counter modulo the child count.
    RoundRobin,
}

/// A supervisor tree and its delegation policy.
///
/// The tree is a forest rooted at `supervisor_id`; cycles are not detected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyConfig {
    pub id: String,
    pub supervisor_id: String,
    /// Parent id to ordered child ids.
    #[serde(default)]
    pub children: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub strategy: DelegationStrategy,
    /// Load-based delegation skips agents at or above this many tasks.
    #[serde(default)]
    pub max_tasks_per_agent: Option<u32>,
}

impl HierarchyConfig {
    pub fn new(id: impl Into<String>, supervisor_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            supervisor_id: supervisor_id.into(),
            children: HashMap::new(),
            strategy: DelegationStrategy::default(),
            max_tasks_per_agent: None,
        }
    }

    pub fn with_children(mut self, parent: impl Into<String>, children: &[&str]) -> Self {
        self.children.insert(
            parent.into(),
            children.iter().map(|c| (*c).to_string()).collect(),
        );
        self
    }

    pub fn with_strategy(mut self, strategy: DelegationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_tasks_per_agent(mut self, max: u32) -> Self {
        self.max_tasks_per_agent = Some(max);
        self
    }
}

/// A task handed to a hierarchy for delegation.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub task: Task,
    /// Overrides the hierarchy's strategy.
    pub strategy: Option<DelegationStrategy>,
    /// Required by `Direct`.
    pub target_agent: Option<String>,
    /// Consulted by `CapabilityBased`.
    pub required_capabilities: Vec<String>,
}

impl DelegationRequest {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            strategy: None,
            target_agent: None,
            required_capabilities: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: DelegationStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn to_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.strategy = Some(DelegationStrategy::Direct);
        self.target_agent = Some(agent_id.into());
        self
    }

    pub fn requiring(mut self, capabilities: &[&str]) -> Self {
        self.required_capabilities = capabilities.iter().map(|c| (*c).to_string()).collect();
        self
    }
}

/// Kind of report an agent sends up the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Status,
    Result,
    Error,
    Progress,
}

/// A message from an agent to its supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub id: Uuid,
    pub reporter_id: String,
    pub recipient_id: String,
    pub kind: ReportKind,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentReport {
    pub fn new(
        reporter_id: impl Into<String>,
        recipient_id: impl Into<String>,
        kind: ReportKind,
        content: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reporter_id: reporter_id.into(),
            recipient_id: recipient_id.into(),
            kind,
            content,
            task_id: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// Criteria for listing reports. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub kind: Option<ReportKind>,
    pub since: Option<DateTime<Utc>>,
    pub task_id: Option<Uuid>,
}

/// Aggregate counters across every hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyStatistics {
    pub hierarchies: usize,
    pub tasks: usize,
    pub tasks_by_status: HashMap<TaskStatus, usize>,
    pub average_load: f64,
    pub average_success_rate: f64,
    pub total_reports: usize,
}

#[derive(Default)]
struct HierarchyState {
    hierarchies: HashMap<String, HierarchyConfig>,
    tasks: HashMap<Uuid, Task>,
    reports: HashMap<String, Vec<AgentReport>>,
    /// Keyed by (hierarchy id, parent id).
    round_robin: HashMap<(String, String), u64>,
}

/// Delegates tasks from supervisors to their children and feeds the
/// outcomes back into the shared [`AgentLedger`].
pub struct HierarchyManager {
    ledger: Arc<AgentLedger>,
    state: RwLock<HierarchyState>,
}

impl HierarchyManager {
    pub fn new(ledger: Arc<AgentLedger>) -> Self {
        info!("HierarchyManager initialized");
        Self {
            ledger,
            state: RwLock::new(HierarchyState::default()),
        }
    }

    pub fn ledger(&self) -> &Arc<AgentLedger> {
        &self.ledger
    }

    /// Register (or replace) a hierarchy. Every child gets a ledger entry.
    pub fn register_hierarchy(&self, config: HierarchyConfig) -> CohortResult<()> {
        if config.id.trim().is_empty() || config.supervisor_id.trim().is_empty() {
            return Err(CohortError::InvalidInput(
                "Hierarchy id and supervisor id must not be empty".to_string(),
            ));
        }
        let mut state = self.state.write();
        for (parent, children) in &config.children {
            state
                .round_robin
                .insert((config.id.clone(), parent.clone()), 0);
            for child in children {
                self.ledger.ensure_agent(child);
            }
        }
        info!(
            hierarchy = %config.id,
            supervisor = %config.supervisor_id,
            parents = config.children.len(),
            strategy = ?config.strategy,
            "Hierarchy registered"
        );
        state.hierarchies.insert(config.id.clone(), config);
        Ok(())
    }

    pub fn hierarchy(&self, hierarchy_id: &str) -> Option<HierarchyConfig> {
        self.state.read().hierarchies.get(hierarchy_id).cloned()
    }

    /// Every registered hierarchy, sorted by id.
    pub fn hierarchies(&self) -> Vec<HierarchyConfig> {
        let mut all: Vec<HierarchyConfig> =
            self.state.read().hierarchies.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn unregister_hierarchy(&self, hierarchy_id: &str) -> bool {
        let mut state = self.state.write();
        let removed = state.hierarchies.remove(hierarchy_id).is_some();
        if removed {
            state.round_robin.retain(|(h, _), _| h != hierarchy_id);
            info!(hierarchy = %hierarchy_id, "Hierarchy unregistered");
        }
        removed
    }

    /// Assign `request.task` to one of the supervisor's direct children.
    ///
    /// Fails with `NotFound` for an unknown hierarchy and with
    /// `NoAgentAvailable` when the strategy yields no candidate.
    pub fn delegate_task(
        &self,
        hierarchy_id: &str,
        request: DelegationRequest,
    ) -> CohortResult<Task> {
        let mut state = self.state.write();
        let config = state
            .hierarchies
            .get(hierarchy_id)
            .ok_or_else(|| CohortError::NotFound(format!("Hierarchy '{hierarchy_id}'")))?;

        let strategy = request.strategy.unwrap_or(config.strategy);
        let supervisor = config.supervisor_id.clone();
        let children = config
            .children
            .get(&supervisor)
            .cloned()
            .unwrap_or_default();
        let max_tasks = config.max_tasks_per_agent;

        let assignee = match strategy {
            DelegationStrategy::Direct => request.target_agent.clone(),
            DelegationStrategy::CapabilityBased => {
                self.select_by_capability(&children, &request.required_capabilities)
            }
            DelegationStrategy::LoadBased => self.select_by_load(&children, max_tasks),
            DelegationStrategy::RoundRobin => {
                let counter = state
                    .round_robin
                    .entry((hierarchy_id.to_string(), supervisor.clone()))
                    .or_insert(0);
                select_round_robin(&children, counter)
            }
        };

        let mut task = request.task;
        let Some(assignee) = assignee else {
            warn!(
                hierarchy = %hierarchy_id,
                task_id = %task.id,
                strategy = ?strategy,
                "No agent available for delegation"
            );
            return Err(CohortError::NoAgentAvailable(format!(
                "No available agent for task '{}' in hierarchy '{hierarchy_id}'",
                task.title
            )));
        };

        task.mark_assigned(&assignee);
        self.ledger.record_assignment(&assignee);
        state.tasks.insert(task.id, task.clone());
        info!(
            hierarchy = %hierarchy_id,
            task_id = %task.id,
            agent = %assignee,
            strategy = ?strategy,
            "Task delegated"
        );
        Ok(task)
    }

    fn select_by_capability(&self, children: &[String], required: &[String]) -> Option<String> {
        if required.is_empty() {
            return children.first().cloned();
        }
        let mut best: Option<(&String, f64)> = None;
        for child in children {
            let score = self.ledger.capability_score(child, required);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((child, score));
            }
        }
        best.map(|(id, _)| id.clone())
    }

    fn select_by_load(&self, children: &[String], max_tasks: Option<u32>) -> Option<String> {
        children
            .iter()
            .map(|c| (c, self.ledger.task_count(c)))
            .filter(|(_, count)| max_tasks.map_or(true, |max| *count < max))
            .min_by_key(|(_, count)| *count)
            .map(|(c, _)| c.clone())
    }

    /// Apply a status reported for a delegated task.
    ///
    /// Returns `false` for unknown tasks and for tasks already terminal.
    pub fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<CohortError>,
    ) -> bool {
        let mut state = self.state.write();
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return false;
        };
        if task.is_terminal() {
            debug!(task_id = %task_id, status = %task.status, "Ignoring update to terminal task");
            return false;
        }

        let assignee = task.assigned_agent.clone();
        match status {
            TaskStatus::Executing => {
                task.status = status;
                if task.started_at.is_none() {
                    task.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed => {
                task.mark_completed(result);
                if let Some(agent) = &assignee {
                    self.ledger
                        .record_completion(agent, task.duration_ms().unwrap_or(0.0));
                }
            }
            TaskStatus::Failed => {
                let err = error.unwrap_or_else(|| CohortError::execution("Task failed"));
                task.mark_failed(&err);
                if let Some(agent) = &assignee {
                    self.ledger.record_failure(agent);
                }
            }
            TaskStatus::Cancelled => {
                task.mark_cancelled();
                if let Some(agent) = &assignee {
                    self.ledger.release(agent);
                }
            }
            TaskStatus::Pending | TaskStatus::Assigned => task.status = status,
        }
        debug!(task_id = %task_id, status = %status, agent = ?assignee, "Task status updated");
        true
    }

    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.state.read().tasks.get(&task_id).cloned()
    }

    /// Delegated tasks matching `filter`, oldest first.
    pub fn tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Direct children of `agent_id`.
    pub fn children(&self, hierarchy_id: &str, agent_id: &str) -> Vec<String> {
        self.state
            .read()
            .hierarchies
            .get(hierarchy_id)
            .and_then(|h| h.children.get(agent_id).cloned())
            .unwrap_or_default()
    }

    pub fn parent(&self, hierarchy_id: &str, agent_id: &str) -> Option<String> {
        let state = self.state.read();
        let config = state.hierarchies.get(hierarchy_id)?;
        config
            .children
            .iter()
            .find(|(_, children)| children.iter().any(|c| c == agent_id))
            .map(|(parent, _)| parent.clone())
    }

    /// Every descendant of `agent_id`, depth-first.
    pub fn subtree(&self, hierarchy_id: &str, agent_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        for child in self.children(hierarchy_id, agent_id) {
            let below = self.subtree(hierarchy_id, &child);
            out.push(child);
            out.extend(below);
        }
        out
    }

    pub fn submit_report(&self, report: AgentReport) {
        debug!(
            report_id = %report.id,
            reporter = %report.reporter_id,
            recipient = %report.recipient_id,
            kind = ?report.kind,
            "Report submitted"
        );
        self.state
            .write()
            .reports
            .entry(report.recipient_id.clone())
            .or_default()
            .push(report);
    }

    /// Reports addressed to `agent_id`, in submission order.
    pub fn reports(&self, agent_id: &str, filter: &ReportFilter) -> Vec<AgentReport> {
        let state = self.state.read();
        let Some(reports) = state.reports.get(agent_id) else {
            return Vec::new();
        };
        reports
            .iter()
            .filter(|r| filter.kind.map_or(true, |k| r.kind == k))
            .filter(|r| filter.since.map_or(true, |since| r.timestamp >= since))
            .filter(|r| filter.task_id.map_or(true, |id| r.task_id == Some(id)))
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> HierarchyStatistics {
        let state = self.state.read();
        let mut tasks_by_status = HashMap::new();
        for task in state.tasks.values() {
            *tasks_by_status.entry(task.status).or_insert(0) += 1;
        }
        HierarchyStatistics {
            hierarchies: state.hierarchies.len(),
            tasks: state.tasks.len(),
            tasks_by_status,
            average_load: self.ledger.average_load(),
            average_success_rate: self.ledger.average_success_rate(),
            total_reports: state.reports.values().map(Vec::len).sum(),
        }
    }

    /// Forget hierarchies, tasks and reports. The ledger is left intact.
    pub fn clear(&self) {
        *self.state.write() = HierarchyState::default();
        debug!("HierarchyManager cleared");
    }
}

fn select_round_robin(children: &[String], counter: &mut u64) -> Option<String> {
    if children.is_empty() {
        return None;
    }
    let index = (*counter % children.len() as u64) as usize;
    *counter = counter.wrapping_add(1);
    children.get(index).cloned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ledger::AgentCapability;
    use cohort_core::{ErrorKind, Priority};
    use serde_json::json;

    fn manager() -> HierarchyManager {
        HierarchyManager::new(Arc::new(AgentLedger::new()))
    }

    fn team(strategy: DelegationStrategy) -> HierarchyConfig {
        HierarchyConfig::new("team", "lead")
            .with_children("lead", &["a", "b", "c"])
            .with_children("b", &["b1", "b2"])
            .with_children("b1", &["b1x"])
            .with_strategy(strategy)
    }

    fn task(title: &str) -> Task {
        Task::new(title, Priority::Normal)
    }

    #[test]
    fn test_register_initialises_ledger() {
        let mgr = manager();
        mgr.register_hierarchy(team(DelegationStrategy::LoadBased)).unwrap();
        assert!(mgr.ledger().load("a").is_some());
        assert!(mgr.ledger().load("b2").is_some());
        assert_eq!(mgr.hierarchies().len(), 1);

        let err = mgr
            .register_hierarchy(HierarchyConfig::new("", "lead"))
            .unwrap_err();
        assert!(matches!(err, CohortError::InvalidInput(_)));
    }

    #[test]
    fn test_unknown_hierarchy() {
        let err = manager()
            .delegate_task("ghost", DelegationRequest::new(task("t")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_direct_delegation() {
        let mgr = manager();
        mgr.register_hierarchy(team(DelegationStrategy::LoadBased)).unwrap();
        let delegated = mgr
            .delegate_task("team", DelegationRequest::new(task("t")).to_agent("c"))
            .unwrap();
        assert_eq!(delegated.assigned_agent.as_deref(), Some("c"));
        assert_eq!(delegated.status, TaskStatus::Assigned);
        assert!(delegated.assigned_at.is_some());
        assert_eq!(mgr.ledger().task_count("c"), 1);

        let err = mgr
            .delegate_task(
                "team",
                DelegationRequest::new(task("t")).with_strategy(DelegationStrategy::Direct),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoAgentAvailable);
    }

    #[test]
    fn test_capability_without_requirements_takes_first_child() {
        let mgr = manager();
        mgr.register_hierarchy(team(DelegationStrategy::CapabilityBased))
            .unwrap();
        let delegated = mgr
            .delegate_task("team", DelegationRequest::new(task("t")))
            .unwrap();
        assert_eq!(delegated.assigned_agent.as_deref(), Some("a"));
    }

    #[test]
    fn test_capability_ties_keep_input_order() {
        let mgr = manager();
        mgr.register_hierarchy(team(DelegationStrategy::CapabilityBased))
            .unwrap();
        for id in ["b", "c"] {
            mgr.ledger()
                .register_capabilities(id, vec![AgentCapability::new("coding", 0.5)])
                .unwrap();
        }
        let delegated = mgr
            .delegate_task("team", DelegationRequest::new(task("t")).requiring(&["coding"]))
            .unwrap();
        assert_eq!(delegated.assigned_agent.as_deref(), Some("b"));
    }

    #[test]
    fn test_load_based_respects_cap() {
        let mgr = manager();
        mgr.register_hierarchy(team(DelegationStrategy::LoadBased).with_max_tasks_per_agent(1))
            .unwrap();
        let picks: Vec<String> = (0..3)
            .map(|i| {
                mgr.delegate_task("team", DelegationRequest::new(task(&format!("t{i}"))))
                    .unwrap()
                    .assigned_agent
                    .unwrap()
            })
            .collect();
        assert_eq!(picks, vec!["a", "b", "c"]);

        let err = mgr
            .delegate_task("team", DelegationRequest::new(task("overflow")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoAgentAvailable);
    }

    #[test]
    fn test_round_robin_without_children() {
        let mgr = manager();
        mgr.register_hierarchy(
            HierarchyConfig::new("empty", "lead").with_strategy(DelegationStrategy::RoundRobin),
        )
        .unwrap();
        let err = mgr
            .delegate_task("empty", DelegationRequest::new(task("t")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoAgentAvailable);
    }

    #[test]
    fn test_status_updates_feed_ledger() {
        let mgr = manager();
        mgr.register_hierarchy(team(DelegationStrategy::Direct)).unwrap();
        let ok = mgr
            .delegate_task("team", DelegationRequest::new(task("ok")).to_agent("a"))
            .unwrap();
        let bad = mgr
            .delegate_task("team", DelegationRequest::new(task("bad")).to_agent("a"))
            .unwrap();
        assert_eq!(mgr.ledger().task_count("a"), 2);

        assert!(mgr.update_task_status(ok.id, TaskStatus::Executing, None, None));
        assert!(mgr.task(ok.id).unwrap().started_at.is_some());
        assert!(mgr.update_task_status(ok.id, TaskStatus::Completed, Some(json!("done")), None));
        assert!(mgr.update_task_status(
            bad.id,
            TaskStatus::Failed,
            None,
            Some(CohortError::execution("boom"))
        ));

        let load = mgr.ledger().load("a").unwrap();
        assert_eq!(load.task_count, 0);
        assert_eq!(load.tasks_completed, 2);
        assert!((load.success_rate - 0.5).abs() < 1e-9);

        let failed = mgr.task(bad.id).unwrap();
        assert!(failed.completed_at.is_some());
        assert!(failed.error.unwrap().message.contains("boom"));
        assert_eq!(mgr.task(ok.id).unwrap().result, Some(json!("done")));

        assert!(!mgr.update_task_status(ok.id, TaskStatus::Failed, None, None));
        assert!(!mgr.update_task_status(Uuid::new_v4(), TaskStatus::Completed, None, None));
    }

    #[test]
    fn test_cancel_releases_load() {
        let mgr = manager();
        mgr.register_hierarchy(team(DelegationStrategy::Direct)).unwrap();
        let t = mgr
            .delegate_task("team", DelegationRequest::new(task("t")).to_agent("b"))
            .unwrap();
        assert!(mgr.update_task_status(t.id, TaskStatus::Cancelled, None, None));
        assert_eq!(mgr.ledger().task_count("b"), 0);
        assert_eq!(mgr.ledger().load("b").unwrap().tasks_completed, 0);
    }

    #[test]
    fn test_structure_queries() {
        let mgr = manager();
        mgr.register_hierarchy(team(DelegationStrategy::LoadBased)).unwrap();
        assert_eq!(mgr.children("team", "lead"), vec!["a", "b", "c"]);
        assert_eq!(mgr.parent("team", "b2").as_deref(), Some("b"));
        assert_eq!(mgr.parent("team", "lead"), None);
        assert_eq!(
            mgr.subtree("team", "lead"),
            vec!["a", "b", "b1", "b1x", "b2", "c"]
        );
        assert!(mgr.children("ghost", "lead").is_empty());

        assert!(mgr.unregister_hierarchy("team"));
        assert!(!mgr.unregister_hierarchy("team"));
    }

    #[test]
    fn test_reports_and_statistics() {
        let mgr = manager();
        mgr.register_hierarchy(team(DelegationStrategy::Direct)).unwrap();
        let t = mgr
            .delegate_task("team", DelegationRequest::new(task("t")).to_agent("a"))
            .unwrap();

        mgr.submit_report(
            AgentReport::new("a", "lead", ReportKind::Progress, json!({"pct": 50})).for_task(t.id),
        );
        mgr.submit_report(AgentReport::new("a", "lead", ReportKind::Status, json!("idle")));

        assert_eq!(mgr.reports("lead", &ReportFilter::default()).len(), 2);
        let progress = mgr.reports(
            "lead",
            &ReportFilter {
                kind: Some(ReportKind::Progress),
                ..ReportFilter::default()
            },
        );
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].content["pct"], 50);
        let by_task = mgr.reports(
            "lead",
            &ReportFilter {
                task_id: Some(t.id),
                ..ReportFilter::default()
            },
        );
        assert_eq!(by_task.len(), 1);
        assert!(mgr.reports("nobody", &ReportFilter::default()).is_empty());

        let stats = mgr.statistics();
        assert_eq!(stats.hierarchies, 1);
        assert_eq!(stats.tasks, 1);
        assert_eq!(stats.tasks_by_status[&TaskStatus::Assigned], 1);
        assert_eq!(stats.total_reports, 2);

        mgr.clear();
        assert_eq!(mgr.statistics().tasks, 0);
        assert!(mgr.ledger().load("a").is_some());
    }
}
