use chrono::{DateTime, Utc};
use cohort_core::{CohortError, CohortResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Load and performance counters for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLoad {
    pub agent_id: String,
    /// Tasks currently assigned and not yet terminal.
    pub task_count: u32,
    /// Lifetime count of settled tasks, successful or not.
    pub tasks_completed: u64,
    /// Lifetime count of failed tasks.
    pub tasks_failed: u64,
    /// Cumulative mean of successful completion latencies, in milliseconds.
    pub avg_completion_ms: f64,
    /// Cumulative mean of 1/0 outcomes, seeded at 1.0.
    pub success_rate: f64,
    pub last_updated: DateTime<Utc>,
}

impl AgentLoad {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            task_count: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            avg_completion_ms: 0.0,
            success_rate: 1.0,
            last_updated: Utc::now(),
        }
    }
}

/// A declared capability and its proficiency score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    pub name: String,
    pub score: f64,
}

impl AgentCapability {
    pub fn new(name: impl Into<String>, score: f64) -> Self {
        Self {
            name: name.into(),
            score,
        }
    }
}

/// Tracks load, outcome statistics and capability scores for every agent.
///
/// Both the scheduler and the delegation engine feed it; the delegation
/// engine also reads it to choose between children.
#[derive(Default)]
pub struct AgentLedger {
    loads: RwLock<HashMap<String, AgentLoad>>,
    capabilities: RwLock<HashMap<String, Vec<AgentCapability>>>,
}

impl AgentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zeroed entry for `agent_id` if none exists.
    pub fn ensure_agent(&self, agent_id: &str) {
        self.loads
            .write()
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentLoad::new(agent_id));
    }

    /// A task was handed to `agent_id`.
    pub fn record_assignment(&self, agent_id: &str) {
        let mut loads = self.loads.write();
        let load = loads
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentLoad::new(agent_id));
        load.task_count += 1;
        load.last_updated = Utc::now();
        debug!(agent = %agent_id, task_count = load.task_count, "Agent load increased");
    }

    /// A task left `agent_id` without an outcome (cancellation).
    pub fn release(&self, agent_id: &str) {
        if let Some(load) = self.loads.write().get_mut(agent_id) {
            load.task_count = load.task_count.saturating_sub(1);
            load.last_updated = Utc::now();
        }
    }

    /// A task on `agent_id` completed after `duration_ms`.
    pub fn record_completion(&self, agent_id: &str, duration_ms: f64) {
        let mut loads = self.loads.write();
        let load = loads
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentLoad::new(agent_id));
        load.task_count = load.task_count.saturating_sub(1);
        load.tasks_completed += 1;

        let successes = (load.tasks_completed - load.tasks_failed) as f64;
        load.avg_completion_ms =
            (load.avg_completion_ms * (successes - 1.0) + duration_ms) / successes;
        let n = load.tasks_completed as f64;
        load.success_rate = (load.success_rate * (n - 1.0) + 1.0) / n;
        load.last_updated = Utc::now();
        debug!(
            agent = %agent_id,
            duration_ms,
            success_rate = load.success_rate,
            "Agent completion recorded"
        );
    }

    /// A task on `agent_id` failed. The latency mean is left untouched.
    pub fn record_failure(&self, agent_id: &str) {
        let mut loads = self.loads.write();
        let load = loads
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentLoad::new(agent_id));
        load.task_count = load.task_count.saturating_sub(1);
        load.tasks_completed += 1;
        load.tasks_failed += 1;

        let n = load.tasks_completed as f64;
        load.success_rate = (load.success_rate * (n - 1.0)) / n;
        load.last_updated = Utc::now();
        debug!(agent = %agent_id, success_rate = load.success_rate, "Agent failure recorded");
    }

    pub fn load(&self, agent_id: &str) -> Option<AgentLoad> {
        self.loads.read().get(agent_id).cloned()
    }

    /// Current task count, zero for unknown agents.
    pub fn task_count(&self, agent_id: &str) -> u32 {
        self.loads.read().get(agent_id).map_or(0, |l| l.task_count)
    }

    /// Every tracked agent, sorted by id.
    pub fn loads(&self) -> Vec<AgentLoad> {
        let mut loads: Vec<AgentLoad> = self.loads.read().values().cloned().collect();
        loads.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        loads
    }

    /// Replace the capability list of `agent_id`. Scores must lie in `[0, 1]`.
    pub fn register_capabilities(
        &self,
        agent_id: &str,
        capabilities: Vec<AgentCapability>,
    ) -> CohortResult<()> {
        if let Some(bad) = capabilities
            .iter()
            .find(|c| !(0.0..=1.0).contains(&c.score))
        {
            return Err(CohortError::InvalidInput(format!(
                "Capability '{}' of agent '{}' has score {} outside [0, 1]",
                bad.name, agent_id, bad.score
            )));
        }
        debug!(agent = %agent_id, count = capabilities.len(), "Capabilities registered");
        self.capabilities
            .write()
            .insert(agent_id.to_string(), capabilities);
        self.ensure_agent(agent_id);
        Ok(())
    }

    pub fn capabilities(&self, agent_id: &str) -> Vec<AgentCapability> {
        self.capabilities
            .read()
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Sum of `agent_id`'s scores for `names`; absent capabilities count 0.
    pub fn capability_score(&self, agent_id: &str, names: &[String]) -> f64 {
        let capabilities = self.capabilities.read();
        let Some(declared) = capabilities.get(agent_id) else {
            return 0.0;
        };
        names
            .iter()
            .filter_map(|name| declared.iter().find(|c| &c.name == name))
            .map(|c| c.score)
            .sum()
    }

    /// Mean current task count across tracked agents.
    pub fn average_load(&self) -> f64 {
        let loads = self.loads.read();
        if loads.is_empty() {
            return 0.0;
        }
        loads.values().map(|l| f64::from(l.task_count)).sum::<f64>() / loads.len() as f64
    }

    /// Mean success rate across tracked agents; 1.0 when none are tracked.
    pub fn average_success_rate(&self) -> f64 {
        let loads = self.loads.read();
        if loads.is_empty() {
            return 1.0;
        }
        loads.values().map(|l| l.success_rate).sum::<f64>() / loads.len() as f64
    }

    /// Drop the entries of `agent_id`.
    pub fn forget(&self, agent_id: &str) {
        self.loads.write().remove(agent_id);
        self.capabilities.write().remove(agent_id);
    }

    /// Serialize the ledger as JSON for dashboards and the CLI.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "agents": self.loads(),
            "average_load": self.average_load(),
            "average_success_rate": self.average_success_rate(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_entry() {
        let ledger = AgentLedger::new();
        ledger.ensure_agent("coder");
        let load = ledger.load("coder").unwrap();
        assert_eq!(load.task_count, 0);
        assert_eq!(load.tasks_completed, 0);
        assert!((load.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_assignment_and_release_floor_at_zero() {
        let ledger = AgentLedger::new();
        ledger.record_assignment("a");
        ledger.record_assignment("a");
        assert_eq!(ledger.task_count("a"), 2);
        ledger.release("a");
        ledger.release("a");
        ledger.release("a");
        assert_eq!(ledger.task_count("a"), 0);
        assert_eq!(ledger.task_count("unknown"), 0);
    }

    #[test]
    fn test_completion_updates_cumulative_means() {
        let ledger = AgentLedger::new();
        ledger.record_assignment("a");
        ledger.record_completion("a", 100.0);
        ledger.record_assignment("a");
        ledger.record_completion("a", 300.0);

        let load = ledger.load("a").unwrap();
        assert_eq!(load.tasks_completed, 2);
        assert!((load.avg_completion_ms - 200.0).abs() < 1e-9);
        assert!((load.success_rate - 1.0).abs() < 1e-9);
        assert_eq!(load.task_count, 0);
    }

    #[test]
    fn test_failure_lowers_success_rate_only() {
        let ledger = AgentLedger::new();
        ledger.record_completion("a", 50.0);
        ledger.record_completion("a", 50.0);
        ledger.record_failure("a");

        let load = ledger.load("a").unwrap();
        assert_eq!(load.tasks_completed, 3);
        assert_eq!(load.tasks_failed, 1);
        assert!((load.avg_completion_ms - 50.0).abs() < 1e-9);
        assert!((load.success_rate - 2.0 / 3.0).abs() < 1e-9);

        ledger.record_completion("a", 150.0);
        let load = ledger.load("a").unwrap();
        assert!((load.avg_completion_ms - 250.0 / 3.0).abs() < 1e-9);
        assert!((load.success_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_capability_scores() {
        let ledger = AgentLedger::new();
        ledger
            .register_capabilities(
                "a",
                vec![
                    AgentCapability::new("coding", 0.9),
                    AgentCapability::new("review", 0.4),
                ],
            )
            .unwrap();
        let wanted = vec!["coding".to_string(), "review".to_string(), "ops".to_string()];
        assert!((ledger.capability_score("a", &wanted) - 1.3).abs() < 1e-9);
        assert_eq!(ledger.capability_score("b", &wanted), 0.0);
        assert_eq!(ledger.capabilities("a").len(), 2);
        assert!(ledger.load("a").is_some());
    }

    #[test]
    fn test_capability_score_out_of_range() {
        let ledger = AgentLedger::new();
        let err = ledger
            .register_capabilities("a", vec![AgentCapability::new("coding", 1.5)])
            .unwrap_err();
        assert!(matches!(err, CohortError::InvalidInput(_)));
    }

    #[test]
    fn test_aggregates_and_json() {
        let ledger = AgentLedger::new();
        ledger.record_assignment("a");
        ledger.record_assignment("a");
        ledger.ensure_agent("b");
        assert!((ledger.average_load() - 1.0).abs() < 1e-9);
        assert!((ledger.average_success_rate() - 1.0).abs() < 1e-9);

        let json = ledger.to_json();
        assert_eq!(json["agents"].as_array().unwrap().len(), 2);
        assert_eq!(json["agents"][0]["agent_id"], "a");

        ledger.forget("a");
        assert!(ledger.load("a").is_none());
    }
}
