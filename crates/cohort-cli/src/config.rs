//! `cohort.toml` loading and cross-section validation.

use cohort_core::{CohortError, CohortResult};
use cohort_orchestrator::{
    AgentCapability, AgentDescriptor, AgentLedger, HierarchyConfig, InMemoryDirectory,
    SchedulerConfig,
};
use cohort_workflow::{EngineSettings, StepKind, WorkflowConfig};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CohortConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub hierarchies: Vec<HierarchyConfig>,
    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
}

/// An `[[agents]]` entry: the routing descriptor plus capability scores
/// used by capability-based delegation.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    #[serde(flatten)]
    pub descriptor: AgentDescriptor,
    #[serde(default)]
    pub scores: HashMap<String, f64>,
}

impl CohortConfig {
    pub fn load(path: &Path) -> CohortResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
            .map_err(|e| CohortError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(text: &str) -> CohortResult<Self> {
        toml::from_str(text).map_err(|e| CohortError::Config(e.to_string()))
    }

    /// Check every section and the references between them.
    pub fn validate(&self) -> CohortResult<()> {
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(CohortError::Config(
                "scheduler.max_concurrent_tasks must be at least 1".into(),
            ));
        }

        let mut agents = HashSet::new();
        for entry in &self.agents {
            let id = &entry.descriptor.id;
            if id.trim().is_empty() {
                return Err(CohortError::Config("Agent id must not be empty".into()));
            }
            if !agents.insert(id.as_str()) {
                return Err(CohortError::Config(format!("Duplicate agent '{id}'")));
            }
            if let Some((name, score)) = entry
                .scores
                .iter()
                .find(|(_, s)| !(0.0..=1.0).contains(*s))
            {
                return Err(CohortError::Config(format!(
                    "Agent '{id}' scores '{name}' at {score}, expected [0, 1]"
                )));
            }
        }

        let mut hierarchy_ids = HashSet::new();
        for hierarchy in &self.hierarchies {
            if !hierarchy_ids.insert(hierarchy.id.as_str()) {
                return Err(CohortError::Config(format!(
                    "Duplicate hierarchy '{}'",
                    hierarchy.id
                )));
            }
            let unknown = hierarchy
                .children
                .values()
                .flatten()
                .find(|child| !agents.contains(child.as_str()));
            if let Some(child) = unknown {
                return Err(CohortError::Config(format!(
                    "Hierarchy '{}' delegates to unknown agent '{child}'",
                    hierarchy.id
                )));
            }
        }

        let mut workflow_ids = HashSet::new();
        for workflow in &self.workflows {
            if !workflow_ids.insert(workflow.id.as_str()) {
                return Err(CohortError::Config(format!(
                    "Duplicate workflow '{}'",
                    workflow.id
                )));
            }
            workflow.validate()?;
            let unknown = workflow
                .steps
                .iter()
                .filter(|s| s.kind == StepKind::Execute)
                .filter_map(|s| s.agent_id.as_deref().map(|a| (s, a)))
                .find(|(_, agent)| !agents.contains(agent));
            if let Some((step, agent)) = unknown {
                return Err(CohortError::Config(format!(
                    "Workflow '{}' step '{}' runs on unknown agent '{agent}'",
                    workflow.id, step.id
                )));
            }
        }
        Ok(())
    }

    /// Directory with every configured agent marked running.
    pub fn directory(&self) -> Arc<InMemoryDirectory> {
        let directory = InMemoryDirectory::new();
        for entry in &self.agents {
            directory.register(entry.descriptor.clone());
        }
        Arc::new(directory)
    }

    /// Ledger seeded with every agent and its capability scores.
    pub fn ledger(&self) -> CohortResult<Arc<AgentLedger>> {
        let ledger = AgentLedger::new();
        for entry in &self.agents {
            let mut scores: Vec<AgentCapability> = entry
                .scores
                .iter()
                .map(|(name, score)| AgentCapability::new(name.clone(), *score))
                .collect();
            scores.sort_by(|a, b| a.name.cmp(&b.name));
            ledger.register_capabilities(&entry.descriptor.id, scores)?;
        }
        Ok(Arc::new(ledger))
    }
}
