use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// What the scheduler needs to know about an agent to route work to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Higher is preferred by the highest-priority selection strategy.
    #[serde(default)]
    pub priority: i32,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Vec::new(),
            tags: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| (*t).to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// The agent catalog and liveness predicate the scheduler consults.
///
/// `agents` must return descriptors in registration order; the
/// first-available and round-robin strategies depend on it.
pub trait AgentDirectory: Send + Sync {
    /// Every known agent, in registration order.
    fn agents(&self) -> Vec<AgentDescriptor>;

    /// Whether `agent_id` may receive work right now.
    fn is_running(&self, agent_id: &str) -> bool;
}

/// Directory kept in memory, with an explicit running flag per agent.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: RwLock<Vec<(AgentDescriptor, bool)>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an agent and mark it running.
    pub fn register(&self, descriptor: AgentDescriptor) {
        let mut entries = self.entries.write();
        info!(agent = %descriptor.id, "Agent registered");
        match entries.iter_mut().find(|(d, _)| d.id == descriptor.id) {
            Some(entry) => *entry = (descriptor, true),
            None => entries.push((descriptor, true)),
        }
    }

    /// Returns `false` when the agent is unknown.
    pub fn set_running(&self, agent_id: &str, running: bool) -> bool {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|(d, _)| d.id == agent_id) {
            Some((_, flag)) => {
                *flag = running;
                info!(agent = %agent_id, running, "Agent liveness changed");
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(d, _)| d.id != agent_id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl AgentDirectory for InMemoryDirectory {
    fn agents(&self) -> Vec<AgentDescriptor> {
        self.entries.read().iter().map(|(d, _)| d.clone()).collect()
    }

    fn is_running(&self, agent_id: &str) -> bool {
        self.entries
            .read()
            .iter()
            .any(|(d, running)| *running && d.id == agent_id)
    }
}
