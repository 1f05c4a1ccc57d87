use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// Configuration for a [`SharedState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStateConfig {
    /// Store name, used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Keep superseded and deleted values in a per-key history.
    #[serde(default = "default_enable_versioning")]
    pub enable_versioning: bool,
    /// Maximum history entries retained per key; the oldest are dropped.
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_enable_versioning() -> bool {
    true
}

fn default_max_history_size() -> usize {
    100
}

impl Default for SharedStateConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            enable_versioning: default_enable_versioning(),
            max_history_size: default_max_history_size(),
        }
    }
}

impl SharedStateConfig {
    /// Default configuration under the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A stored value with its version metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateValue {
    /// The value.
    pub value: serde_json::Value,
    /// Version, starting at 1 and increasing on every write to the key.
    pub version: u64,
    /// When this version was written.
    pub updated_at: DateTime<Utc>,
    /// Writer that produced this version, if known.
    pub updated_by: Option<String>,
}

#[derive(Default)]
struct StateInner {
    entries: HashMap<String, StateValue>,
    history: HashMap<String, VecDeque<StateValue>>,
    /// Highest version ever issued per key; survives deletes.
    versions: HashMap<String, u64>,
}

/// A versioned key-value store shared between agents.
pub struct SharedState {
    config: SharedStateConfig,
    inner: RwLock<StateInner>,
}

impl SharedState {
    /// Create an empty store.
    pub fn new(config: SharedStateConfig) -> Self {
        info!(state = %config.name, "SharedState initialized");
        Self {
            config,
            inner: RwLock::new(StateInner::default()),
        }
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Write `value` under `key` and return the new version.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
        updated_by: Option<&str>,
    ) -> u64 {
        let key = key.into();
        let mut inner = self.inner.write();

        let version = inner.versions.get(&key).copied().unwrap_or(0) + 1;
        inner.versions.insert(key.clone(), version);

        let previous = inner.entries.insert(
            key.clone(),
            StateValue {
                value,
                version,
                updated_at: Utc::now(),
                updated_by: updated_by.map(str::to_string),
            },
        );
        if let Some(previous) = previous {
            self.push_history(&mut inner, &key, previous);
        }

        debug!(state = %self.config.name, key = %key, version, updated_by, "State set");
        version
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().entries.get(key).map(|v| v.value.clone())
    }

    /// Current value of `key`, or `default` when absent.
    pub fn get_or(&self, key: &str, default: serde_json::Value) -> serde_json::Value {
        self.get(key).unwrap_or(default)
    }

    /// Current value of `key` with its version metadata.
    pub fn get_with_version(&self, key: &str) -> Option<StateValue> {
        self.inner.read().entries.get(key).cloned()
    }

    /// Whether `key` currently holds a value.
    pub fn has(&self, key: &str) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    /// Remove `key`, recording its last value in history first.
    /// Returns `false` when the key was absent.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.entries.remove(key) {
            Some(previous) => {
                self.push_history(&mut inner, key, previous);
                debug!(state = %self.config.name, key, "State deleted");
                true
            }
            None => false,
        }
    }

    /// Keys currently holding a value.
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }

    /// Snapshot of every key and its current value.
    pub fn entries(&self) -> HashMap<String, serde_json::Value> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Prior versions of `key`, oldest first. With `limit`, only the most
    /// recent `limit` entries are returned.
    pub fn history(&self, key: &str, limit: Option<usize>) -> Vec<StateValue> {
        let inner = self.inner.read();
        let Some(entries) = inner.history.get(key) else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |limit| entries.len().saturating_sub(limit));
        entries.iter().skip(skip).cloned().collect()
    }

    /// Drop every value, history entry and version counter.
    pub fn clear(&self) {
        *self.inner.write() = StateInner::default();
        info!(state = %self.config.name, "SharedState cleared");
    }

    fn push_history(&self, inner: &mut StateInner, key: &str, value: StateValue) {
        if !self.config.enable_versioning {
            return;
        }
        let ring = inner.history.entry(key.to_string()).or_default();
        ring.push_back(value);
        while ring.len() > self.config.max_history_size {
            ring.pop_front();
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(SharedStateConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let state = SharedState::default();
        assert_eq!(state.set("k", json!("v1"), Some("agent-a")), 1);
        assert_eq!(state.set("k", json!("v2"), None), 2);

        assert_eq!(state.get("k"), Some(json!("v2")));
        let history = state.history("k", None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, json!("v1"));
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].updated_by.as_deref(), Some("agent-a"));
    }

    #[test]
    fn test_get_or_default() {
        let state = SharedState::default();
        assert_eq!(state.get_or("missing", json!(0)), json!(0));
        assert!(!state.has("missing"));
    }

    #[test]
    fn test_history_is_bounded_and_oldest_first() {
        let config = SharedStateConfig {
            max_history_size: 3,
            ..SharedStateConfig::named("bounded")
        };
        let state = SharedState::new(config);
        for i in 1..=6 {
            state.set("counter", json!(i), None);
        }
        let versions: Vec<u64> = state.history("counter", None).iter().map(|v| v.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);

        let latest: Vec<u64> = state.history("counter", Some(2)).iter().map(|v| v.version).collect();
        assert_eq!(latest, vec![4, 5]);
    }

    #[test]
    fn test_delete_records_history_and_keeps_versions_increasing() {
        let state = SharedState::default();
        state.set("plan", json!({"step": 1}), None);
        assert!(state.delete("plan"));
        assert!(!state.delete("plan"));
        assert!(state.get("plan").is_none());

        let history = state.history("plan", None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, json!({"step": 1}));

        assert_eq!(state.set("plan", json!({"step": 2}), None), 2);
    }

    #[test]
    fn test_versioning_disabled() {
        let config = SharedStateConfig {
            enable_versioning: false,
            ..SharedStateConfig::named("flat")
        };
        let state = SharedState::new(config);
        state.set("k", json!(1), None);
        state.set("k", json!(2), None);
        assert!(state.history("k", None).is_empty());
        assert_eq!(state.get_with_version("k").unwrap().version, 2);
    }

    #[test]
    fn test_keys_entries_clear() {
        let state = SharedState::default();
        state.set("a", json!(1), None);
        state.set("b", json!(2), None);

        let mut keys = state.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(state.entries()["b"], json!(2));

        state.clear();
        assert!(state.keys().is_empty());
        assert_eq!(state.set("a", json!(3), None), 1);
    }
}
