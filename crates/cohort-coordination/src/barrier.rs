use cohort_core::{CohortError, CohortResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Configuration for a [`Barrier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierConfig {
    /// Barrier name, used in logs and error messages.
    #[serde(default = "default_name")]
    pub name: String,
    /// Per-call wait budget in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl BarrierConfig {
    /// Default configuration under the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

struct BarrierState {
    arrived: HashSet<String>,
    /// Number of times the barrier has tripped.
    generation: u64,
}

/// A rendezvous point that releases every waiting party once `expected`
/// distinct parties have arrived.
///
/// Completion is broadcast: all suspended `wait` calls resolve together, not
/// only the caller whose arrival completed the set.
pub struct Barrier {
    config: BarrierConfig,
    expected: usize,
    state: Mutex<BarrierState>,
    tripped: watch::Sender<u64>,
}

impl Barrier {
    /// Create a barrier expecting `expected` parties.
    pub fn new(expected: usize, config: BarrierConfig) -> Self {
        info!(barrier = %config.name, expected, "Barrier initialized");
        let (tripped, _) = watch::channel(0);
        Self {
            config,
            expected,
            state: Mutex::new(BarrierState {
                arrived: HashSet::new(),
                generation: 0,
            }),
            tripped,
        }
    }

    /// Barrier name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Arrive as `party` and wait for the barrier using the configured timeout.
    pub async fn wait(&self, party: &str) -> CohortResult<()> {
        self.wait_timeout(party, Duration::from_millis(self.config.timeout_ms))
            .await
    }

    /// Arrive as `party` and wait at most `timeout` for the remaining parties.
    ///
    /// A party that already arrived resolves immediately. On timeout only this
    /// caller fails; its arrival stays recorded.
    pub async fn wait_timeout(&self, party: &str, timeout: Duration) -> CohortResult<()> {
        let (mut rx, target) = {
            let mut state = self.state.lock();
            if state.arrived.contains(party) {
                return Ok(());
            }
            state.arrived.insert(party.to_string());
            debug!(
                barrier = %self.config.name,
                party,
                arrived = state.arrived.len(),
                expected = self.expected,
                "Party arrived at barrier"
            );

            if state.arrived.len() >= self.expected {
                state.generation += 1;
                self.tripped.send_replace(state.generation);
                info!(barrier = %self.config.name, expected = self.expected, "Barrier complete");
                return Ok(());
            }
            (self.tripped.subscribe(), state.generation + 1)
        };

        let result = match tokio::time::timeout(timeout, rx.wait_for(|generation| *generation >= target)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                let arrived = self.state.lock().arrived.len();
                warn!(
                    barrier = %self.config.name,
                    party,
                    arrived,
                    expected = self.expected,
                    "Barrier wait timed out"
                );
                Err(CohortError::Timeout(format!(
                    "Barrier '{}' timeout: {}/{} parties arrived",
                    self.config.name, arrived, self.expected
                )))
            }
        };
        result
    }

    /// Forget every arrival. Parties still suspended are released by the next
    /// completion or fail on their own timeout.
    pub fn reset(&self) {
        self.state.lock().arrived.clear();
        debug!(barrier = %self.config.name, "Barrier reset");
    }

    /// Distinct parties that have arrived.
    pub fn arrived_count(&self) -> usize {
        self.state.lock().arrived.len()
    }

    /// Parties required to trip the barrier.
    pub fn expected_count(&self) -> usize {
        self.expected
    }

    /// Whether every expected party has arrived.
    pub fn is_complete(&self) -> bool {
        self.state.lock().arrived.len() >= self.expected
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("name", &self.config.name)
            .field("expected", &self.expected)
            .field("arrived", &self.arrived_count())
            .finish()
    }
}
