use crate::barrier::{Barrier, BarrierConfig};
use crate::queue::{PriorityQueue, QueueConfig};
use crate::semaphore::Semaphore;
use crate::shared_state::{SharedState, SharedStateConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A named queue handle. Payloads are opaque JSON documents.
pub type SharedQueue = Arc<Mutex<PriorityQueue<serde_json::Value>>>;

/// Owns named, lazily-created coordination primitives.
///
/// Getters create the primitive on first use; the configuration passed on
/// later calls is ignored once the name exists.
#[derive(Default)]
pub struct CoordinationManager {
    queues: RwLock<HashMap<String, SharedQueue>>,
    states: RwLock<HashMap<String, Arc<SharedState>>>,
    barriers: RwLock<HashMap<String, Arc<Barrier>>>,
    semaphores: RwLock<HashMap<String, Arc<Semaphore>>>,
}

impl CoordinationManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the queue called `name`.
    pub fn queue(&self, name: &str, config: Option<QueueConfig>) -> SharedQueue {
        let mut queues = self.queues.write();
        Arc::clone(queues.entry(name.to_string()).or_insert_with(|| {
            let config = config.unwrap_or_else(|| QueueConfig::named(name));
            Arc::new(Mutex::new(PriorityQueue::new(config)))
        }))
    }

    /// Get or create the shared state called `name`.
    pub fn state(&self, name: &str, config: Option<SharedStateConfig>) -> Arc<SharedState> {
        let mut states = self.states.write();
        Arc::clone(states.entry(name.to_string()).or_insert_with(|| {
            let config = config.unwrap_or_else(|| SharedStateConfig::named(name));
            Arc::new(SharedState::new(config))
        }))
    }

    /// Get or create the barrier called `name` expecting `expected` parties.
    pub fn barrier(
        &self,
        name: &str,
        expected: usize,
        config: Option<BarrierConfig>,
    ) -> Arc<Barrier> {
        let mut barriers = self.barriers.write();
        Arc::clone(barriers.entry(name.to_string()).or_insert_with(|| {
            let config = config.unwrap_or_else(|| BarrierConfig::named(name));
            Arc::new(Barrier::new(expected, config))
        }))
    }

    /// Get or create the semaphore called `name` with `permits` permits.
    pub fn semaphore(&self, name: &str, permits: usize) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.write();
        Arc::clone(
            semaphores
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(name, permits))),
        )
    }

    /// Clear and forget the queue called `name`.
    pub fn delete_queue(&self, name: &str) -> bool {
        match self.queues.write().remove(name) {
            Some(queue) => {
                queue.lock().clear();
                true
            }
            None => false,
        }
    }

    /// Clear and forget the shared state called `name`.
    pub fn delete_state(&self, name: &str) -> bool {
        match self.states.write().remove(name) {
            Some(state) => {
                state.clear();
                true
            }
            None => false,
        }
    }

    /// Forget the barrier called `name`. Holders of the handle keep using it.
    pub fn delete_barrier(&self, name: &str) -> bool {
        self.barriers.write().remove(name).is_some()
    }

    /// Forget the semaphore called `name`. Holders of the handle keep using it.
    pub fn delete_semaphore(&self, name: &str) -> bool {
        self.semaphores.write().remove(name).is_some()
    }

    /// Clear and forget every primitive.
    pub fn clear(&self) {
        for queue in self.queues.write().drain().map(|(_, q)| q) {
            queue.lock().clear();
        }
        for state in self.states.write().drain().map(|(_, s)| s) {
            state.clear();
        }
        self.barriers.write().clear();
        self.semaphores.write().clear();
        info!("CoordinationManager cleared");
    }
}
