use chrono::{DateTime, Utc};
use cohort_core::{CohortError, CohortResult, Priority};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration for a [`PriorityQueue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name, used in logs and error messages.
    #[serde(default = "default_name")]
    pub name: String,
    /// Maximum number of items; enqueueing past it fails.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Order by priority. When disabled the queue is plain FIFO.
    #[serde(default = "default_enable_priority")]
    pub enable_priority: bool,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_max_size() -> usize {
    1000
}

fn default_enable_priority() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_size: default_max_size(),
            enable_priority: default_enable_priority(),
        }
    }
}

impl QueueConfig {
    /// Default configuration under the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the capacity.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

/// A payload wrapped with its queue bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem<T> {
    /// Item id.
    pub id: Uuid,
    /// Caller-supplied payload.
    pub data: T,
    /// Priority at enqueue time.
    pub priority: Priority,
    /// When the item entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Free-form metadata, never inspected by the queue.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatistics {
    /// Items currently queued.
    pub total_items: usize,
    /// Items currently queued, per priority level.
    pub items_by_priority: HashMap<Priority, usize>,
    /// Items handed out by `dequeue`.
    pub processed_items: u64,
    /// Items removed through `mark_failed`.
    pub failed_items: u64,
}

/// A bounded queue ordered by `(priority desc, enqueue order asc)`.
///
/// Lookups by id are linear scans; queues are expected to stay small.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    config: QueueConfig,
    items: VecDeque<QueueItem<T>>,
    processed: u64,
    failed: u64,
}

impl<T> PriorityQueue<T> {
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        info!(queue = %config.name, max_size = config.max_size, "Queue initialized");
        Self {
            config,
            items: VecDeque::new(),
            processed: 0,
            failed: 0,
        }
    }

    /// The queue's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add an item and return its generated id.
    ///
    /// Fails with [`CohortError::CapacityExceeded`] when the queue is full.
    pub fn enqueue(&mut self, data: T, priority: Priority) -> CohortResult<Uuid> {
        self.enqueue_with(Uuid::new_v4(), data, priority, HashMap::new())
    }

    /// Add an item under a caller-chosen id.
    pub fn enqueue_with_id(&mut self, id: Uuid, data: T, priority: Priority) -> CohortResult<Uuid> {
        self.enqueue_with(id, data, priority, HashMap::new())
    }

    /// Add an item with metadata under a caller-chosen id.
    pub fn enqueue_with(
        &mut self,
        id: Uuid,
        data: T,
        priority: Priority,
        metadata: HashMap<String, serde_json::Value>,
    ) -> CohortResult<Uuid> {
        self.ensure_capacity()?;
        self.insert(QueueItem {
            id,
            data,
            priority,
            enqueued_at: Utc::now(),
            metadata,
        });
        Ok(id)
    }

    /// Add an item that was admitted once before, skipping the capacity check.
    ///
    /// A retried item already held a slot, so it may push the queue past
    /// `max_size` until the next dequeue instead of being turned away.
    pub fn readmit(&mut self, id: Uuid, data: T, priority: Priority) -> Uuid {
        self.insert(QueueItem {
            id,
            data,
            priority,
            enqueued_at: Utc::now(),
            metadata: HashMap::new(),
        });
        id
    }

    /// Put a previously dequeued item back at the head of the queue.
    pub fn push_front(&mut self, item: QueueItem<T>) -> CohortResult<()> {
        self.ensure_capacity()?;
        debug!(queue = %self.config.name, item_id = %item.id, "Item restored at head");
        self.items.push_front(item);
        Ok(())
    }

    /// Remove and return the head, or `None` when empty.
    pub fn dequeue(&mut self) -> Option<QueueItem<T>> {
        let item = self.items.pop_front()?;
        self.processed += 1;
        debug!(
            queue = %self.config.name,
            item_id = %item.id,
            priority = %item.priority,
            queue_size = self.items.len(),
            "Item dequeued"
        );
        Some(item)
    }

    /// The head without removing it.
    pub fn peek(&self) -> Option<&QueueItem<T>> {
        self.items.front()
    }

    /// Remove an item by id. Returns `false` when absent.
    pub fn remove(&mut self, id: Uuid) -> bool {
        match self.items.iter().position(|item| item.id == id) {
            Some(index) => {
                self.items.remove(index);
                debug!(queue = %self.config.name, item_id = %id, "Item removed");
                true
            }
            None => false,
        }
    }

    /// Look up an item by id.
    pub fn get(&self, id: Uuid) -> Option<&QueueItem<T>> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Iterate over queued items in dequeue order.
    pub fn items(&self) -> impl Iterator<Item = &QueueItem<T>> {
        self.items.iter()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.config.max_size
    }

    /// Remove an item and count it as failed. Returns `false` when absent.
    pub fn mark_failed(&mut self, id: Uuid) -> bool {
        match self.items.iter().position(|item| item.id == id) {
            Some(index) => {
                self.items.remove(index);
                self.failed += 1;
                debug!(queue = %self.config.name, item_id = %id, "Item marked as failed");
                true
            }
            None => false,
        }
    }

    /// Current counters.
    pub fn statistics(&self) -> QueueStatistics {
        let mut items_by_priority: HashMap<Priority, usize> =
            Priority::ALL.iter().map(|p| (*p, 0)).collect();
        for item in &self.items {
            *items_by_priority.entry(item.priority).or_default() += 1;
        }
        QueueStatistics {
            total_items: self.items.len(),
            items_by_priority,
            processed_items: self.processed,
            failed_items: self.failed,
        }
    }

    /// Drop every item and reset the counters.
    pub fn clear(&mut self) {
        self.items.clear();
        self.processed = 0;
        self.failed = 0;
        info!(queue = %self.config.name, "Queue cleared");
    }

    fn insert(&mut self, item: QueueItem<T>) {
        let (id, priority) = (item.id, item.priority);
        if self.config.enable_priority {
            // Behind every item of equal or higher priority.
            let pos = self
                .items
                .iter()
                .position(|existing| existing.priority < priority)
                .unwrap_or(self.items.len());
            self.items.insert(pos, item);
        } else {
            self.items.push_back(item);
        }
        debug!(
            queue = %self.config.name,
            item_id = %id,
            priority = %priority,
            queue_size = self.items.len(),
            "Item enqueued"
        );
    }

    fn ensure_capacity(&self) -> CohortResult<()> {
        if self.is_full() {
            return Err(CohortError::CapacityExceeded(format!(
                "Queue '{}' is full ({} items)",
                self.config.name, self.config.max_size
            )));
        }
        Ok(())
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
