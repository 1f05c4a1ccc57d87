//! Coordination primitives for multi-agent systems.
//!
//! Everything here is owned by exactly one kernel instance and mutated only
//! through the documented operations, so lock scopes never straddle an await.
//!
//! # Main types
//!
//! - [`PriorityQueue`] — Bounded queue ordered by priority, then arrival.
//! - [`Semaphore`] — Counting semaphore with FIFO hand-off on release.
//! - [`Barrier`] — Rendezvous that releases every waiting party together.
//! - [`SharedState`] — Versioned key-value store with bounded per-key history.
//! - [`CoordinationManager`] — Named, lazily-created instances of the above.

/// Rendezvous barrier.
pub mod barrier;
/// Named primitive registry.
pub mod manager;
/// Bounded priority queue.
pub mod queue;
/// Counting semaphore.
pub mod semaphore;
/// Versioned shared key-value state.
pub mod shared_state;

pub use barrier::{Barrier, BarrierConfig};
pub use manager::{CoordinationManager, SharedQueue};
pub use queue::{PriorityQueue, QueueConfig, QueueItem, QueueStatistics};
pub use semaphore::Semaphore;
pub use shared_state::{SharedState, SharedStateConfig, StateValue};
