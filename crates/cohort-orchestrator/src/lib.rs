//! Task scheduling and hierarchical delegation for multi-agent systems.
//!
//! The [`Scheduler`] owns a global pending queue, admits a bounded number of
//! concurrent executions, picks an agent per task and retries failures. The
//! [`HierarchyManager`] is the alternative entry path for supervisors that
//! delegate to their declared children. Both feed the shared [`AgentLedger`].
//!
//! # Main types
//!
//! - [`Scheduler`] — Priority scheduler with agent selection, timeout and retry.
//! - [`HierarchyManager`] — Capability, load and round-robin delegation under a supervisor.
//! - [`AgentLedger`] — Per-agent load, outcome statistics and capability scores.
//! - [`AgentDirectory`] — Agent catalog and liveness predicate consulted by the scheduler.
//! - [`Task`] / [`TaskSpec`] — The unit of work and its submission form.

/// Hierarchical delegation engine.
pub mod delegation;
/// Agent catalog and liveness seam.
pub mod directory;
/// Task scheduler.
pub mod engine;
/// Agent load and capability ledger.
pub mod ledger;
/// Shared task types.
pub mod types;

pub use delegation::{
    AgentReport, DelegationRequest, DelegationStrategy, HierarchyConfig, HierarchyManager,
    HierarchyStatistics, ReportFilter, ReportKind,
};
pub use directory::{AgentDescriptor, AgentDirectory, InMemoryDirectory};
pub use engine::{
    Scheduler, SchedulerConfig, SchedulerStatistics, SelectionCriteria, SelectionStrategy,
};
pub use ledger::{AgentCapability, AgentLedger, AgentLoad};
pub use types::{Task, TaskFilter, TaskSpec, TaskStatus};
