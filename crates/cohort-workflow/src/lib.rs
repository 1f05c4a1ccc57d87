//! Step-graph workflow interpreter for the Cohort kernel.
//!
//! A workflow is a directed graph of steps. `EXECUTE` steps call the shared
//! [`cohort_core::StepExecutor`]; the remaining kinds steer control flow
//! through branches, bounded loops, parallel fan-out and join points.
//!
//! # Main types
//!
//! - [`WorkflowEngine`] — Registers graphs and drives runs with pause, resume, cancel and timeouts.
//! - [`WorkflowConfig`] / [`WorkflowStep`] — The graph and its run policy.
//! - [`WorkflowExecutionContext`] — Serializable per-run state, resumable via [`WorkflowEngine::resume_from`].
//! - [`Condition`] — The `var:` / `step:` / `iteration:` guard language.

/// Guard conditions for `WAIT`, `LOOP` and `BRANCH` steps.
pub mod condition;
/// Workflow interpreter.
pub mod engine;
/// Workflow graph and run types.
pub mod types;

pub use condition::Condition;
pub use engine::{EngineSettings, WorkflowEngine};
pub use types::{
    BranchArm, ExecutionFilter, ExecutionMode, MergeStrategy, StepKind, WorkflowConfig,
    WorkflowExecutionContext, WorkflowExecutionResult, WorkflowState, WorkflowStatistics,
    WorkflowStep,
};
