//! waypoint - Resumable, checkpointed pipeline coordinator
//!
//! Coordinates long-running, multi-stage pipelines over units of work
//! (a review, a project) so they can be interrupted and resumed safely,
//! with human or policy approval gates between stages.
//!
//! # Architecture
//!
//! The system is built around persisted checkpoints:
//! - Each stage execution owns one checkpoint row; at most one is active
//! - Progress is recorded in batches and never decreases
//! - Every transition is written to an append-only audit log in the same
//!   transaction as the change
//! - Gated stages park after execution until a decision arrives
//!
//! # Modules
//!
//! - `adapters`: Stage executors for subprocesses and webhooks
//! - `core`: Coordinator, checkpoint store, retry policy, gates
//! - `domain`: Data structures (WorkflowState, GateDecision, AuditLogEntry)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the next incomplete stage for a unit of work
//! waypoint invoke review U1
//!
//! # Approve a stage waiting for review
//! waypoint decide review U1 screening approve --reviewer alice
//!
//! # Check stage states
//! waypoint status review U1
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{
    CheckpointStore, ExecutionContext, InvocationOutcome, Pipeline, PipelineCoordinator,
    PipelineError, SqliteStore, StageExecutor, StageStatus,
};
pub use crate::domain::{AuditLogEntry, CheckpointStatus, Decision, GateDecision, StageState, WorkflowState};
