//! Domain types for the waypoint coordinator.
//!
//! This module contains the core data structures:
//! - Checkpoint: per-stage progress and resume state
//! - Gate: reviewer and policy decisions
//! - Audit: immutable transition records

pub mod audit;
pub mod checkpoint;
pub mod gate;

// Re-export commonly used types
pub use audit::{ActorType, AuditAction, AuditContext, AuditLogEntry};
pub use checkpoint::{
    CheckpointStatus, CheckpointSummary, ErrorRecord, NewCheckpoint, ProgressUpdate, Resumed,
    StageState, WorkflowState, ERROR_HISTORY_LIMIT,
};
pub use gate::{Decision, GateDecision};
