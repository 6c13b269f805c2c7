//! Error taxonomy for the coordinator and checkpoint store.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{CheckpointStatus, Decision};

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Errors surfaced by the coordinator, gate controller, and store
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Retryable failure that exhausted the retry budget
    #[error("Stage '{stage}' for '{unit}' failed after {attempts} attempts (transient): {message}")]
    TransientExecution {
        unit: String,
        stage: String,
        checkpoint_id: Uuid,
        attempts: u32,
        message: String,
    },

    #[error("Stage '{stage}' for '{unit}' failed permanently: {message}")]
    PermanentExecution {
        unit: String,
        stage: String,
        checkpoint_id: Uuid,
        message: String,
    },

    /// A second active checkpoint was attempted
    #[error("Stage '{stage}' for '{unit}' already has an active checkpoint {active_id}")]
    ConcurrencyViolation {
        unit: String,
        stage: String,
        active_id: Uuid,
    },

    #[error("Stage '{stage}' for '{unit}' cannot complete: gate decision is {decision}")]
    GateViolation {
        unit: String,
        stage: String,
        checkpoint_id: Uuid,
        decision: Decision,
    },

    #[error("Progress for checkpoint {checkpoint_id} would decrease: {current} -> {attempted}")]
    MonotonicityViolation {
        checkpoint_id: Uuid,
        current: u64,
        attempted: u64,
    },

    #[error("Progress for checkpoint {checkpoint_id} exceeds total: {attempted} > {total}")]
    InvalidProgress {
        checkpoint_id: Uuid,
        attempted: u64,
        total: u64,
    },

    #[error("Checkpoint {checkpoint_id} cannot move from {from} ({action})")]
    InvalidTransition {
        checkpoint_id: Uuid,
        from: CheckpointStatus,
        action: &'static str,
    },

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    #[error("Stage '{stage}' for '{unit}' requires '{predecessor}' to be completed first")]
    PredecessorIncomplete {
        unit: String,
        stage: String,
        predecessor: String,
    },

    #[error("Re-run of '{stage}' for '{unit}' must use a new execution id (got '{execution_id}')")]
    DuplicateExecution {
        unit: String,
        stage: String,
        execution_id: String,
    },

    #[error("Stage '{stage}' for '{unit}' has no checkpoint to re-run")]
    NothingToRerun { unit: String, stage: String },

    #[error("No executor registered for stage '{0}'")]
    MissingExecutor(String),

    #[error("Stage '{0}' is not gated; decisions are not accepted")]
    UngatedStage(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt stored record: {0}")]
    Corrupt(String),
}

impl PipelineError {
    /// Only exhausted transient failures are worth retrying later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExecution { .. })
    }

    /// Short machine-readable kind for CLI and logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientExecution { .. } => "transient_execution",
            Self::PermanentExecution { .. } => "permanent_execution",
            Self::ConcurrencyViolation { .. } => "concurrency_violation",
            Self::GateViolation { .. } => "gate_violation",
            Self::MonotonicityViolation { .. } => "monotonicity_violation",
            Self::InvalidProgress { .. } => "invalid_progress",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::CheckpointNotFound(_) => "checkpoint_not_found",
            Self::UnknownStage(_) => "unknown_stage",
            Self::PredecessorIncomplete { .. } => "predecessor_incomplete",
            Self::DuplicateExecution { .. } => "duplicate_execution",
            Self::NothingToRerun { .. } => "nothing_to_rerun",
            Self::MissingExecutor(_) => "missing_executor",
            Self::UngatedStage(_) => "ungated_stage",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::Corrupt(_) => "corrupt",
        }
    }
}
