//! Checkpoint state for one stage execution.
//!
//! A `WorkflowState` row is the persisted progress/resume record for a
//! `(unit_of_work_id, stage_name)` pair. At most one row per pair may be
//! active (`in_progress` or `paused`) at a time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of failures kept in `last_error_details`
pub const ERROR_HISTORY_LIMIT: usize = 5;

/// Persisted status of a checkpoint row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl CheckpointStatus {
    /// Active rows are the ones resume reuses
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown checkpoint status '{}'", other)),
        }
    }
}

/// Coordinator-level view of a stage for one unit of work.
///
/// Derived from the latest checkpoint row; `AwaitingGate` is an
/// `in_progress` row whose execution finished and whose gate is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    NotStarted,
    InProgress,
    AwaitingGate,
    Paused,
    Completed,
    Failed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::AwaitingGate => "awaiting_gate",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Error message as reported by the executor
    pub message: String,

    /// `transient` or `permanent`
    pub classification: String,

    /// Zero-based attempt within the invocation that failed
    pub attempt: u32,

    pub occurred_at: DateTime<Utc>,
}

/// The checkpoint row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: Uuid,
    pub unit_of_work_id: String,
    pub stage_name: String,

    /// External correlation id of the invocation that created this row
    pub execution_id: String,

    /// Opaque, executor-owned resume payload
    pub checkpoint_data: Option<serde_json::Value>,

    /// Result of the finished stage execution (kept across rejections)
    pub output: Option<serde_json::Value>,

    pub items_processed: u64,

    /// `None` for streaming sources with unknown size
    pub items_total: Option<u64>,

    pub last_processed_id: Option<String>,
    pub error_count: u32,

    /// Most recent failures, oldest first, capped at `ERROR_HISTORY_LIMIT`
    pub last_error_details: Vec<ErrorRecord>,

    pub status: CheckpointStatus,

    /// Whether completion needs an approved gate decision
    pub requires_gate: bool,

    /// Set while the finished execution waits for a gate decision
    pub awaiting_gate_since: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Remaining items, undefined when the total is unknown
    pub fn items_remaining(&self) -> Option<u64> {
        self.items_total
            .map(|total| total.saturating_sub(self.items_processed))
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_awaiting_gate(&self) -> bool {
        self.status == CheckpointStatus::InProgress && self.awaiting_gate_since.is_some()
    }

    /// Derived stage state for this row
    pub fn stage_state(&self) -> StageState {
        match self.status {
            CheckpointStatus::InProgress if self.awaiting_gate_since.is_some() => {
                StageState::AwaitingGate
            }
            CheckpointStatus::InProgress => StageState::InProgress,
            CheckpointStatus::Paused => StageState::Paused,
            CheckpointStatus::Completed => StageState::Completed,
            CheckpointStatus::Failed => StageState::Failed,
        }
    }

    /// The latest recorded failure, if any
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.last_error_details.last()
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary::from(self)
    }
}

/// Compact view returned to callers of the trigger interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: Uuid,
    pub unit_of_work_id: String,
    pub stage_name: String,
    pub execution_id: String,
    pub state: StageState,
    pub items_processed: u64,
    pub items_total: Option<u64>,
    pub items_remaining: Option<u64>,
    pub last_processed_id: Option<String>,
    pub error_count: u32,
}

impl From<&WorkflowState> for CheckpointSummary {
    fn from(state: &WorkflowState) -> Self {
        Self {
            checkpoint_id: state.id,
            unit_of_work_id: state.unit_of_work_id.clone(),
            stage_name: state.stage_name.clone(),
            execution_id: state.execution_id.clone(),
            state: state.stage_state(),
            items_processed: state.items_processed,
            items_total: state.items_total,
            items_remaining: state.items_remaining(),
            last_processed_id: state.last_processed_id.clone(),
            error_count: state.error_count,
        }
    }
}

/// Request to create (or resume) a checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckpoint {
    pub unit_of_work_id: String,
    pub stage_name: String,
    pub execution_id: String,
    pub items_total: Option<u64>,
    pub requires_gate: bool,
}

impl NewCheckpoint {
    pub fn new(
        unit_of_work_id: impl Into<String>,
        stage_name: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            unit_of_work_id: unit_of_work_id.into(),
            stage_name: stage_name.into(),
            execution_id: execution_id.into(),
            items_total: None,
            requires_gate: false,
        }
    }

    pub fn with_items_total(mut self, items_total: Option<u64>) -> Self {
        self.items_total = items_total;
        self
    }

    pub fn gated(mut self, requires_gate: bool) -> Self {
        self.requires_gate = requires_gate;
        self
    }
}

/// One batch of progress reported by an executor
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub items_processed: u64,
    pub last_processed_id: Option<String>,
    pub checkpoint_data: Option<serde_json::Value>,
}

impl ProgressUpdate {
    pub fn new(items_processed: u64) -> Self {
        Self {
            items_processed,
            last_processed_id: None,
            checkpoint_data: None,
        }
    }

    pub fn with_last_processed_id(mut self, id: impl Into<String>) -> Self {
        self.last_processed_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.checkpoint_data = Some(data);
        self
    }
}

/// Result of `create_or_resume`
#[derive(Debug, Clone)]
pub struct Resumed {
    pub state: WorkflowState,

    /// False when an existing active row was returned
    pub created: bool,
}
