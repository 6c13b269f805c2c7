//! Persistence contract for checkpoints, gate decisions, and the audit log.
//!
//! The store is the single source of truth. Every mutating call writes its
//! own audit entry in the same transaction as the change, and conflicting
//! writes to one checkpoint row are serialized by the implementation.
//! Nothing is cached across calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    AuditContext, AuditLogEntry, ErrorRecord, GateDecision, NewCheckpoint, ProgressUpdate, Resumed,
    WorkflowState,
};

use super::error::Result;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fetch a checkpoint row by id
    async fn get(&self, checkpoint_id: Uuid) -> Result<Option<WorkflowState>>;

    /// The current `in_progress`/`paused` row, if any
    async fn load_active(&self, unit_of_work_id: &str, stage_name: &str)
        -> Result<Option<WorkflowState>>;

    /// The most recently created row regardless of status
    async fn load_latest(&self, unit_of_work_id: &str, stage_name: &str)
        -> Result<Option<WorkflowState>>;

    /// All rows for a unit of work, oldest first
    async fn list_for_unit(&self, unit_of_work_id: &str) -> Result<Vec<WorkflowState>>;

    /// Rows whose finished execution waits on a gate decision
    async fn list_awaiting_gate(&self) -> Result<Vec<WorkflowState>>;

    /// Return the active row unchanged, or atomically insert a new one with
    /// `items_processed = 0`. Concurrent callers observe the same row.
    async fn create_or_resume(&self, request: NewCheckpoint, ctx: &AuditContext)
        -> Result<Resumed>;

    /// Insert a fresh row after a terminal one; never touches history.
    ///
    /// Fails with `ConcurrencyViolation` if an active row exists and with
    /// `DuplicateExecution` if the execution id matches the latest row. A
    /// refusal is still recorded as `rerun_rejected` in the audit log.
    async fn create_rerun(&self, request: NewCheckpoint, ctx: &AuditContext)
        -> Result<WorkflowState>;

    /// Apply one batch of progress. Decreasing `items_processed` is
    /// rejected without mutating the row.
    async fn record_progress(
        &self,
        checkpoint_id: Uuid,
        update: ProgressUpdate,
        ctx: &AuditContext,
    ) -> Result<WorkflowState>;

    /// Count a failure and keep the last few error records. The row stays
    /// `in_progress` for a retry, or becomes `failed` when `terminal`.
    async fn record_failure(
        &self,
        checkpoint_id: Uuid,
        error: ErrorRecord,
        terminal: bool,
        ctx: &AuditContext,
    ) -> Result<WorkflowState>;

    /// Execution finished on a gated stage; store its output and wait
    async fn mark_awaiting_gate(
        &self,
        checkpoint_id: Uuid,
        output: Option<serde_json::Value>,
        ctx: &AuditContext,
    ) -> Result<WorkflowState>;

    /// Park an active row (rejection or cancellation); progress is kept
    async fn pause(&self, checkpoint_id: Uuid, ctx: &AuditContext) -> Result<WorkflowState>;

    /// Move a paused row back to `in_progress` and clear any gate wait
    async fn reactivate(&self, checkpoint_id: Uuid, ctx: &AuditContext) -> Result<WorkflowState>;

    /// Mark the row completed. Fails with `GateViolation`, without
    /// mutating, if the row requires a gate whose applicable decision is
    /// not `approved`. `output` replaces the stored output when given.
    async fn complete(
        &self,
        checkpoint_id: Uuid,
        output: Option<serde_json::Value>,
        ctx: &AuditContext,
    ) -> Result<WorkflowState>;

    /// Record a gate decision. A rejection also pauses the awaiting row
    /// in the same transaction.
    ///
    /// `decided_at` is stamped by the store when the decision is written;
    /// the value on the argument is ignored.
    async fn record_decision(
        &self,
        decision: GateDecision,
        ctx: &AuditContext,
    ) -> Result<(GateDecision, Option<WorkflowState>)>;

    /// Most recent decision for the pair, if any
    async fn latest_decision(&self, unit_of_work_id: &str, stage_name: &str)
        -> Result<Option<GateDecision>>;

    /// Most recent decision made at or after `since`
    async fn decision_since(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<GateDecision>>;

    /// Append a free-standing audit entry
    async fn append_audit(&self, entry: AuditLogEntry) -> Result<AuditLogEntry>;

    /// Audit entries in append order, optionally for one stage
    async fn audit_trail(&self, unit_of_work_id: &str, stage_name: Option<&str>)
        -> Result<Vec<AuditLogEntry>>;
}
