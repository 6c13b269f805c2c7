//! SQLite-backed checkpoint store.
//!
//! Three tables back the contract:
//!
//! 1. **workflow_state** - one row per stage execution, with a partial
//!    unique index enforcing a single active row per `(unit, stage)`
//! 2. **gate_decisions** - reviewer/policy verdicts
//! 3. **audit_log** - append-only; triggers refuse UPDATE and DELETE
//!
//! Every mutation runs in a `BEGIN IMMEDIATE` transaction so writers from
//! separate connections (or processes) serialize on the database lock, and
//! the audit row for a transition is committed with the transition itself.
//! A refused mutation commits a `*_rejected` audit row and leaves the
//! checkpoint untouched.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    AuditAction, AuditContext, AuditLogEntry, CheckpointStatus, Decision, ErrorRecord,
    GateDecision, NewCheckpoint, ProgressUpdate, Resumed, WorkflowState, ERROR_HISTORY_LIMIT,
};

use super::error::{PipelineError, Result};
use super::store::CheckpointStore;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_state (
    id TEXT PRIMARY KEY,
    unit_of_work_id TEXT NOT NULL,
    stage_name TEXT NOT NULL,
    execution_id TEXT NOT NULL,
    checkpoint_data TEXT,
    output TEXT,
    items_processed INTEGER NOT NULL DEFAULT 0,
    items_total INTEGER,
    last_processed_id TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error_details TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL
        CHECK (status IN ('in_progress', 'paused', 'completed', 'failed')),
    requires_gate INTEGER NOT NULL DEFAULT 0,
    awaiting_gate_since TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Single active checkpoint per (unit, stage)
CREATE UNIQUE INDEX IF NOT EXISTS idx_workflow_state_single_active
    ON workflow_state(unit_of_work_id, stage_name)
    WHERE status IN ('in_progress', 'paused');

CREATE INDEX IF NOT EXISTS idx_workflow_state_unit
    ON workflow_state(unit_of_work_id, stage_name, created_at);

CREATE TABLE IF NOT EXISTS gate_decisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    unit_of_work_id TEXT NOT NULL,
    stage_name TEXT NOT NULL,
    decision TEXT NOT NULL CHECK (decision IN ('approved', 'rejected', 'pending')),
    reviewer TEXT NOT NULL,
    feedback TEXT,
    decided_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gate_decisions_stage
    ON gate_decisions(unit_of_work_id, stage_name, decided_at DESC);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    unit_of_work_id TEXT NOT NULL,
    stage_name TEXT NOT NULL,
    checkpoint_id TEXT,
    actor_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    before_state TEXT,
    after_state TEXT,
    reasoning TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_unit
    ON audit_log(unit_of_work_id, stage_name, id);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update
    BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
    BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;
"#;

const STATE_COLUMNS: &str = "id, unit_of_work_id, stage_name, execution_id, checkpoint_data, \
     output, items_processed, items_total, last_processed_id, error_count, last_error_details, \
     status, requires_gate, awaiting_gate_since, created_at, updated_at";

const DECISION_COLUMNS: &str =
    "unit_of_work_id, stage_name, decision, reviewer, feedback, decided_at";

const AUDIT_COLUMNS: &str = "id, unit_of_work_id, stage_name, checkpoint_id, actor_type, actor, \
     action, before_state, after_state, reasoning, timestamp";

/// Checkpoint store over a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and initialise the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::Corrupt(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets readers proceed while one writer holds the lock
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.busy_timeout(Duration::from_secs(10))?;

        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "Opened checkpoint store");
        Ok(store)
    }

    /// In-memory database (tests and dry runs)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Corrupt("checkpoint store lock poisoned".to_string()))
    }

    /// Run `f` inside an immediate transaction; an `Err` rolls back
    fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn get(&self, checkpoint_id: Uuid) -> Result<Option<WorkflowState>> {
        self.with_conn(|conn| select_by_id(conn, checkpoint_id))
    }

    async fn load_active(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
    ) -> Result<Option<WorkflowState>> {
        self.with_conn(|conn| select_active(conn, unit_of_work_id, stage_name))
    }

    async fn load_latest(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
    ) -> Result<Option<WorkflowState>> {
        self.with_conn(|conn| select_latest(conn, unit_of_work_id, stage_name))
    }

    async fn list_for_unit(&self, unit_of_work_id: &str) -> Result<Vec<WorkflowState>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM workflow_state WHERE unit_of_work_id = ?1 \
                 ORDER BY created_at, rowid",
                STATE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![unit_of_work_id], read_state_row)?;
            rows.map(|row| row?.into_state()).collect()
        })
    }

    async fn list_awaiting_gate(&self) -> Result<Vec<WorkflowState>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM workflow_state \
                 WHERE status = 'in_progress' AND awaiting_gate_since IS NOT NULL \
                 ORDER BY awaiting_gate_since",
                STATE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], read_state_row)?;
            rows.map(|row| row?.into_state()).collect()
        })
    }

    async fn create_or_resume(
        &self,
        request: NewCheckpoint,
        ctx: &AuditContext,
    ) -> Result<Resumed> {
        self.with_tx(|tx| {
            if let Some(active) =
                select_active(tx, &request.unit_of_work_id, &request.stage_name)?
            {
                debug!(checkpoint_id = %active.id, "Resuming active checkpoint");
                return Ok(Resumed {
                    state: active,
                    created: false,
                });
            }

            let state = new_state(&request);
            match insert_state(tx, &state) {
                Ok(()) => {}
                Err(PipelineError::Storage(e)) if is_constraint_violation(&e) => {
                    // Lost a race the immediate lock should have prevented;
                    // the winner's row is the answer
                    let winner =
                        select_active(tx, &request.unit_of_work_id, &request.stage_name)?
                            .ok_or(PipelineError::Storage(e))?;
                    return Ok(Resumed {
                        state: winner,
                        created: false,
                    });
                }
                Err(e) => return Err(e),
            }

            insert_audit(
                tx,
                &AuditLogEntry::new(
                    &state.unit_of_work_id,
                    &state.stage_name,
                    AuditAction::CheckpointCreated,
                    ctx,
                )
                .with_checkpoint(state.id)
                .with_states(None, Some(snapshot(&state)?)),
            )?;

            Ok(Resumed {
                state,
                created: true,
            })
        })
    }

    async fn create_rerun(
        &self,
        request: NewCheckpoint,
        ctx: &AuditContext,
    ) -> Result<WorkflowState> {
        let unit = request.unit_of_work_id.as_str();
        let stage = request.stage_name.as_str();

        let outcome = self.with_tx(|tx| {
            if let Some(active) = select_active(tx, unit, stage)? {
                let err = PipelineError::ConcurrencyViolation {
                    unit: unit.to_string(),
                    stage: stage.to_string(),
                    active_id: active.id,
                };
                return reject(tx, AuditAction::RerunRejected, unit, stage, Some(&active), ctx, err);
            }

            let previous = match select_latest(tx, unit, stage)? {
                Some(previous) => previous,
                None => {
                    let err = PipelineError::NothingToRerun {
                        unit: unit.to_string(),
                        stage: stage.to_string(),
                    };
                    return reject(tx, AuditAction::RerunRejected, unit, stage, None, ctx, err);
                }
            };

            if previous.execution_id == request.execution_id {
                let err = PipelineError::DuplicateExecution {
                    unit: unit.to_string(),
                    stage: stage.to_string(),
                    execution_id: request.execution_id.clone(),
                };
                return reject(tx, AuditAction::RerunRejected, unit, stage, Some(&previous), ctx, err);
            }

            let state = new_state(&request);
            insert_state(tx, &state)?;
            insert_audit(
                tx,
                &AuditLogEntry::new(
                    &state.unit_of_work_id,
                    &state.stage_name,
                    AuditAction::RerunCreated,
                    ctx,
                )
                .with_checkpoint(state.id)
                .with_states(Some(snapshot(&previous)?), Some(snapshot(&state)?)),
            )?;

            Ok(Ok(state))
        })?;

        outcome
    }

    async fn record_progress(
        &self,
        checkpoint_id: Uuid,
        update: ProgressUpdate,
        ctx: &AuditContext,
    ) -> Result<WorkflowState> {
        let outcome = self.with_tx(|tx| {
            let before = require_state(tx, checkpoint_id)?;
            if before.status != CheckpointStatus::InProgress || before.is_awaiting_gate() {
                return refuse_transition(tx, &before, "record progress", ctx);
            }

            let rejection = if update.items_processed < before.items_processed {
                Some(PipelineError::MonotonicityViolation {
                    checkpoint_id,
                    current: before.items_processed,
                    attempted: update.items_processed,
                })
            } else {
                match before.items_total {
                    Some(total) if update.items_processed > total => {
                        Some(PipelineError::InvalidProgress {
                            checkpoint_id,
                            attempted: update.items_processed,
                            total,
                        })
                    }
                    _ => None,
                }
            };

            if let Some(rejection) = rejection {
                return reject(
                    tx,
                    AuditAction::ProgressRejected,
                    &before.unit_of_work_id,
                    &before.stage_name,
                    Some(&before),
                    ctx,
                    rejection,
                );
            }

            let mut after = before.clone();
            after.items_processed = update.items_processed;
            if update.last_processed_id.is_some() {
                after.last_processed_id = update.last_processed_id;
            }
            if update.checkpoint_data.is_some() {
                after.checkpoint_data = update.checkpoint_data;
            }
            after.updated_at = Utc::now();

            update_state(tx, &after)?;
            insert_audit(
                tx,
                &transition_entry(AuditAction::ProgressRecorded, ctx, &before, &after)?,
            )?;

            Ok(Ok(after))
        })?;

        outcome
    }

    async fn record_failure(
        &self,
        checkpoint_id: Uuid,
        error: ErrorRecord,
        terminal: bool,
        ctx: &AuditContext,
    ) -> Result<WorkflowState> {
        let outcome = self.with_tx(|tx| {
            let before = require_state(tx, checkpoint_id)?;
            if before.status != CheckpointStatus::InProgress {
                return refuse_transition(tx, &before, "record failure", ctx);
            }

            let mut after = before.clone();
            after.error_count += 1;
            after.last_error_details.push(error);
            let overflow = after
                .last_error_details
                .len()
                .saturating_sub(ERROR_HISTORY_LIMIT);
            after.last_error_details.drain(..overflow);
            if terminal {
                after.status = CheckpointStatus::Failed;
            }
            after.updated_at = Utc::now();

            update_state(tx, &after)?;

            let action = if terminal {
                AuditAction::StageFailed
            } else {
                AuditAction::RetryScheduled
            };
            insert_audit(tx, &transition_entry(action, ctx, &before, &after)?)?;

            Ok(Ok(after))
        })?;

        outcome
    }

    async fn mark_awaiting_gate(
        &self,
        checkpoint_id: Uuid,
        output: Option<serde_json::Value>,
        ctx: &AuditContext,
    ) -> Result<WorkflowState> {
        let outcome = self.with_tx(|tx| {
            let before = require_state(tx, checkpoint_id)?;
            if before.status != CheckpointStatus::InProgress || before.is_awaiting_gate() {
                return refuse_transition(tx, &before, "await gate", ctx);
            }

            let mut after = before.clone();
            let now = Utc::now();
            after.awaiting_gate_since = Some(now);
            if output.is_some() {
                after.output = output;
            }
            after.updated_at = now;

            update_state(tx, &after)?;
            insert_audit(
                tx,
                &transition_entry(AuditAction::AwaitingGate, ctx, &before, &after)?,
            )?;

            Ok(Ok(after))
        })?;

        outcome
    }

    async fn pause(&self, checkpoint_id: Uuid, ctx: &AuditContext) -> Result<WorkflowState> {
        let outcome = self.with_tx(|tx| {
            let before = require_state(tx, checkpoint_id)?;
            pause_in_tx(tx, before, ctx)
        })?;

        outcome
    }

    async fn reactivate(&self, checkpoint_id: Uuid, ctx: &AuditContext) -> Result<WorkflowState> {
        let outcome = self.with_tx(|tx| {
            let before = require_state(tx, checkpoint_id)?;
            match before.status {
                CheckpointStatus::InProgress => return Ok(Ok(before)),
                CheckpointStatus::Paused => {}
                _ => return refuse_transition(tx, &before, "reactivate", ctx),
            }

            let mut after = before.clone();
            after.status = CheckpointStatus::InProgress;
            after.awaiting_gate_since = None;
            after.updated_at = Utc::now();

            update_state(tx, &after)?;
            insert_audit(
                tx,
                &transition_entry(AuditAction::StageResumed, ctx, &before, &after)?,
            )?;

            Ok(Ok(after))
        })?;

        outcome
    }

    async fn complete(
        &self,
        checkpoint_id: Uuid,
        output: Option<serde_json::Value>,
        ctx: &AuditContext,
    ) -> Result<WorkflowState> {
        let outcome = self.with_tx(|tx| {
            let before = require_state(tx, checkpoint_id)?;
            if before.status != CheckpointStatus::InProgress {
                return refuse_transition(tx, &before, "complete", ctx);
            }

            if before.requires_gate {
                let decision = match before.awaiting_gate_since {
                    Some(since) => select_decision_since(
                        tx,
                        &before.unit_of_work_id,
                        &before.stage_name,
                        since,
                    )?
                    .map(|d| d.decision)
                    .unwrap_or(Decision::Pending),
                    None => Decision::Pending,
                };

                if decision != Decision::Approved {
                    let violation = PipelineError::GateViolation {
                        unit: before.unit_of_work_id.clone(),
                        stage: before.stage_name.clone(),
                        checkpoint_id,
                        decision,
                    };
                    return reject(
                        tx,
                        AuditAction::CompletionRejected,
                        &before.unit_of_work_id,
                        &before.stage_name,
                        Some(&before),
                        ctx,
                        violation,
                    );
                }
            }

            let mut after = before.clone();
            after.status = CheckpointStatus::Completed;
            if output.is_some() {
                after.output = output;
            }
            after.updated_at = Utc::now();

            update_state(tx, &after)?;
            insert_audit(
                tx,
                &transition_entry(AuditAction::StageCompleted, ctx, &before, &after)?,
            )?;

            Ok(Ok(after))
        })?;

        outcome
    }

    async fn record_decision(
        &self,
        decision: GateDecision,
        ctx: &AuditContext,
    ) -> Result<(GateDecision, Option<WorkflowState>)> {
        let mut decision = decision;
        self.with_tx(|tx| {
            let active = select_active(tx, &decision.unit_of_work_id, &decision.stage_name)?;

            // Stamped under the write lock, so it cannot predate the wait it answers
            decision.decided_at = match active.as_ref().and_then(|s| s.awaiting_gate_since) {
                Some(since) => Utc::now().max(since),
                None => Utc::now(),
            };

            tx.execute(
                "INSERT INTO gate_decisions \
                 (unit_of_work_id, stage_name, decision, reviewer, feedback, decided_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    decision.unit_of_work_id,
                    decision.stage_name,
                    decision.decision.as_str(),
                    decision.reviewer,
                    decision.feedback,
                    format_ts(decision.decided_at),
                ],
            )?;

            let mut entry = AuditLogEntry::new(
                &decision.unit_of_work_id,
                &decision.stage_name,
                AuditAction::GateDecisionRecorded,
                ctx,
            )
            .with_states(None, Some(serde_json::to_value(&decision)?));
            if let Some(ref state) = active {
                entry = entry.with_checkpoint(state.id);
            }
            insert_audit(tx, &entry)?;

            let state = match active {
                Some(state) if decision.decision == Decision::Rejected && state.is_awaiting_gate() => {
                    Some(pause_in_tx(tx, state, ctx)??)
                }
                other => other,
            };

            Ok((decision, state))
        })
    }

    async fn latest_decision(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
    ) -> Result<Option<GateDecision>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM gate_decisions \
                 WHERE unit_of_work_id = ?1 AND stage_name = ?2 \
                 ORDER BY decided_at DESC, id DESC LIMIT 1",
                DECISION_COLUMNS
            );
            conn.query_row(&sql, params![unit_of_work_id, stage_name], read_decision_row)
                .optional()?
                .map(RawDecision::into_decision)
                .transpose()
        })
    }

    async fn decision_since(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<GateDecision>> {
        self.with_conn(|conn| select_decision_since(conn, unit_of_work_id, stage_name, since))
    }

    async fn append_audit(&self, entry: AuditLogEntry) -> Result<AuditLogEntry> {
        self.with_tx(|tx| {
            let id = insert_audit(tx, &entry)?;
            Ok(AuditLogEntry {
                id: Some(id),
                ..entry
            })
        })
    }

    async fn audit_trail(
        &self,
        unit_of_work_id: &str,
        stage_name: Option<&str>,
    ) -> Result<Vec<AuditLogEntry>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM audit_log \
                 WHERE unit_of_work_id = ?1 AND (?2 IS NULL OR stage_name = ?2) \
                 ORDER BY id",
                AUDIT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![unit_of_work_id, stage_name], read_audit_row)?;
            rows.map(|row| row?.into_entry()).collect()
        })
    }
}

fn new_state(request: &NewCheckpoint) -> WorkflowState {
    let now = Utc::now();
    WorkflowState {
        id: Uuid::new_v4(),
        unit_of_work_id: request.unit_of_work_id.clone(),
        stage_name: request.stage_name.clone(),
        execution_id: request.execution_id.clone(),
        checkpoint_data: None,
        output: None,
        items_processed: 0,
        items_total: request.items_total,
        last_processed_id: None,
        error_count: 0,
        last_error_details: Vec::new(),
        status: CheckpointStatus::InProgress,
        requires_gate: request.requires_gate,
        awaiting_gate_since: None,
        created_at: now,
        updated_at: now,
    }
}

fn pause_in_tx(
    tx: &Transaction<'_>,
    before: WorkflowState,
    ctx: &AuditContext,
) -> Result<Result<WorkflowState>> {
    match before.status {
        CheckpointStatus::Paused => return Ok(Ok(before)),
        CheckpointStatus::InProgress => {}
        _ => return refuse_transition(tx, &before, "pause", ctx),
    }

    let mut after = before.clone();
    after.status = CheckpointStatus::Paused;
    after.awaiting_gate_since = None;
    after.updated_at = Utc::now();

    update_state(tx, &after)?;
    insert_audit(
        tx,
        &transition_entry(AuditAction::StagePaused, ctx, &before, &after)?,
    )?;

    Ok(Ok(after))
}

/// Commit an audit entry for a refused operation and hand the error back.
///
/// The outer `Result` carries storage failures (and rolls back); the inner
/// one is the refusal, returned after the transaction commits.
fn reject<T>(
    tx: &Transaction<'_>,
    action: AuditAction,
    unit_of_work_id: &str,
    stage_name: &str,
    state: Option<&WorkflowState>,
    ctx: &AuditContext,
    error: PipelineError,
) -> Result<Result<T>> {
    let mut rejected_ctx = ctx.clone();
    rejected_ctx.reasoning = Some(error.to_string());

    let mut entry = AuditLogEntry::new(unit_of_work_id, stage_name, action, &rejected_ctx);
    if let Some(state) = state {
        entry = entry
            .with_checkpoint(state.id)
            .with_states(Some(snapshot(state)?), None);
    }
    insert_audit(tx, &entry)?;

    debug!(
        unit = %unit_of_work_id,
        stage = %stage_name,
        action = %action,
        error = %error,
        "Refused checkpoint operation"
    );
    Ok(Err(error))
}

fn refuse_transition<T>(
    tx: &Transaction<'_>,
    before: &WorkflowState,
    action: &'static str,
    ctx: &AuditContext,
) -> Result<Result<T>> {
    let err = PipelineError::InvalidTransition {
        checkpoint_id: before.id,
        from: before.status,
        action,
    };
    reject(
        tx,
        AuditAction::TransitionRejected,
        &before.unit_of_work_id,
        &before.stage_name,
        Some(before),
        ctx,
        err,
    )
}

fn transition_entry(
    action: AuditAction,
    ctx: &AuditContext,
    before: &WorkflowState,
    after: &WorkflowState,
) -> Result<AuditLogEntry> {
    Ok(
        AuditLogEntry::new(&after.unit_of_work_id, &after.stage_name, action, ctx)
            .with_checkpoint(after.id)
            .with_states(Some(snapshot(before)?), Some(snapshot(after)?)),
    )
}

/// Compact state captured in audit entries
fn snapshot(state: &WorkflowState) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(state.summary())?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "status".to_string(),
            serde_json::Value::String(state.status.as_str().to_string()),
        );
    }
    Ok(value)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Fixed-width RFC 3339 so lexical order equals time order
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PipelineError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(PipelineError::from)
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| PipelineError::Corrupt(format!("bad uuid '{}': {}", raw, e)))
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn json_text(value: &Option<serde_json::Value>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(PipelineError::from)
}

fn require_state(conn: &Connection, checkpoint_id: Uuid) -> Result<WorkflowState> {
    select_by_id(conn, checkpoint_id)?.ok_or(PipelineError::CheckpointNotFound(checkpoint_id))
}

fn select_by_id(conn: &Connection, checkpoint_id: Uuid) -> Result<Option<WorkflowState>> {
    let sql = format!("SELECT {} FROM workflow_state WHERE id = ?1", STATE_COLUMNS);
    conn.query_row(&sql, params![checkpoint_id.to_string()], read_state_row)
        .optional()?
        .map(RawState::into_state)
        .transpose()
}

fn select_active(
    conn: &Connection,
    unit_of_work_id: &str,
    stage_name: &str,
) -> Result<Option<WorkflowState>> {
    let sql = format!(
        "SELECT {} FROM workflow_state \
         WHERE unit_of_work_id = ?1 AND stage_name = ?2 AND status IN ('in_progress', 'paused')",
        STATE_COLUMNS
    );
    conn.query_row(&sql, params![unit_of_work_id, stage_name], read_state_row)
        .optional()?
        .map(RawState::into_state)
        .transpose()
}

fn select_latest(
    conn: &Connection,
    unit_of_work_id: &str,
    stage_name: &str,
) -> Result<Option<WorkflowState>> {
    let sql = format!(
        "SELECT {} FROM workflow_state \
         WHERE unit_of_work_id = ?1 AND stage_name = ?2 \
         ORDER BY created_at DESC, rowid DESC LIMIT 1",
        STATE_COLUMNS
    );
    conn.query_row(&sql, params![unit_of_work_id, stage_name], read_state_row)
        .optional()?
        .map(RawState::into_state)
        .transpose()
}

fn select_decision_since(
    conn: &Connection,
    unit_of_work_id: &str,
    stage_name: &str,
    since: DateTime<Utc>,
) -> Result<Option<GateDecision>> {
    let sql = format!(
        "SELECT {} FROM gate_decisions \
         WHERE unit_of_work_id = ?1 AND stage_name = ?2 AND decided_at >= ?3 \
         ORDER BY decided_at DESC, id DESC LIMIT 1",
        DECISION_COLUMNS
    );
    conn.query_row(
        &sql,
        params![unit_of_work_id, stage_name, format_ts(since)],
        read_decision_row,
    )
    .optional()?
    .map(RawDecision::into_decision)
    .transpose()
}

fn insert_state(conn: &Connection, state: &WorkflowState) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO workflow_state ({}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            STATE_COLUMNS
        ),
        params![
            state.id.to_string(),
            state.unit_of_work_id,
            state.stage_name,
            state.execution_id,
            json_text(&state.checkpoint_data)?,
            json_text(&state.output)?,
            to_sql_count(state.items_processed),
            state.items_total.map(to_sql_count),
            state.last_processed_id,
            state.error_count,
            serde_json::to_string(&state.last_error_details)?,
            state.status.as_str(),
            state.requires_gate,
            state.awaiting_gate_since.map(format_ts),
            format_ts(state.created_at),
            format_ts(state.updated_at),
        ],
    )?;
    Ok(())
}

fn update_state(conn: &Connection, state: &WorkflowState) -> Result<()> {
    let changed = conn.execute(
        "UPDATE workflow_state SET \
             checkpoint_data = ?2, output = ?3, items_processed = ?4, \
             last_processed_id = ?5, error_count = ?6, last_error_details = ?7, \
             status = ?8, awaiting_gate_since = ?9, updated_at = ?10 \
         WHERE id = ?1",
        params![
            state.id.to_string(),
            json_text(&state.checkpoint_data)?,
            json_text(&state.output)?,
            to_sql_count(state.items_processed),
            state.last_processed_id,
            state.error_count,
            serde_json::to_string(&state.last_error_details)?,
            state.status.as_str(),
            state.awaiting_gate_since.map(format_ts),
            format_ts(state.updated_at),
        ],
    )?;

    if changed == 0 {
        return Err(PipelineError::CheckpointNotFound(state.id));
    }
    Ok(())
}

fn insert_audit(conn: &Connection, entry: &AuditLogEntry) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_log \
         (unit_of_work_id, stage_name, checkpoint_id, actor_type, actor, action, \
          before_state, after_state, reasoning, timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.unit_of_work_id,
            entry.stage_name,
            entry.checkpoint_id.map(|id| id.to_string()),
            entry.actor_type.as_str(),
            entry.actor,
            entry.action.as_str(),
            json_text(&entry.before_state)?,
            json_text(&entry.after_state)?,
            entry.reasoning,
            format_ts(entry.timestamp),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Column values as stored, before domain parsing
struct RawState {
    id: String,
    unit_of_work_id: String,
    stage_name: String,
    execution_id: String,
    checkpoint_data: Option<String>,
    output: Option<String>,
    items_processed: i64,
    items_total: Option<i64>,
    last_processed_id: Option<String>,
    error_count: u32,
    last_error_details: String,
    status: String,
    requires_gate: bool,
    awaiting_gate_since: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_state_row(row: &Row<'_>) -> rusqlite::Result<RawState> {
    Ok(RawState {
        id: row.get(0)?,
        unit_of_work_id: row.get(1)?,
        stage_name: row.get(2)?,
        execution_id: row.get(3)?,
        checkpoint_data: row.get(4)?,
        output: row.get(5)?,
        items_processed: row.get(6)?,
        items_total: row.get(7)?,
        last_processed_id: row.get(8)?,
        error_count: row.get(9)?,
        last_error_details: row.get(10)?,
        status: row.get(11)?,
        requires_gate: row.get(12)?,
        awaiting_gate_since: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl RawState {
    fn into_state(self) -> Result<WorkflowState> {
        Ok(WorkflowState {
            id: parse_uuid(&self.id)?,
            unit_of_work_id: self.unit_of_work_id,
            stage_name: self.stage_name,
            execution_id: self.execution_id,
            checkpoint_data: parse_json(self.checkpoint_data)?,
            output: parse_json(self.output)?,
            items_processed: from_sql_count(self.items_processed),
            items_total: self.items_total.map(from_sql_count),
            last_processed_id: self.last_processed_id,
            error_count: self.error_count,
            last_error_details: serde_json::from_str(&self.last_error_details)?,
            status: self.status.parse().map_err(PipelineError::Corrupt)?,
            requires_gate: self.requires_gate,
            awaiting_gate_since: self.awaiting_gate_since.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RawDecision {
    unit_of_work_id: String,
    stage_name: String,
    decision: String,
    reviewer: String,
    feedback: Option<String>,
    decided_at: String,
}

fn read_decision_row(row: &Row<'_>) -> rusqlite::Result<RawDecision> {
    Ok(RawDecision {
        unit_of_work_id: row.get(0)?,
        stage_name: row.get(1)?,
        decision: row.get(2)?,
        reviewer: row.get(3)?,
        feedback: row.get(4)?,
        decided_at: row.get(5)?,
    })
}

impl RawDecision {
    fn into_decision(self) -> Result<GateDecision> {
        Ok(GateDecision {
            unit_of_work_id: self.unit_of_work_id,
            stage_name: self.stage_name,
            decision: self.decision.parse().map_err(PipelineError::Corrupt)?,
            reviewer: self.reviewer,
            feedback: self.feedback,
            decided_at: parse_ts(&self.decided_at)?,
        })
    }
}

struct RawAudit {
    id: i64,
    unit_of_work_id: String,
    stage_name: String,
    checkpoint_id: Option<String>,
    actor_type: String,
    actor: String,
    action: String,
    before_state: Option<String>,
    after_state: Option<String>,
    reasoning: Option<String>,
    timestamp: String,
}

fn read_audit_row(row: &Row<'_>) -> rusqlite::Result<RawAudit> {
    Ok(RawAudit {
        id: row.get(0)?,
        unit_of_work_id: row.get(1)?,
        stage_name: row.get(2)?,
        checkpoint_id: row.get(3)?,
        actor_type: row.get(4)?,
        actor: row.get(5)?,
        action: row.get(6)?,
        before_state: row.get(7)?,
        after_state: row.get(8)?,
        reasoning: row.get(9)?,
        timestamp: row.get(10)?,
    })
}

impl RawAudit {
    fn into_entry(self) -> Result<AuditLogEntry> {
        Ok(AuditLogEntry {
            id: Some(self.id),
            unit_of_work_id: self.unit_of_work_id,
            stage_name: self.stage_name,
            checkpoint_id: self.checkpoint_id.as_deref().map(parse_uuid).transpose()?,
            actor_type: self.actor_type.parse().map_err(PipelineError::Corrupt)?,
            actor: self.actor,
            action: self.action.parse().map_err(PipelineError::Corrupt)?,
            before_state: parse_json(self.before_state)?,
            after_state: parse_json(self.after_state)?,
            reasoning: self.reasoning,
            timestamp: parse_ts(&self.timestamp)?,
        })
    }
}
