//! Stage executor capability interface.
//!
//! Executors perform the actual work of a stage (run a search, screen a
//! batch, generate a document). The coordinator hands them the opaque
//! resume payload, a progress reporter, and a cancellation signal, and
//! records whatever they report.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{AuditContext, ProgressUpdate, WorkflowState};

use super::error::{PipelineError, Result};
use super::retry::ErrorClass;
use super::store::CheckpointStore;

/// Everything an executor needs to resume where the last run stopped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageContext {
    pub unit_of_work_id: String,
    pub stage_name: String,
    pub checkpoint_id: Uuid,
    pub execution_id: String,

    /// Opaque payload from the last confirmed progress report
    pub checkpoint_data: Option<serde_json::Value>,

    /// Furthest confirmed item in the stage's own item space
    pub last_processed_id: Option<String>,

    pub items_processed: u64,
    pub items_total: Option<u64>,

    /// Zero-based attempt within the current invocation
    pub attempt: u32,
}

impl StageContext {
    pub fn from_state(state: &WorkflowState, attempt: u32) -> Self {
        Self {
            unit_of_work_id: state.unit_of_work_id.clone(),
            stage_name: state.stage_name.clone(),
            checkpoint_id: state.id,
            execution_id: state.execution_id.clone(),
            checkpoint_data: state.checkpoint_data.clone(),
            last_processed_id: state.last_processed_id.clone(),
            items_processed: state.items_processed,
            items_total: state.items_total,
            attempt,
        }
    }

    /// True when a previous run already confirmed some progress
    pub fn is_resuming(&self) -> bool {
        self.items_processed > 0 || self.checkpoint_data.is_some()
    }
}

/// Result of a successful stage execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Stage result kept on the checkpoint row
    pub output: Option<serde_json::Value>,
}

impl StageOutput {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output: Some(output),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Failure reported by an executor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,

    /// HTTP status of the failing call, when there was one
    pub status_code: Option<u16>,

    /// Executor's own classification; overrides the retry predicates
    pub hint: Option<ErrorClass>,

    /// The executor stopped because cancellation was requested
    pub cancelled: bool,
}

impl ExecutionError {
    /// Unclassified failure; the retry policy decides
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            hint: None,
            cancelled: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(message).with_hint(ErrorClass::Transient)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(message).with_hint(ErrorClass::Permanent)
    }

    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            ..Self::new(message)
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::new("cancelled")
        }
    }

    pub fn with_hint(mut self, hint: ErrorClass) -> Self {
        self.hint = Some(hint);
        self
    }
}

/// Trait for stage executors
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Run (or resume) the stage.
    ///
    /// Implementations should skip items up to `ctx.last_processed_id`,
    /// report progress in batches, and return `ExecutionError::cancelled()`
    /// once they have honoured `cancel`.
    async fn run(
        &self,
        ctx: StageContext,
        progress: &ProgressReporter,
        cancel: &CancelSignal,
    ) -> std::result::Result<StageOutput, ExecutionError>;
}

/// Forwards executor progress to the checkpoint store
pub struct ProgressReporter {
    store: Arc<dyn CheckpointStore>,
    checkpoint_id: Uuid,
    unit_of_work_id: String,
    stage_name: String,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn CheckpointStore>, state: &WorkflowState) -> Self {
        Self {
            store,
            checkpoint_id: state.id,
            unit_of_work_id: state.unit_of_work_id.clone(),
            stage_name: state.stage_name.clone(),
        }
    }

    pub fn checkpoint_id(&self) -> Uuid {
        self.checkpoint_id
    }

    /// Persist one batch of progress.
    ///
    /// Rejected updates leave the checkpoint at its last good state; the
    /// executor may keep going and report again.
    pub async fn report(
        &self,
        items_processed: u64,
        last_processed_id: Option<String>,
        checkpoint_data: Option<serde_json::Value>,
    ) -> Result<WorkflowState> {
        let update = ProgressUpdate {
            items_processed,
            last_processed_id,
            checkpoint_data,
        };
        let ctx = AuditContext::system("executor progress report");

        match self
            .store
            .record_progress(self.checkpoint_id, update, &ctx)
            .await
        {
            Ok(state) => {
                debug!(
                    unit = %self.unit_of_work_id,
                    stage = %self.stage_name,
                    items_processed = state.items_processed,
                    "Progress recorded"
                );
                Ok(state)
            }
            Err(e) => {
                if matches!(
                    e,
                    PipelineError::MonotonicityViolation { .. } | PipelineError::InvalidProgress { .. }
                ) {
                    warn!(
                        unit = %self.unit_of_work_id,
                        stage = %self.stage_name,
                        checkpoint_id = %self.checkpoint_id,
                        error = %e,
                        "Progress update rejected"
                    );
                }
                Err(e)
            }
        }
    }
}

/// Sending half of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Create a linked handle and signal
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (
            Self { tx: Arc::new(tx) },
            CancelSignal {
                rx,
                _keepalive: None,
            },
        )
    }

    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

/// Receiving half of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,

    /// Holds the sender of a `never` signal open
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl CancelSignal {
    /// A signal that is never raised
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without cancelling: never resolves
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_execution_error_constructors() {
        let err = ExecutionError::transient("rate limited");
        assert_eq!(err.hint, Some(ErrorClass::Transient));
        assert!(!err.cancelled);

        let err = ExecutionError::http(429, "slow down");
        assert_eq!(err.status_code, Some(429));
        assert!(err.hint.is_none());

        assert!(ExecutionError::cancelled().cancelled);
    }

    #[tokio::test]
    async fn test_cancel_signal_resolves_after_cancel() {
        let (handle, signal) = CancelHandle::new();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_cancelled());
        assert!(handle.signal().is_cancelled());
    }

    #[tokio::test]
    async fn test_never_signal_does_not_resolve() {
        let signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
        assert!(!signal.is_cancelled());
    }
}
