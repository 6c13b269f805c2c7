//! Core coordination logic.
//!
//! This module contains:
//! - Store: the checkpoint persistence contract and its SQLite implementation
//! - Pipeline: stage registry definitions and loading
//! - Retry: failure classification and backoff
//! - Gate: approval bookkeeping
//! - Coordinator: the per-invocation state machine

pub mod coordinator;
pub mod error;
pub mod executor;
pub mod gate;
pub mod pipeline;
pub mod retry;
pub mod sqlite_store;
pub mod store;

// Re-export commonly used types
pub use coordinator::{
    ExecutionContext, InvocationOutcome, PipelineCoordinator, StageReport, StageStatus,
};
pub use error::{PipelineError, Result};
pub use executor::{
    CancelHandle, CancelSignal, ExecutionError, ProgressReporter, StageContext, StageExecutor,
    StageOutput,
};
pub use gate::{GateController, PendingGate, DEFAULT_NOTIFY_AFTER_HOURS};
pub use pipeline::{ExecutorSpec, Pipeline, StageDef};
pub use retry::{
    next_delay, next_delay_with_jitter, ErrorClass, ErrorClassifier, ErrorPredicate, RetryPolicy,
    Sleeper, TokioSleeper,
};
pub use sqlite_store::SqliteStore;
pub use store::CheckpointStore;
