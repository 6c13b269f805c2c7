//! Shared fixtures for the integration tests.
//!
//! Scripted executors, a sleeper that records instead of waiting, and
//! helpers that build a coordinator over a SQLite store in a temp dir.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use waypoint::core::{
    CancelHandle, CancelSignal, CheckpointStore, ExecutionError, Pipeline, PipelineCoordinator,
    ProgressReporter, RetryPolicy, Sleeper, SqliteStore, StageContext, StageDef, StageExecutor,
    StageOutput,
};

/// search -> screening (gated) -> extraction
pub fn review_pipeline() -> Pipeline {
    Pipeline::new("review")
        .stage(StageDef::new("search"))
        .stage(StageDef::new("screening").gated())
        .stage(StageDef::new("extraction"))
}

/// File-backed store; keep the `TempDir` alive for the test's duration
pub fn temp_store() -> (TempDir, Arc<dyn CheckpointStore>) {
    let temp = TempDir::new().unwrap();
    let store = SqliteStore::open(&temp.path().join("checkpoints.db")).unwrap();
    (temp, Arc::new(store))
}

/// Coordinator over `store` with a fast retry policy and a recording sleeper
pub fn coordinator(
    pipeline: Pipeline,
    store: Arc<dyn CheckpointStore>,
    sleeper: Arc<RecordingSleeper>,
) -> PipelineCoordinator {
    PipelineCoordinator::new(pipeline, store)
        .with_retry_policy(RetryPolicy::default().with_delays(10, 100))
        .with_sleeper(sleeper)
}

/// Records requested delays and returns immediately
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

/// Processes `batches` batches of `batch` items from wherever the last run
/// stopped, and remembers the context of every run
pub struct BatchExecutor {
    batch: u64,
    batches: u64,
    seen: Mutex<Vec<StageContext>>,
}

impl BatchExecutor {
    pub fn new(batch: u64, batches: u64) -> Arc<Self> {
        Arc::new(Self {
            batch,
            batches,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn runs(&self) -> Vec<StageContext> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageExecutor for BatchExecutor {
    fn name(&self) -> &str {
        "batch"
    }

    async fn run(
        &self,
        ctx: StageContext,
        progress: &ProgressReporter,
        _cancel: &CancelSignal,
    ) -> Result<StageOutput, ExecutionError> {
        self.seen.lock().unwrap().push(ctx.clone());

        let start_batch = ctx
            .checkpoint_data
            .as_ref()
            .and_then(|d| d.get("next_batch"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let mut done = ctx.items_processed;
        for i in 0..self.batches {
            done += self.batch;
            progress
                .report(
                    done,
                    Some(format!("rec-{}", done)),
                    Some(serde_json::json!({ "next_batch": start_batch + i + 1 })),
                )
                .await
                .map_err(|e| ExecutionError::permanent(e.to_string()))?;
        }

        Ok(StageOutput::new(serde_json::json!({ "processed": done })))
    }
}

/// Fails the first `failures` calls, then succeeds
pub struct FlakyExecutor {
    failures: u32,
    error: ExecutionError,
    calls: AtomicU32,
}

impl FlakyExecutor {
    pub fn transient(failures: u32) -> Arc<Self> {
        Self::failing_with(failures, ExecutionError::transient("upstream timed out"))
    }

    pub fn permanent(failures: u32) -> Arc<Self> {
        Self::failing_with(failures, ExecutionError::new("schema mismatch in record 17"))
    }

    pub fn failing_with(failures: u32, error: ExecutionError) -> Arc<Self> {
        Arc::new(Self {
            failures,
            error,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for FlakyExecutor {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn run(
        &self,
        _ctx: StageContext,
        _progress: &ProgressReporter,
        _cancel: &CancelSignal,
    ) -> Result<StageOutput, ExecutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(self.error.clone());
        }
        Ok(StageOutput::new(serde_json::json!({ "calls": call + 1 })))
    }
}

/// Reports one batch, asks for cancellation, then honours it
pub struct InterruptedExecutor {
    handle: CancelHandle,
    batch: u64,
}

impl InterruptedExecutor {
    pub fn new(handle: CancelHandle, batch: u64) -> Arc<Self> {
        Arc::new(Self { handle, batch })
    }
}

#[async_trait]
impl StageExecutor for InterruptedExecutor {
    fn name(&self) -> &str {
        "interrupted"
    }

    async fn run(
        &self,
        ctx: StageContext,
        progress: &ProgressReporter,
        cancel: &CancelSignal,
    ) -> Result<StageOutput, ExecutionError> {
        let done = ctx.items_processed + self.batch;
        progress
            .report(done, Some(format!("rec-{}", done)), Some(serde_json::json!({ "cursor": done })))
            .await
            .map_err(|e| ExecutionError::permanent(e.to_string()))?;

        self.handle.cancel();
        cancel.cancelled().await;
        Err(ExecutionError::cancelled())
    }
}
