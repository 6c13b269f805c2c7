//! Coordinator Integration Tests
//!
//! End-to-end invocations over a SQLite store: progress, retries,
//! cancellation and resume, predecessor ordering, and re-runs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{BatchExecutor, FlakyExecutor, InterruptedExecutor, RecordingSleeper};
use waypoint::core::{
    CancelHandle, ExecutionContext, ExecutionError, Pipeline, PipelineCoordinator, PipelineError,
    RetryPolicy, Sleeper, StageDef, StageStatus,
};
use waypoint::domain::{AuditAction, CheckpointStatus, StageState};

fn single_stage(name: &str, policy: Option<RetryPolicy>) -> Pipeline {
    let mut stage = StageDef::new(name);
    if let Some(policy) = policy {
        stage = stage.with_retry_policy(policy);
    }
    Pipeline::new("single").stage(stage)
}

#[tokio::test]
async fn test_batches_complete_ungated_stage() {
    let (_temp, store) = common::temp_store();
    let executor = BatchExecutor::new(50, 2);
    let coord = common::coordinator(common::review_pipeline(), store.clone(), RecordingSleeper::new())
        .with_executor("search", executor.clone());

    let outcome = coord
        .invoke_stage(
            "U1",
            Some("search"),
            ExecutionContext::new("exec-1").with_items_total(Some(100)),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, StageStatus::Completed);
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.items_processed, 100);
    assert_eq!(summary.items_remaining, Some(0));
    assert_eq!(summary.last_processed_id.as_deref(), Some("rec-100"));

    let stored = store.get(summary.checkpoint_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CheckpointStatus::Completed);
    assert_eq!(stored.output, Some(serde_json::json!({ "processed": 100 })));

    let progress_entries = store
        .audit_trail("U1", Some("search"))
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::ProgressRecorded)
        .count();
    assert_eq!(progress_entries, 2);
    assert_eq!(executor.runs().len(), 1);
}

#[tokio::test]
async fn test_transient_failures_then_success_keeps_error_count() {
    let (_temp, store) = common::temp_store();
    let sleeper = RecordingSleeper::new();
    let executor = FlakyExecutor::transient(3);
    let coord = common::coordinator(
        single_stage("extraction", Some(RetryPolicy::default().with_max_retries(5).with_delays(10, 100))),
        store.clone(),
        sleeper.clone(),
    )
    .with_executor("extraction", executor.clone());

    let outcome = coord
        .invoke_stage("U1", Some("extraction"), ExecutionContext::new("exec-1"))
        .await
        .unwrap();

    assert_eq!(outcome.status, StageStatus::Completed);
    assert_eq!(outcome.summary.as_ref().unwrap().error_count, 3);
    assert_eq!(executor.calls(), 4);

    let state = store.load_latest("U1", "extraction").await.unwrap().unwrap();
    assert_eq!(state.error_count, 3);
    assert_eq!(state.last_error_details.len(), 3);
    assert!(state
        .last_error_details
        .iter()
        .all(|e| e.classification == "transient"));

    let retries = store
        .audit_trail("U1", Some("extraction"))
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::RetryScheduled)
        .count();
    assert_eq!(retries, 3);

    // base 10ms doubling, jitter at most a quarter on top
    let delays = sleeper.delays();
    assert_eq!(delays.len(), 3);
    for (attempt, delay) in delays.iter().enumerate() {
        let floor = Duration::from_millis(10 * 2u64.pow(attempt as u32));
        assert!(*delay >= floor, "attempt {} delay {:?}", attempt, delay);
        assert!(*delay <= floor + floor / 4, "attempt {} delay {:?}", attempt, delay);
    }
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let (_temp, store) = common::temp_store();
    let sleeper = RecordingSleeper::new();
    let executor = FlakyExecutor::transient(u32::MAX);
    let coord = common::coordinator(single_stage("search", None), store.clone(), sleeper.clone())
        .with_retry_policy(RetryPolicy::default().with_max_retries(2).with_delays(10, 100))
        .with_executor("search", executor.clone());

    let err = coord
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-1"))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    match err {
        PipelineError::TransientExecution { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected transient failure, got {:?}", other),
    }
    assert_eq!(executor.calls(), 3);
    assert_eq!(sleeper.delays().len(), 2);

    let state = store.load_latest("U1", "search").await.unwrap().unwrap();
    assert_eq!(state.status, CheckpointStatus::Failed);
    assert_eq!(state.error_count, 3);

    // A failed stage is reported, not silently retried
    let outcome = coord
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-2"))
        .await
        .unwrap();
    assert!(matches!(outcome.status, StageStatus::Failed { error_count: 3, .. }));
    assert_eq!(executor.calls(), 3);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let (_temp, store) = common::temp_store();
    let sleeper = RecordingSleeper::new();
    let executor = FlakyExecutor::permanent(1);
    let coord = common::coordinator(single_stage("search", None), store.clone(), sleeper.clone())
        .with_executor("search", executor.clone());

    let err = coord
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::PermanentExecution { .. }));
    assert!(!err.is_retryable());
    assert_eq!(executor.calls(), 1);
    assert!(sleeper.delays().is_empty());

    let state = store.load_latest("U1", "search").await.unwrap().unwrap();
    assert_eq!(state.status, CheckpointStatus::Failed);
    assert_eq!(state.last_error().unwrap().classification, "permanent");
}

#[tokio::test]
async fn test_retryable_http_status_and_custom_predicate() {
    let (_temp, store) = common::temp_store();

    let http = FlakyExecutor::failing_with(1, ExecutionError::http(503, "service unavailable"));
    let quota = FlakyExecutor::failing_with(1, ExecutionError::new("quota exceeded for project"));
    let pipeline = Pipeline::new("p")
        .stage(StageDef::new("search"))
        .stage(StageDef::new("screening"));

    let coord = common::coordinator(pipeline, store, RecordingSleeper::new())
        .with_predicate(|e| e.message.contains("quota"))
        .with_executor("search", http.clone())
        .with_executor("screening", quota.clone());

    let outcome = coord.invoke_stage("U1", None, ExecutionContext::new("e1")).await.unwrap();
    assert_eq!(outcome.stage_name.as_deref(), Some("search"));
    assert_eq!(outcome.status, StageStatus::Completed);
    assert_eq!(http.calls(), 2);

    let outcome = coord.invoke_stage("U1", None, ExecutionContext::new("e2")).await.unwrap();
    assert_eq!(outcome.stage_name.as_deref(), Some("screening"));
    assert_eq!(outcome.status, StageStatus::Completed);
    assert_eq!(quota.calls(), 2);
}

#[tokio::test]
async fn test_cancellation_pauses_and_resume_continues() {
    let (_temp, store) = common::temp_store();
    let (handle, signal) = CancelHandle::new();

    let first = common::coordinator(single_stage("search", None), store.clone(), RecordingSleeper::new())
        .with_executor("search", InterruptedExecutor::new(handle, 25));

    let outcome = first
        .invoke_stage(
            "U1",
            Some("search"),
            ExecutionContext::new("exec-1")
                .with_items_total(Some(100))
                .with_cancel(signal),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, StageStatus::Paused);
    let paused_id = outcome.checkpoint_id().unwrap();
    let paused = store.get(paused_id).await.unwrap().unwrap();
    assert_eq!(paused.status, CheckpointStatus::Paused);
    assert_eq!(paused.items_processed, 25);
    assert_eq!(paused.error_count, 0);

    // A later invocation, as after a restart, picks up where it stopped
    let executor = BatchExecutor::new(25, 3);
    let second = common::coordinator(single_stage("search", None), store.clone(), RecordingSleeper::new())
        .with_executor("search", executor.clone());

    let outcome = second
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-2"))
        .await
        .unwrap();

    assert_eq!(outcome.status, StageStatus::Completed);
    assert_eq!(outcome.checkpoint_id(), Some(paused_id));

    let runs = executor.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].items_processed, 25);
    assert_eq!(runs[0].last_processed_id.as_deref(), Some("rec-25"));
    assert_eq!(runs[0].checkpoint_data, Some(serde_json::json!({ "cursor": 25 })));
    assert!(runs[0].is_resuming());

    let completed = store.get(paused_id).await.unwrap().unwrap();
    assert_eq!(completed.items_processed, 100);
    assert_eq!(completed.execution_id, "exec-1");
    assert_eq!(store.list_for_unit("U1").await.unwrap().len(), 1);
}

/// Cancels while the coordinator waits out a backoff
struct CancelDuringBackoff {
    handle: CancelHandle,
}

#[async_trait]
impl Sleeper for CancelDuringBackoff {
    async fn sleep(&self, _duration: Duration) {
        self.handle.cancel();
        std::future::pending::<()>().await;
    }
}

#[tokio::test]
async fn test_cancellation_during_backoff_pauses() {
    let (_temp, store) = common::temp_store();
    let (handle, signal) = CancelHandle::new();
    let executor = FlakyExecutor::transient(u32::MAX);

    let coord = PipelineCoordinator::new(single_stage("search", None), store.clone())
        .with_sleeper(Arc::new(CancelDuringBackoff { handle }))
        .with_executor("search", executor.clone());

    let outcome = coord
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-1").with_cancel(signal))
        .await
        .unwrap();

    assert_eq!(outcome.status, StageStatus::Paused);
    assert_eq!(executor.calls(), 1);
    assert_eq!(outcome.summary.unwrap().error_count, 1);
}

#[tokio::test]
async fn test_resume_after_cancelled_backoff_gets_fresh_budget() {
    let (_temp, store) = common::temp_store();
    let (handle, signal) = CancelHandle::new();
    let executor = FlakyExecutor::transient(u32::MAX);

    let first = PipelineCoordinator::new(single_stage("search", None), store.clone())
        .with_sleeper(Arc::new(CancelDuringBackoff { handle }))
        .with_executor("search", executor.clone());
    let outcome = first
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-1").with_cancel(signal))
        .await
        .unwrap();
    assert_eq!(outcome.status, StageStatus::Paused);

    let second = common::coordinator(single_stage("search", None), store.clone(), RecordingSleeper::new())
        .with_retry_policy(RetryPolicy::default().with_max_retries(2).with_delays(10, 100))
        .with_executor("search", executor.clone());
    let err = second
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-2"))
        .await
        .unwrap_err();

    match err {
        PipelineError::TransientExecution { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected transient failure, got {:?}", other),
    }
    assert_eq!(executor.calls(), 4);

    let state = store.load_latest("U1", "search").await.unwrap().unwrap();
    assert_eq!(state.status, CheckpointStatus::Failed);
    assert_eq!(state.error_count, 4);
    let attempts: Vec<u32> = state.last_error_details.iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, vec![0, 0, 1, 2]);
}

#[tokio::test]
async fn test_predecessor_must_complete_first() {
    let (_temp, store) = common::temp_store();
    let coord = common::coordinator(common::review_pipeline(), store.clone(), RecordingSleeper::new())
        .with_executor("search", BatchExecutor::new(10, 1))
        .with_executor("screening", BatchExecutor::new(10, 1));

    let err = coord
        .invoke_stage("U1", Some("screening"), ExecutionContext::new("exec-1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::PredecessorIncomplete { ref predecessor, .. } if predecessor == "search"
    ));
    assert!(store.load_latest("U1", "screening").await.unwrap().is_none());

    coord
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-1"))
        .await
        .unwrap();
    let outcome = coord
        .invoke_stage("U1", Some("screening"), ExecutionContext::new("exec-2"))
        .await
        .unwrap();
    assert!(matches!(outcome.status, StageStatus::AwaitingGate { .. }));
}

#[tokio::test]
async fn test_next_stage_follows_registration_order() {
    let (_temp, store) = common::temp_store();
    let coord = common::coordinator(common::review_pipeline(), store, RecordingSleeper::new())
        .with_executor("search", BatchExecutor::new(10, 1))
        .with_executor("screening", BatchExecutor::new(10, 1))
        .with_executor("extraction", BatchExecutor::new(10, 1));

    assert_eq!(coord.next_stage("U1").await.unwrap().unwrap().name, "search");

    coord.invoke_stage("U1", None, ExecutionContext::new("e1")).await.unwrap();
    assert_eq!(coord.next_stage("U1").await.unwrap().unwrap().name, "screening");

    // The gated stage holds the pipeline until it is approved
    let outcome = coord.invoke_stage("U1", None, ExecutionContext::new("e2")).await.unwrap();
    assert!(matches!(outcome.status, StageStatus::AwaitingGate { .. }));
    let outcome = coord.invoke_stage("U1", None, ExecutionContext::new("e3")).await.unwrap();
    assert_eq!(outcome.stage_name.as_deref(), Some("screening"));
    assert!(matches!(outcome.status, StageStatus::AwaitingGate { .. }));

    let states: Vec<(String, StageState)> = coord
        .stage_states("U1")
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.stage_name, r.state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("search".to_string(), StageState::Completed),
            ("screening".to_string(), StageState::AwaitingGate),
            ("extraction".to_string(), StageState::NotStarted),
        ]
    );
}

#[tokio::test]
async fn test_rerun_creates_fresh_checkpoint() {
    let (_temp, store) = common::temp_store();
    let executor = BatchExecutor::new(10, 2);
    let coord = common::coordinator(single_stage("search", None), store.clone(), RecordingSleeper::new())
        .with_executor("search", executor.clone());

    let first = coord
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-1"))
        .await
        .unwrap();
    let first_id = first.checkpoint_id().unwrap();

    // Completed stages are reported as-is on plain invocation
    let again = coord
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-2"))
        .await
        .unwrap();
    assert_eq!(again.checkpoint_id(), Some(first_id));
    assert_eq!(executor.runs().len(), 1);

    let err = coord
        .rerun_stage("U1", "search", ExecutionContext::new("exec-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::DuplicateExecution { .. }));

    let rerun = coord
        .rerun_stage("U1", "search", ExecutionContext::new("exec-3"))
        .await
        .unwrap();
    assert_eq!(rerun.status, StageStatus::Completed);
    assert_ne!(rerun.checkpoint_id(), Some(first_id));

    let runs = executor.runs();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].items_processed, 0);
    assert!(!runs[1].is_resuming());

    let original = store.get(first_id).await.unwrap().unwrap();
    assert_eq!(original.status, CheckpointStatus::Completed);
    assert_eq!(original.items_processed, 20);

    let reruns = store
        .audit_trail("U1", Some("search"))
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::RerunCreated)
        .count();
    assert_eq!(reruns, 1);
}

#[tokio::test]
async fn test_rerun_after_failure() {
    let (_temp, store) = common::temp_store();
    let executor = FlakyExecutor::permanent(1);
    let coord = common::coordinator(single_stage("search", None), store.clone(), RecordingSleeper::new())
        .with_executor("search", executor.clone());

    coord
        .invoke_stage("U1", Some("search"), ExecutionContext::new("exec-1"))
        .await
        .unwrap_err();

    let outcome = coord
        .rerun_stage("U1", "search", ExecutionContext::new("exec-2"))
        .await
        .unwrap();

    assert_eq!(outcome.status, StageStatus::Completed);
    assert_eq!(outcome.summary.unwrap().error_count, 0);
    assert_eq!(executor.calls(), 2);
    assert_eq!(store.list_for_unit("U1").await.unwrap().len(), 2);
}
