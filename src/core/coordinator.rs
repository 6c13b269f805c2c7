//! Pipeline coordinator.
//!
//! Each invocation resolves a stage for a unit of work, creates or resumes
//! its checkpoint, runs the stage executor with retry and backoff, and
//! either completes the stage, parks it behind a gate, or pauses it on
//! cancellation. All state lives in the checkpoint store; nothing is kept
//! between invocations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AuditContext, AuditLogEntry, CheckpointStatus, CheckpointSummary, Decision, ErrorRecord,
    GateDecision, NewCheckpoint, StageState, WorkflowState,
};

use super::error::{PipelineError, Result};
use super::executor::{
    CancelSignal, ExecutionError, ProgressReporter, StageContext, StageExecutor, StageOutput,
};
use super::gate::GateController;
use super::pipeline::{Pipeline, StageDef};
use super::retry::{ErrorClass, ErrorPredicate, RetryPolicy, Sleeper, TokioSleeper};
use super::store::CheckpointStore;

/// Caller-supplied parameters of one invocation
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// External correlation id; recorded on newly created checkpoints
    pub execution_id: String,

    /// Known item count, `None` for streaming sources
    pub items_total: Option<u64>,

    pub cancel: CancelSignal,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            items_total: None,
            cancel: CancelSignal::never(),
        }
    }

    /// Execution id generated from a fresh uuid
    pub fn generated() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn with_items_total(mut self, items_total: Option<u64>) -> Self {
        self.items_total = items_total;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Status reported back to the trigger
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    InProgress,

    /// Execution finished; review pending (not an error)
    AwaitingGate { pending_since: DateTime<Utc> },

    /// Cancelled or sent back for revision; resumable
    Paused,

    Completed,

    /// Terminal failure from an earlier invocation
    Failed {
        error_count: u32,
        last_error: Option<ErrorRecord>,
    },

    /// Every registered stage is completed
    PipelineComplete,
}

impl StageStatus {
    pub fn from_state(state: &WorkflowState) -> Self {
        match state.stage_state() {
            StageState::NotStarted => Self::NotStarted,
            StageState::InProgress => Self::InProgress,
            StageState::AwaitingGate => Self::AwaitingGate {
                pending_since: state.awaiting_gate_since.unwrap_or(state.updated_at),
            },
            StageState::Paused => Self::Paused,
            StageState::Completed => Self::Completed,
            StageState::Failed => Self::Failed {
                error_count: state.error_count,
                last_error: state.last_error().cloned(),
            },
        }
    }
}

/// `{status, checkpointSummary}` returned by every trigger call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationOutcome {
    pub stage_name: Option<String>,
    pub status: StageStatus,
    pub summary: Option<CheckpointSummary>,
}

impl InvocationOutcome {
    pub fn for_state(state: &WorkflowState) -> Self {
        Self {
            stage_name: Some(state.stage_name.clone()),
            status: StageStatus::from_state(state),
            summary: Some(state.summary()),
        }
    }

    fn not_started(stage_name: &str) -> Self {
        Self {
            stage_name: Some(stage_name.to_string()),
            status: StageStatus::NotStarted,
            summary: None,
        }
    }

    fn pipeline_complete() -> Self {
        Self {
            stage_name: None,
            status: StageStatus::PipelineComplete,
            summary: None,
        }
    }

    pub fn checkpoint_id(&self) -> Option<Uuid> {
        self.summary.as_ref().map(|s| s.checkpoint_id)
    }
}

/// Derived state of one registered stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage_name: String,
    pub gated: bool,
    pub state: StageState,
    pub summary: Option<CheckpointSummary>,
}

/// The orchestrating state machine
pub struct PipelineCoordinator {
    pipeline: Pipeline,
    store: Arc<dyn CheckpointStore>,
    gate: GateController,
    default_policy: RetryPolicy,
    predicates: Vec<ErrorPredicate>,
    executors: HashMap<String, Arc<dyn StageExecutor>>,
    sleeper: Arc<dyn Sleeper>,
}

impl PipelineCoordinator {
    /// Create a coordinator; gated stages come from the pipeline definition
    pub fn new(pipeline: Pipeline, store: Arc<dyn CheckpointStore>) -> Self {
        let gate = GateController::for_pipeline(store.clone(), &pipeline);
        Self {
            pipeline,
            store,
            gate,
            default_policy: RetryPolicy::default(),
            predicates: Vec::new(),
            executors: HashMap::new(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Policy for stages without their own `retry_policy`
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_executor(
        mut self,
        stage_name: impl Into<String>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        self.executors.insert(stage_name.into(), executor);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Extra transient predicate applied on top of every stage's policy
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ExecutionError) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn with_notify_after_hours(mut self, notify_after_hours: u64) -> Self {
        self.gate = self.gate.with_notify_after_hours(notify_after_hours);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn gate(&self) -> &GateController {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Effective retry policy for a stage
    pub fn retry_policy_for(&self, stage_name: &str) -> RetryPolicy {
        self.pipeline
            .get_stage(stage_name)
            .and_then(|s| s.retry_policy.clone())
            .unwrap_or_else(|| self.default_policy.clone())
    }

    /// First stage, in registration order, whose latest checkpoint is not completed
    pub async fn next_stage(&self, unit_of_work_id: &str) -> Result<Option<&StageDef>> {
        for stage in &self.pipeline.stages {
            let latest = self.store.load_latest(unit_of_work_id, &stage.name).await?;
            if latest.map(|s| s.status) != Some(CheckpointStatus::Completed) {
                return Ok(Some(stage));
            }
        }
        Ok(None)
    }

    /// Run (or resume) a stage for a unit of work.
    ///
    /// With `stage_name` omitted the next incomplete stage is used. A stage
    /// awaiting review or already terminal is reported, not re-executed.
    /// Failures of this invocation are returned as errors after they are
    /// recorded on the checkpoint.
    #[instrument(skip(self, ctx), fields(execution_id = %ctx.execution_id))]
    pub async fn invoke_stage(
        &self,
        unit_of_work_id: &str,
        stage_name: Option<&str>,
        ctx: ExecutionContext,
    ) -> Result<InvocationOutcome> {
        let stage = match stage_name {
            Some(name) => {
                let stage = self.registered(name)?;
                self.ensure_predecessor(unit_of_work_id, name).await?;
                stage
            }
            None => match self.next_stage(unit_of_work_id).await? {
                Some(stage) => stage,
                None => {
                    info!(unit = %unit_of_work_id, "All stages completed");
                    return Ok(InvocationOutcome::pipeline_complete());
                }
            },
        };
        let executor = self.executor_for(&stage.name)?;

        // Active rows are always the newest, so a terminal latest row means
        // there is nothing to resume
        if let Some(latest) = self.store.load_latest(unit_of_work_id, &stage.name).await? {
            match latest.status {
                CheckpointStatus::Failed => {
                    warn!(
                        unit = %unit_of_work_id,
                        stage = %stage.name,
                        error_count = latest.error_count,
                        "Stage previously failed; re-run explicitly to retry"
                    );
                    return Ok(InvocationOutcome::for_state(&latest));
                }
                CheckpointStatus::Completed => {
                    debug!(unit = %unit_of_work_id, stage = %stage.name, "Stage already completed");
                    return Ok(InvocationOutcome::for_state(&latest));
                }
                _ => {}
            }
        }

        let request = NewCheckpoint::new(unit_of_work_id, &stage.name, &ctx.execution_id)
            .with_items_total(ctx.items_total)
            .gated(self.gate.requires_gate(&stage.name));
        let resumed = self
            .store
            .create_or_resume(request, &AuditContext::system("stage invoked"))
            .await?;

        if resumed.created {
            info!(
                unit = %unit_of_work_id,
                stage = %stage.name,
                checkpoint_id = %resumed.state.id,
                "Checkpoint created"
            );
        } else {
            info!(
                unit = %unit_of_work_id,
                stage = %stage.name,
                checkpoint_id = %resumed.state.id,
                items_processed = resumed.state.items_processed,
                "Resuming checkpoint"
            );
        }

        self.drive(stage, executor, resumed.state, &ctx.cancel).await
    }

    /// Deliberately re-run a completed or failed stage on a fresh checkpoint
    #[instrument(skip(self, ctx), fields(execution_id = %ctx.execution_id))]
    pub async fn rerun_stage(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
        ctx: ExecutionContext,
    ) -> Result<InvocationOutcome> {
        let stage = self.registered(stage_name)?;
        self.ensure_predecessor(unit_of_work_id, stage_name).await?;
        let executor = self.executor_for(stage_name)?;

        let request = NewCheckpoint::new(unit_of_work_id, stage_name, &ctx.execution_id)
            .with_items_total(ctx.items_total)
            .gated(self.gate.requires_gate(stage_name));
        let state = self
            .store
            .create_rerun(request, &AuditContext::system("explicit re-run"))
            .await?;

        info!(
            unit = %unit_of_work_id,
            stage = %stage_name,
            checkpoint_id = %state.id,
            "Re-run checkpoint created"
        );

        self.drive(stage, executor, state, &ctx.cancel).await
    }

    /// Record a reviewer's decision; an approval completes the waiting stage
    #[instrument(skip(self, feedback))]
    pub async fn submit_decision(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
        decision: Decision,
        reviewer: &str,
        feedback: Option<String>,
    ) -> Result<InvocationOutcome> {
        self.registered(stage_name)?;
        let ctx = AuditContext::human(reviewer, feedback.clone());
        let (decision, state) = self
            .gate
            .record_decision(unit_of_work_id, stage_name, decision, reviewer, feedback)
            .await?;
        self.apply_decision(&decision, state, &ctx).await
    }

    /// Same as [`submit_decision`](Self::submit_decision) for an automated policy
    #[instrument(skip(self, reasoning))]
    pub async fn submit_policy_decision(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
        decision: Decision,
        policy: &str,
        reasoning: Option<String>,
    ) -> Result<InvocationOutcome> {
        self.registered(stage_name)?;
        let ctx = AuditContext::agent(policy, reasoning.clone());
        let (decision, state) = self
            .gate
            .record_policy_decision(unit_of_work_id, stage_name, decision, policy, reasoning)
            .await?;
        self.apply_decision(&decision, state, &ctx).await
    }

    /// Derived state of every registered stage
    pub async fn stage_states(&self, unit_of_work_id: &str) -> Result<Vec<StageReport>> {
        let mut reports = Vec::with_capacity(self.pipeline.stages.len());

        for stage in &self.pipeline.stages {
            let latest = self.store.load_latest(unit_of_work_id, &stage.name).await?;
            reports.push(StageReport {
                stage_name: stage.name.clone(),
                gated: self.gate.requires_gate(&stage.name),
                state: latest
                    .as_ref()
                    .map(WorkflowState::stage_state)
                    .unwrap_or(StageState::NotStarted),
                summary: latest.as_ref().map(WorkflowState::summary),
            });
        }

        Ok(reports)
    }

    pub async fn audit_trail(
        &self,
        unit_of_work_id: &str,
        stage_name: Option<&str>,
    ) -> Result<Vec<AuditLogEntry>> {
        self.store.audit_trail(unit_of_work_id, stage_name).await
    }

    /// Execute an active checkpoint to a resting state
    #[instrument(
        skip_all,
        fields(unit = %state.unit_of_work_id, stage = %stage.name, checkpoint_id = %state.id)
    )]
    async fn drive(
        &self,
        stage: &StageDef,
        executor: Arc<dyn StageExecutor>,
        state: WorkflowState,
        cancel: &CancelSignal,
    ) -> Result<InvocationOutcome> {
        let mut state = state;

        if state.is_awaiting_gate() {
            return self.settle_gate(state).await;
        }

        if state.status == CheckpointStatus::Paused {
            state = self
                .store
                .reactivate(state.id, &AuditContext::system("stage re-invoked"))
                .await?;
            info!(items_processed = state.items_processed, "Paused stage resumed");
        }

        let policy = self.retry_policy_for(&stage.name);
        let classifier = policy.classifier().extend(self.predicates.iter().cloned());
        let reporter = ProgressReporter::new(self.store.clone(), &state);
        // Budget is per invocation; error_count on the row is cumulative
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return self.pause_cancelled(&state).await;
            }

            let stage_ctx = StageContext::from_state(&state, attempt);
            debug!(
                attempt,
                executor = executor.name(),
                resuming = stage_ctx.is_resuming(),
                "Running stage executor"
            );
            let result = executor.run(stage_ctx, &reporter, cancel).await;

            // Pick up progress reported during the run
            state = self.reload(state.id).await?;

            let err = match result {
                Ok(output) => return self.finish(stage, state, output).await,
                Err(e) if e.cancelled => return self.pause_cancelled(&state).await,
                Err(e) => e,
            };

            let class = classifier.classify(&err);
            let retry = policy.should_retry(class, attempt);
            let record = ErrorRecord {
                message: err.message.clone(),
                classification: class.as_str().to_string(),
                attempt,
                occurred_at: Utc::now(),
            };
            let reasoning = if retry {
                format!("{} failure on attempt {}; retrying", class, attempt + 1)
            } else {
                format!("{} failure on attempt {}; giving up", class, attempt + 1)
            };
            state = self
                .store
                .record_failure(state.id, record, !retry, &AuditContext::system(reasoning))
                .await?;

            if !retry {
                error!(
                    attempt,
                    class = %class,
                    error_count = state.error_count,
                    error = %err,
                    "Stage failed"
                );
                return Err(self.execution_error(&state, class, attempt + 1, err));
            }

            let delay = policy.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying after backoff"
            );

            tokio::select! {
                _ = self.sleeper.sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return self.pause_cancelled(&state).await;
                }
            }

            attempt += 1;
        }
    }

    async fn finish(
        &self,
        stage: &StageDef,
        state: WorkflowState,
        output: StageOutput,
    ) -> Result<InvocationOutcome> {
        if state.requires_gate || self.gate.requires_gate(&stage.name) {
            let state = self
                .store
                .mark_awaiting_gate(
                    state.id,
                    output.output,
                    &AuditContext::system("execution finished; awaiting gate decision"),
                )
                .await?;
            info!(items_processed = state.items_processed, "Stage awaiting gate decision");
            return Ok(InvocationOutcome::for_state(&state));
        }

        let state = self
            .store
            .complete(state.id, output.output, &AuditContext::system("stage completed"))
            .await?;
        info!(items_processed = state.items_processed, "Stage completed");
        Ok(InvocationOutcome::for_state(&state))
    }

    /// A re-invoked stage that waits on review: apply an approval recorded
    /// since, otherwise report the pending status
    async fn settle_gate(&self, state: WorkflowState) -> Result<InvocationOutcome> {
        let approved = match state.awaiting_gate_since {
            Some(since) => self
                .store
                .decision_since(&state.unit_of_work_id, &state.stage_name, since)
                .await?
                .map(|d| d.is_approved())
                .unwrap_or(false),
            None => false,
        };

        if approved {
            let state = self
                .store
                .complete(
                    state.id,
                    None,
                    &AuditContext::system("approved gate decision applied"),
                )
                .await?;
            info!("Stage completed after approval");
            return Ok(InvocationOutcome::for_state(&state));
        }

        info!("Stage is pending review");
        Ok(InvocationOutcome::for_state(&state))
    }

    async fn apply_decision(
        &self,
        decision: &GateDecision,
        state: Option<WorkflowState>,
        ctx: &AuditContext,
    ) -> Result<InvocationOutcome> {
        match state {
            Some(state) if decision.is_approved() && state.is_awaiting_gate() => {
                let state = self.store.complete(state.id, None, ctx).await?;
                info!(
                    unit = %state.unit_of_work_id,
                    stage = %state.stage_name,
                    "Stage completed after approval"
                );
                Ok(InvocationOutcome::for_state(&state))
            }
            Some(state) => Ok(InvocationOutcome::for_state(&state)),
            None => {
                let latest = self
                    .store
                    .load_latest(&decision.unit_of_work_id, &decision.stage_name)
                    .await?;
                Ok(match latest {
                    Some(latest) => InvocationOutcome::for_state(&latest),
                    None => InvocationOutcome::not_started(&decision.stage_name),
                })
            }
        }
    }

    async fn pause_cancelled(&self, state: &WorkflowState) -> Result<InvocationOutcome> {
        let state = self
            .store
            .pause(state.id, &AuditContext::system("cancellation requested"))
            .await?;
        info!(
            items_processed = state.items_processed,
            "Stage paused after cancellation"
        );
        Ok(InvocationOutcome::for_state(&state))
    }

    fn execution_error(
        &self,
        state: &WorkflowState,
        class: ErrorClass,
        attempts: u32,
        err: ExecutionError,
    ) -> PipelineError {
        match class {
            ErrorClass::Transient => PipelineError::TransientExecution {
                unit: state.unit_of_work_id.clone(),
                stage: state.stage_name.clone(),
                checkpoint_id: state.id,
                attempts,
                message: err.message,
            },
            ErrorClass::Permanent => PipelineError::PermanentExecution {
                unit: state.unit_of_work_id.clone(),
                stage: state.stage_name.clone(),
                checkpoint_id: state.id,
                message: err.message,
            },
        }
    }

    async fn ensure_predecessor(&self, unit_of_work_id: &str, stage_name: &str) -> Result<()> {
        if let Some(predecessor) = self.pipeline.predecessor(stage_name) {
            let done = self
                .store
                .load_latest(unit_of_work_id, predecessor)
                .await?
                .map(|s| s.status == CheckpointStatus::Completed)
                .unwrap_or(false);

            if !done {
                return Err(PipelineError::PredecessorIncomplete {
                    unit: unit_of_work_id.to_string(),
                    stage: stage_name.to_string(),
                    predecessor: predecessor.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn reload(&self, checkpoint_id: Uuid) -> Result<WorkflowState> {
        self.store
            .get(checkpoint_id)
            .await?
            .ok_or(PipelineError::CheckpointNotFound(checkpoint_id))
    }

    fn registered(&self, stage_name: &str) -> Result<&StageDef> {
        self.pipeline
            .get_stage(stage_name)
            .ok_or_else(|| PipelineError::UnknownStage(stage_name.to_string()))
    }

    fn executor_for(&self, stage_name: &str) -> Result<Arc<dyn StageExecutor>> {
        self.executors
            .get(stage_name)
            .cloned()
            .ok_or_else(|| PipelineError::MissingExecutor(stage_name.to_string()))
    }
}
