//! Approval gates between a finished stage execution and its completion.
//!
//! The controller knows which stages are gated (static per registration),
//! records reviewer and policy decisions, and answers which gates are
//! waiting. It never escalates; callers poll `overdue_gates` and notify.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{AuditContext, Decision, GateDecision, WorkflowState};

use super::error::{PipelineError, Result};
use super::pipeline::Pipeline;
use super::store::CheckpointStore;

/// Default hours a gate may wait before it is reported as overdue
pub const DEFAULT_NOTIFY_AFTER_HOURS: u64 = 48;

/// A finished execution waiting for review
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingGate {
    pub unit_of_work_id: String,
    pub stage_name: String,
    pub checkpoint_id: Uuid,
    pub pending_since: DateTime<Utc>,
}

impl PendingGate {
    fn from_state(state: &WorkflowState) -> Option<Self> {
        let since = state.awaiting_gate_since?;
        Some(Self {
            unit_of_work_id: state.unit_of_work_id.clone(),
            stage_name: state.stage_name.clone(),
            checkpoint_id: state.id,
            pending_since: since,
        })
    }

    /// How long the gate has been waiting at `now`
    pub fn waiting_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.pending_since
    }
}

/// Gate bookkeeping over the checkpoint store
pub struct GateController {
    store: Arc<dyn CheckpointStore>,
    gated_stages: HashSet<String>,
    notify_after: Duration,
}

impl GateController {
    pub fn new<I, S>(store: Arc<dyn CheckpointStore>, gated_stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store,
            gated_stages: gated_stages.into_iter().map(Into::into).collect(),
            notify_after: hours(DEFAULT_NOTIFY_AFTER_HOURS),
        }
    }

    /// Gate the stages the pipeline marks as `gated`
    pub fn for_pipeline(store: Arc<dyn CheckpointStore>, pipeline: &Pipeline) -> Self {
        Self::new(
            store,
            pipeline
                .stages
                .iter()
                .filter(|s| s.gated)
                .map(|s| s.name.clone()),
        )
    }

    pub fn with_notify_after_hours(mut self, notify_after_hours: u64) -> Self {
        self.notify_after = hours(notify_after_hours);
        self
    }

    pub fn notify_after(&self) -> Duration {
        self.notify_after
    }

    pub fn requires_gate(&self, stage_name: &str) -> bool {
        self.gated_stages.contains(stage_name)
    }

    /// Record a reviewer's decision.
    ///
    /// A rejection pauses the awaiting checkpoint in the same transaction.
    /// The returned state is the stage's active checkpoint, if any.
    pub async fn record_decision(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
        decision: Decision,
        reviewer: &str,
        feedback: Option<String>,
    ) -> Result<(GateDecision, Option<WorkflowState>)> {
        let ctx = AuditContext::human(reviewer, feedback.clone());
        let decision = GateDecision::new(unit_of_work_id, stage_name, decision, reviewer)
            .with_feedback(feedback);
        self.record(decision, ctx).await
    }

    /// Record a decision made by an automated policy
    pub async fn record_policy_decision(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
        decision: Decision,
        policy: &str,
        reasoning: Option<String>,
    ) -> Result<(GateDecision, Option<WorkflowState>)> {
        let ctx = AuditContext::agent(policy, reasoning.clone());
        let decision = GateDecision::new(unit_of_work_id, stage_name, decision, policy)
            .with_feedback(reasoning);
        self.record(decision, ctx).await
    }

    async fn record(
        &self,
        decision: GateDecision,
        ctx: AuditContext,
    ) -> Result<(GateDecision, Option<WorkflowState>)> {
        if !self.requires_gate(&decision.stage_name) {
            return Err(PipelineError::UngatedStage(decision.stage_name));
        }

        let (decision, state) = self.store.record_decision(decision, &ctx).await?;

        match state {
            Some(ref s) if s.is_awaiting_gate() || decision.decision == Decision::Rejected => {
                info!(
                    unit = %decision.unit_of_work_id,
                    stage = %decision.stage_name,
                    decision = %decision.decision,
                    reviewer = %decision.reviewer,
                    state = %s.stage_state(),
                    "Gate decision recorded"
                );
            }
            _ => {
                warn!(
                    unit = %decision.unit_of_work_id,
                    stage = %decision.stage_name,
                    decision = %decision.decision,
                    "Gate decision recorded with no execution awaiting review"
                );
            }
        }

        Ok((decision, state))
    }

    /// The decision that applies to the stage's current review.
    ///
    /// While an execution awaits review, only decisions made since it
    /// finished count; `None` means the gate is implicitly pending.
    pub async fn current_decision(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
    ) -> Result<Option<GateDecision>> {
        let active = self.store.load_active(unit_of_work_id, stage_name).await?;

        match active.and_then(|s| s.awaiting_gate_since) {
            Some(since) => {
                self.store
                    .decision_since(unit_of_work_id, stage_name, since)
                    .await
            }
            None => self.store.latest_decision(unit_of_work_id, stage_name).await,
        }
    }

    /// When the stage's finished execution started waiting, if it is
    pub async fn pending_since(
        &self,
        unit_of_work_id: &str,
        stage_name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let active = self.store.load_active(unit_of_work_id, stage_name).await?;
        Ok(active
            .filter(|s| s.is_awaiting_gate())
            .and_then(|s| s.awaiting_gate_since))
    }

    /// Every execution waiting for review, oldest first
    pub async fn pending_gates(&self) -> Result<Vec<PendingGate>> {
        let states = self.store.list_awaiting_gate().await?;
        Ok(states.iter().filter_map(PendingGate::from_state).collect())
    }

    /// Pending gates that have waited at least the notification threshold
    pub async fn overdue_gates(&self, now: DateTime<Utc>) -> Result<Vec<PendingGate>> {
        let pending = self.pending_gates().await?;
        Ok(pending
            .into_iter()
            .filter(|g| g.waiting_for(now) >= self.notify_after)
            .collect())
    }
}

// A century; keeps chrono's Duration in range
const MAX_NOTIFY_AFTER_HOURS: u64 = 24 * 365 * 100;

fn hours(h: u64) -> Duration {
    Duration::hours(h.min(MAX_NOTIFY_AFTER_HOURS) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sqlite_store::SqliteStore;
    use crate::domain::{CheckpointStatus, NewCheckpoint};

    fn controller() -> (Arc<dyn CheckpointStore>, GateController) {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let gates = GateController::new(store.clone(), ["screening"]).with_notify_after_hours(24);
        (store, gates)
    }

    async fn awaiting(store: &Arc<dyn CheckpointStore>, unit: &str) -> WorkflowState {
        let ctx = AuditContext::system("test");
        let state = store
            .create_or_resume(
                NewCheckpoint::new(unit, "screening", "exec-1").gated(true),
                &ctx,
            )
            .await
            .unwrap()
            .state;
        store
            .mark_awaiting_gate(state.id, Some(serde_json::json!({ "included": 12 })), &ctx)
            .await
            .unwrap()
    }

    #[test]
    fn test_requires_gate_is_static() {
        let (_, gates) = controller();
        assert!(gates.requires_gate("screening"));
        assert!(!gates.requires_gate("search"));
    }

    #[tokio::test]
    async fn test_pending_is_implicit() {
        let (store, gates) = controller();
        let state = awaiting(&store, "U1").await;

        assert!(gates.current_decision("U1", "screening").await.unwrap().is_none());
        assert_eq!(
            gates.pending_since("U1", "screening").await.unwrap(),
            state.awaiting_gate_since
        );
    }

    #[tokio::test]
    async fn test_rejection_pauses_and_keeps_output() {
        let (store, gates) = controller();
        awaiting(&store, "U1").await;

        let (decision, state) = gates
            .record_decision("U1", "screening", Decision::Rejected, "alice", Some("redo".into()))
            .await
            .unwrap();
        let state = state.unwrap();

        assert_eq!(decision.decision, Decision::Rejected);
        assert_eq!(state.status, CheckpointStatus::Paused);
        assert_eq!(state.output, Some(serde_json::json!({ "included": 12 })));
        assert!(gates.pending_since("U1", "screening").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decision_on_ungated_stage_is_refused() {
        let (_, gates) = controller();
        let err = gates
            .record_decision("U1", "search", Decision::Approved, "alice", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UngatedStage(_)));
    }

    #[tokio::test]
    async fn test_overdue_uses_threshold() {
        let (store, gates) = controller();
        let state = awaiting(&store, "U1").await;
        let since = state.awaiting_gate_since.unwrap();

        assert_eq!(gates.pending_gates().await.unwrap().len(), 1);
        assert!(gates
            .overdue_gates(since + Duration::hours(23))
            .await
            .unwrap()
            .is_empty());

        let overdue = gates.overdue_gates(since + Duration::hours(25)).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].checkpoint_id, state.id);
    }
}
