//! Audit log entries for the append-only compliance trail.
//!
//! Every state transition, retry, and gate decision is recorded as an
//! immutable entry in the same transaction as the change it describes.
//! Entries are never updated or deleted and never drive control flow.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActorType {
    System,
    Human,
    AutomatedAgent,
}

impl ActorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Human => "human",
            Self::AutomatedAgent => "automated-agent",
        }
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "human" => Ok(Self::Human),
            "automated-agent" => Ok(Self::AutomatedAgent),
            other => Err(format!("unknown actor type '{}'", other)),
        }
    }
}

/// Kinds of audited transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A new checkpoint row was inserted
    CheckpointCreated,

    /// An explicit re-run inserted a fresh row after a terminal one
    RerunCreated,

    /// A re-run was refused (active row, nothing to re-run, or a reused execution id)
    RerunRejected,

    /// A batch of progress was applied
    ProgressRecorded,

    /// A progress update was refused (monotonicity or bounds)
    ProgressRejected,

    /// A transient failure will be retried
    RetryScheduled,

    /// The stage failed terminally
    StageFailed,

    /// Execution finished and the stage waits for a gate decision
    AwaitingGate,

    /// A reviewer or policy recorded a decision
    GateDecisionRecorded,

    /// The stage was parked (rejection or cancellation)
    StagePaused,

    /// A paused stage was picked up again
    StageResumed,

    /// The stage completed
    StageCompleted,

    /// Completion was refused because the gate is not approved
    CompletionRejected,

    /// A transition was refused in the checkpoint's current status
    TransitionRejected,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckpointCreated => "checkpoint_created",
            Self::RerunCreated => "rerun_created",
            Self::RerunRejected => "rerun_rejected",
            Self::ProgressRecorded => "progress_recorded",
            Self::ProgressRejected => "progress_rejected",
            Self::RetryScheduled => "retry_scheduled",
            Self::StageFailed => "stage_failed",
            Self::AwaitingGate => "awaiting_gate",
            Self::GateDecisionRecorded => "gate_decision_recorded",
            Self::StagePaused => "stage_paused",
            Self::StageResumed => "stage_resumed",
            Self::StageCompleted => "stage_completed",
            Self::CompletionRejected => "completion_rejected",
            Self::TransitionRejected => "transition_rejected",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "checkpoint_created" => Self::CheckpointCreated,
            "rerun_created" => Self::RerunCreated,
            "rerun_rejected" => Self::RerunRejected,
            "progress_recorded" => Self::ProgressRecorded,
            "progress_rejected" => Self::ProgressRejected,
            "retry_scheduled" => Self::RetryScheduled,
            "stage_failed" => Self::StageFailed,
            "awaiting_gate" => Self::AwaitingGate,
            "gate_decision_recorded" => Self::GateDecisionRecorded,
            "stage_paused" => Self::StagePaused,
            "stage_resumed" => Self::StageResumed,
            "stage_completed" => Self::StageCompleted,
            "completion_rejected" => Self::CompletionRejected,
            "transition_rejected" => Self::TransitionRejected,
            other => return Err(format!("unknown audit action '{}'", other)),
        };
        Ok(action)
    }
}

/// Attribution carried by every mutating store call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditContext {
    pub actor_type: ActorType,
    pub actor: String,
    pub reasoning: Option<String>,
}

impl AuditContext {
    /// Transitions made by the coordinator itself
    pub fn system(reasoning: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::System,
            actor: "coordinator".to_string(),
            reasoning: Some(reasoning.into()),
        }
    }

    pub fn human(reviewer: impl Into<String>, reasoning: Option<String>) -> Self {
        Self {
            actor_type: ActorType::Human,
            actor: reviewer.into(),
            reasoning,
        }
    }

    pub fn agent(name: impl Into<String>, reasoning: Option<String>) -> Self {
        Self {
            actor_type: ActorType::AutomatedAgent,
            actor: name.into(),
            reasoning,
        }
    }
}

/// An immutable audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Assigned by the store on append
    pub id: Option<i64>,

    pub unit_of_work_id: String,
    pub stage_name: String,
    pub checkpoint_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub actor: String,
    pub action: AuditAction,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub reasoning: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    /// Create an entry with the current timestamp
    pub fn new(
        unit_of_work_id: impl Into<String>,
        stage_name: impl Into<String>,
        action: AuditAction,
        ctx: &AuditContext,
    ) -> Self {
        Self {
            id: None,
            unit_of_work_id: unit_of_work_id.into(),
            stage_name: stage_name.into(),
            checkpoint_id: None,
            actor_type: ctx.actor_type,
            actor: ctx.actor.clone(),
            action,
            before_state: None,
            after_state: None,
            reasoning: ctx.reasoning.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_checkpoint(mut self, checkpoint_id: Uuid) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    pub fn with_states(
        mut self,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        self.before_state = before;
        self.after_state = after;
        self
    }
}
