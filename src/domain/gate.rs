//! Gate decisions recorded by reviewers or automated policy.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verdict on a stage's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    Pending,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Pending => "pending",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" | "approve" => Ok(Self::Approved),
            "rejected" | "reject" => Ok(Self::Rejected),
            "pending" => Ok(Self::Pending),
            other => Err(format!("unknown gate decision '{}'", other)),
        }
    }
}

/// A recorded gate decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub unit_of_work_id: String,
    pub stage_name: String,
    pub decision: Decision,
    pub reviewer: String,
    pub feedback: Option<String>,

    /// Set by the store on write
    pub decided_at: DateTime<Utc>,
}

impl GateDecision {
    /// Create a decision stamped with the current time
    pub fn new(
        unit_of_work_id: impl Into<String>,
        stage_name: impl Into<String>,
        decision: Decision,
        reviewer: impl Into<String>,
    ) -> Self {
        Self {
            unit_of_work_id: unit_of_work_id.into(),
            stage_name: stage_name.into(),
            decision,
            reviewer: reviewer.into(),
            feedback: None,
            decided_at: Utc::now(),
        }
    }

    pub fn with_feedback(mut self, feedback: Option<String>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn is_approved(&self) -> bool {
        self.decision == Decision::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_parsing_accepts_verbs() {
        assert_eq!("approve".parse::<Decision>(), Ok(Decision::Approved));
        assert_eq!("rejected".parse::<Decision>(), Ok(Decision::Rejected));
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn test_decision_serializes_snake_case() {
        let decision = GateDecision::new("U1", "screening", Decision::Rejected, "alice")
            .with_feedback(Some("missing exclusion reasons".to_string()));

        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["decision"], "rejected");
        assert_eq!(json["feedback"], "missing exclusion reasons");
        assert!(!decision.is_approved());
    }
}
