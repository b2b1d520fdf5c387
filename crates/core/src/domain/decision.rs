use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::flow::StepId;
use super::request::RequestId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approved,
    Rejected,
    Returned,
    Abstained,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Returned => "returned",
            Self::Abstained => "abstained",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "returned" => Some(Self::Returned),
            "abstained" => Some(Self::Abstained),
            _ => None,
        }
    }
}

/// One approver's vote on one request at one step. Append-only and
/// immutable; at most one per (request, step, approver).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: DecisionId,
    pub request_id: RequestId,
    pub step_id: StepId,
    pub decided_by: String,
    pub decision: DecisionKind,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}
