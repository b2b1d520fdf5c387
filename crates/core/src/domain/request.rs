use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::flow::{FlowId, StepId};
use crate::conditions::coerce_numeric;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    OnHold,
    Escalated,
    Approved,
    Rejected,
    Cancelled,
    Expired,
}

impl RequestStatus {
    /// Statuses under which the request still occupies its entity's
    /// one-live-request slot.
    pub const LIVE: [RequestStatus; 4] =
        [Self::Pending, Self::InProgress, Self::OnHold, Self::Escalated];

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }

    /// Statuses that accept decisions.
    pub fn accepts_decisions(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress | Self::Escalated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::OnHold => "on_hold",
            Self::Escalated => "escalated",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "on_hold" => Some(Self::OnHold),
            "escalated" => Some(Self::Escalated),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frozen fact set captured at submission. Conditions and thresholds
/// are always evaluated against this snapshot, never re-derived.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Context(pub serde_json::Map<String, Value>);

impl Context {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn numeric(&self, field: &str) -> Option<Decimal> {
        self.0.get(field).and_then(coerce_numeric)
    }

    pub fn string(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }
}

impl From<serde_json::Map<String, Value>> for Context {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map)
    }
}

/// One entity's passage through a flow. Aggregate root; mutated only
/// through engine operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub entity_type: String,
    pub entity_id: String,
    pub flow_id: FlowId,
    pub status: RequestStatus,
    pub current_step_id: Option<StepId>,
    pub context: Context,
    pub requested_by: String,
    pub resolution_note: Option<String>,
    /// Set when escalation had a user target but no step target; that
    /// user is authorized to decide while the request is escalated.
    pub escalated_to_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{Context, RequestStatus};

    #[test]
    fn live_statuses_match_the_decidable_set_plus_on_hold() {
        assert!(RequestStatus::Pending.is_live());
        assert!(RequestStatus::OnHold.is_live());
        assert!(!RequestStatus::OnHold.accepts_decisions());
        assert!(RequestStatus::Escalated.accepts_decisions());
        assert!(!RequestStatus::Approved.is_live());
        assert!(!RequestStatus::Expired.is_live());
    }

    #[test]
    fn context_numeric_tolerates_numeric_strings() {
        let mut map = serde_json::Map::new();
        map.insert("amount".to_string(), json!("1250.50"));
        map.insert("vendor".to_string(), json!("Initech"));
        let context = Context(map);

        assert_eq!(context.numeric("amount"), Some(Decimal::new(125_050, 2)));
        assert_eq!(context.numeric("vendor"), None);
        assert_eq!(context.numeric("missing"), None);
        assert_eq!(context.string("vendor"), Some("Initech"));
    }
}
