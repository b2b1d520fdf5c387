use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::flow::StepId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegationId(pub String);

/// What the delegate may stand in for: every step addressed to a role,
/// or one specific step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DelegationScope {
    Role(String),
    Step(StepId),
}

/// Temporary stand-in authorization for an absent approver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,
    pub delegator_id: String,
    pub delegate_id: String,
    pub scope: DelegationScope,
    pub starts_at: DateTime<Utc>,
    /// `None` means open-ended.
    pub ends_at: Option<DateTime<Utc>>,
}

impl Delegation {
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && self.ends_at.map_or(true, |end| end > at)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{Delegation, DelegationId, DelegationScope};

    #[test]
    fn active_window_is_start_inclusive_end_exclusive() {
        let now = Utc::now();
        let delegation = Delegation {
            id: DelegationId("d-1".to_string()),
            delegator_id: "u-manager".to_string(),
            delegate_id: "u-stand-in".to_string(),
            scope: DelegationScope::Role("finance_manager".to_string()),
            starts_at: now,
            ends_at: Some(now + Duration::days(7)),
        };

        assert!(delegation.is_active_at(now));
        assert!(delegation.is_active_at(now + Duration::days(6)));
        assert!(!delegation.is_active_at(now + Duration::days(7)));
        assert!(!delegation.is_active_at(now - Duration::seconds(1)));
    }

    #[test]
    fn open_ended_delegation_never_expires() {
        let now = Utc::now();
        let delegation = Delegation {
            id: DelegationId("d-2".to_string()),
            delegator_id: "u-manager".to_string(),
            delegate_id: "u-stand-in".to_string(),
            scope: DelegationScope::Role("finance_manager".to_string()),
            starts_at: now - chrono::Duration::days(1),
            ends_at: None,
        };

        assert!(delegation.is_active_at(now + chrono::Duration::days(365)));
    }
}
