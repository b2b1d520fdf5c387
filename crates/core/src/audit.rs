//! Append-only audit trail. Every transition the engine performs is
//! recorded here; the trail, not the hook stream, is authoritative.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::request::RequestId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub request_id: Option<RequestId>,
    pub actor: String,
    pub action: String,
    pub detail: Option<String>,
    pub metadata: BTreeMap<String, Value>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        request_id: Option<RequestId>,
        actor: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            request_id,
            actor: actor.into(),
            action: action.into(),
            detail: None,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::AuditEntry;
    use crate::domain::request::RequestId;

    #[test]
    fn builder_accumulates_detail_and_metadata() {
        let entry = AuditEntry::new(
            Some(RequestId("req-7".to_string())),
            "u-controller",
            "request.escalated",
        )
        .with_detail("timeout sweep")
        .with_metadata("from_step", json!("s-1"))
        .with_metadata("to_step", json!("s-9"));

        assert_eq!(entry.action, "request.escalated");
        assert_eq!(entry.detail.as_deref(), Some("timeout sweep"));
        assert_eq!(entry.metadata.len(), 2);
        assert!(!entry.entry_id.is_empty());
    }
}
