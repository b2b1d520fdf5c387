//! In-process named-event pub/sub: the seam between workflow logic and
//! side effects (notifications, cross-entity status sync). The engine
//! fires events; it never imports consumer code.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;

use crate::domain::flow::{FlowId, StepId};
use crate::domain::request::RequestId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookEvent {
    Submitted,
    Approved,
    Rejected,
    Returned,
    StepAdvanced,
    Reminder,
}

impl HookEvent {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Submitted => "approval.submitted",
            Self::Approved => "approval.approved",
            Self::Rejected => "approval.rejected",
            Self::Returned => "approval.returned",
            Self::StepAdvanced => "approval.step_advanced",
            Self::Reminder => "approval.reminder",
        }
    }
}

/// Everything a subscriber needs without re-querying the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct HookPayload {
    pub request_id: RequestId,
    pub entity_type: String,
    pub entity_id: String,
    pub flow_id: FlowId,
    pub step_id: Option<StepId>,
    pub metadata: BTreeMap<String, Value>,
}

impl HookPayload {
    pub fn new(
        request_id: RequestId,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        flow_id: FlowId,
        step_id: Option<StepId>,
    ) -> Self {
        Self {
            request_id,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            flow_id,
            step_id,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

type Handler = std::sync::Arc<dyn Fn(&HookPayload) -> Result<(), HookError> + Send + Sync>;

/// Synchronous registration-order dispatch with per-handler error
/// isolation: a failing subscriber is logged and skipped, never
/// unwound into the transition that fired it.
#[derive(Default)]
pub struct HookRegistry {
    handlers: Mutex<HashMap<HookEvent, Vec<Handler>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends; registering twice runs the handler twice.
    pub fn on<H>(&self, event: HookEvent, handler: H)
    where
        H: Fn(&HookPayload) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.lock().entry(event).or_default().push(std::sync::Arc::new(handler));
    }

    /// Fires all handlers for `event` in registration order. A missing
    /// registration is a no-op. The registry lock is released before
    /// dispatch so a handler may register further hooks.
    pub fn fire(&self, event: HookEvent, payload: &HookPayload) {
        let handlers: Vec<Handler> = match self.lock().get(&event) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        for handler in &handlers {
            if let Err(error) = handler(payload) {
                tracing::warn!(
                    event = event.wire_name(),
                    request_id = %payload.request_id,
                    %error,
                    "hook handler failed; continuing"
                );
            }
        }
    }

    /// Removes registrations for one event, or all of them.
    pub fn clear(&self, event: Option<HookEvent>) {
        let mut handlers = self.lock();
        match event {
            Some(event) => {
                handlers.remove(&event);
            }
            None => handlers.clear(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HookEvent, Vec<Handler>>> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{HookError, HookEvent, HookPayload, HookRegistry};
    use crate::domain::flow::FlowId;
    use crate::domain::request::RequestId;

    fn payload() -> HookPayload {
        HookPayload::new(
            RequestId("req-1".to_string()),
            "invoice",
            "inv-42",
            FlowId("flow-1".to_string()),
            None,
        )
        .with_metadata("auto_approved", json!(false))
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            registry.on(HookEvent::Submitted, move |_| {
                seen.lock().unwrap().push(label);
                Ok(())
            });
        }

        registry.fire(HookEvent::Submitted, &payload());
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_handler_does_not_break_later_handlers_or_the_caller() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        registry.on(HookEvent::Approved, |_| Err(HookError("notifier down".to_string())));
        {
            let seen = Arc::clone(&seen);
            registry.on(HookEvent::Approved, move |_| {
                seen.lock().unwrap().push("ran");
                Ok(())
            });
        }

        registry.fire(HookEvent::Approved, &payload());
        assert_eq!(*seen.lock().unwrap(), vec!["ran"]);
    }

    #[test]
    fn firing_without_subscribers_is_a_no_op() {
        let registry = HookRegistry::new();
        registry.fire(HookEvent::Reminder, &payload());
    }

    #[test]
    fn clear_removes_one_or_all_registrations() {
        let registry = HookRegistry::new();
        let count = Arc::new(Mutex::new(0_u32));

        for event in [HookEvent::Submitted, HookEvent::Rejected] {
            let count = Arc::clone(&count);
            registry.on(event, move |_| {
                *count.lock().unwrap() += 1;
                Ok(())
            });
        }

        registry.clear(Some(HookEvent::Submitted));
        registry.fire(HookEvent::Submitted, &payload());
        registry.fire(HookEvent::Rejected, &payload());
        assert_eq!(*count.lock().unwrap(), 1);

        registry.clear(None);
        registry.fire(HookEvent::Rejected, &payload());
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn payload_carries_subscriber_facing_identifiers() {
        let payload = payload();
        assert_eq!(payload.entity_type, "invoice");
        assert_eq!(payload.entity_id, "inv-42");
        assert_eq!(payload.metadata.get("auto_approved"), Some(&json!(false)));
        assert_eq!(HookEvent::StepAdvanced.wire_name(), "approval.step_advanced");
    }
}
