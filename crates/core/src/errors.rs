use thiserror::Error;

use crate::domain::flow::StepId;
use crate::domain::request::{RequestId, RequestStatus};
use crate::stores::StoreError;

/// One variant per precondition violation. All business variants are
/// caller errors (4xx at the embedding layer) and are never retried by
/// the engine; store failures pass through unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a live approval request already exists for {entity_type}/{entity_id}")]
    AlreadyPending { entity_type: String, entity_id: String },

    #[error("no active flow matches entity type `{entity_type}` for this context")]
    NoMatchingFlow { entity_type: String },

    #[error("request {request_id} does not allow this operation in status `{status}`")]
    InvalidState { request_id: RequestId, status: RequestStatus },

    #[error("{decided_by} already decided request {request_id} at step {step_id}")]
    AlreadyDecided { request_id: RequestId, step_id: StepId, decided_by: String },

    #[error("{user_id} is not authorized to decide request {request_id}")]
    NotAuthorized { request_id: RequestId, user_id: String },

    #[error("approval request {0} not found")]
    RequestNotFound(RequestId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::EngineError;
    use crate::domain::request::{RequestId, RequestStatus};

    #[test]
    fn messages_name_the_violated_precondition() {
        let error = EngineError::InvalidState {
            request_id: RequestId("req-9".to_string()),
            status: RequestStatus::Approved,
        };
        assert_eq!(
            error.to_string(),
            "request req-9 does not allow this operation in status `approved`"
        );

        let error = EngineError::NoMatchingFlow { entity_type: "invoice".to_string() };
        assert!(error.to_string().contains("invoice"));
    }
}
