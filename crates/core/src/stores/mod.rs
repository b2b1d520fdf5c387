//! Engine-facing persistence seams. Flow/Step configuration is edited
//! out-of-band and read-only here; Request/Decision rows are created
//! and mutated only through engine operations. Durable backends live
//! in `flowgate-db`; [`memory`] provides in-process implementations
//! that enforce the same uniqueness rules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::audit::AuditEntry;
use crate::domain::decision::DecisionRecord;
use crate::domain::delegation::Delegation;
use crate::domain::flow::{ApprovalFlow, FlowId, StepId};
use crate::domain::request::{ApprovalRequest, RequestId, RequestStatus};

pub mod memory;

pub use memory::{
    InMemoryAuditStore, InMemoryDecisionStore, InMemoryDelegationStore, InMemoryFlowStore,
    InMemoryRequestStore,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write. The engine maps
    /// this to `AlreadyPending` / `AlreadyDecided` depending on the
    /// insert that raised it.
    #[error("unique constraint violated")]
    UniqueViolation,
    /// A guarded update found the row in a different state than the
    /// caller observed.
    #[error("concurrent update conflict")]
    Conflict,
    #[error("row not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, StoreError>;

    /// Active flows for one entity type. Callers must not depend on
    /// store iteration order; the engine sorts by (priority, id).
    async fn list_active_for_entity(
        &self,
        entity_type: &str,
    ) -> Result<Vec<ApprovalFlow>, StoreError>;
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, StoreError>;

    async fn find_live_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<ApprovalRequest>, StoreError>;

    /// Insert must enforce at most one live request per
    /// (entity_type, entity_id) atomically with the write, returning
    /// [`StoreError::UniqueViolation`] on collision.
    async fn insert(&self, request: ApprovalRequest) -> Result<ApprovalRequest, StoreError>;

    /// Compare-and-swap on status: the write applies only while the
    /// row still carries `expected_status`, otherwise
    /// [`StoreError::Conflict`]. This is the per-request atomicity
    /// anchor for concurrent decide() calls.
    async fn update(
        &self,
        request: ApprovalRequest,
        expected_status: RequestStatus,
    ) -> Result<ApprovalRequest, StoreError>;

    async fn list_live_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>, StoreError>;
}

#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Append-only; uniqueness on (request_id, step_id, decided_by)
    /// must be constraint-backed, not just pre-checked.
    async fn insert(&self, decision: DecisionRecord) -> Result<DecisionRecord, StoreError>;

    async fn list_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<DecisionRecord>, StoreError>;

    async fn list_for_step(
        &self,
        request_id: &RequestId,
        step_id: &StepId,
    ) -> Result<Vec<DecisionRecord>, StoreError>;
}

/// The role/delegate lookup collaborator: delegation windows, role
/// membership and the org hierarchy.
#[async_trait]
pub trait DelegationStore: Send + Sync {
    async fn active_delegations_for(
        &self,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Delegation>, StoreError>;

    async fn user_has_role(&self, user_id: &str, role: &str) -> Result<bool, StoreError>;

    /// Denominator for `requires_all` quorums on role-addressed steps.
    async fn count_role_members(&self, role: &str) -> Result<u32, StoreError>;

    async fn manager_of(&self, user_id: &str) -> Result<Option<String>, StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError>;

    async fn list_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AuditEntry>, StoreError>;
}
