//! In-process store implementations. Used by the engine's tests and by
//! embedders that do not need durability; both uniqueness rules are
//! enforced here so the error taxonomy matches the SQL stores.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    AuditStore, DecisionStore, DelegationStore, FlowStore, RequestStore, StoreError,
};
use crate::audit::AuditEntry;
use crate::domain::decision::DecisionRecord;
use crate::domain::delegation::Delegation;
use crate::domain::flow::{ApprovalFlow, FlowId, StepId};
use crate::domain::request::{ApprovalRequest, RequestId, RequestStatus};

#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: RwLock<Vec<ApprovalFlow>>,
}

impl InMemoryFlowStore {
    pub async fn insert(&self, flow: ApprovalFlow) {
        self.flows.write().await.push(flow);
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, StoreError> {
        let flows = self.flows.read().await;
        Ok(flows.iter().find(|flow| &flow.id == id).cloned())
    }

    async fn list_active_for_entity(
        &self,
        entity_type: &str,
    ) -> Result<Vec<ApprovalFlow>, StoreError> {
        let flows = self.flows.read().await;
        Ok(flows
            .iter()
            .filter(|flow| flow.is_active && flow.entity_type == entity_type)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryRequestStore {
    requests: RwLock<HashMap<String, ApprovalRequest>>,
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, StoreError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).cloned())
    }

    async fn find_live_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .find(|request| {
                request.status.is_live()
                    && request.entity_type == entity_type
                    && request.entity_id == entity_id
            })
            .cloned())
    }

    async fn insert(&self, request: ApprovalRequest) -> Result<ApprovalRequest, StoreError> {
        let mut requests = self.requests.write().await;
        let live_collision = request.status.is_live()
            && requests.values().any(|existing| {
                existing.status.is_live()
                    && existing.entity_type == request.entity_type
                    && existing.entity_id == request.entity_id
            });
        if live_collision {
            return Err(StoreError::UniqueViolation);
        }
        requests.insert(request.id.0.clone(), request.clone());
        Ok(request)
    }

    async fn update(
        &self,
        request: ApprovalRequest,
        expected_status: RequestStatus,
    ) -> Result<ApprovalRequest, StoreError> {
        let mut requests = self.requests.write().await;
        let existing = requests.get(&request.id.0).ok_or(StoreError::NotFound)?;
        if existing.status != expected_status {
            return Err(StoreError::Conflict);
        }
        requests.insert(request.id.0.clone(), request.clone());
        Ok(request)
    }

    async fn list_live_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let requests = self.requests.read().await;
        let mut overdue: Vec<ApprovalRequest> = requests
            .values()
            .filter(|request| request.status.is_live() && request.created_at < cutoff)
            .cloned()
            .collect();
        overdue.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(overdue)
    }
}

#[derive(Default)]
pub struct InMemoryDecisionStore {
    decisions: RwLock<Vec<DecisionRecord>>,
}

#[async_trait]
impl DecisionStore for InMemoryDecisionStore {
    async fn insert(&self, decision: DecisionRecord) -> Result<DecisionRecord, StoreError> {
        let mut decisions = self.decisions.write().await;
        let duplicate = decisions.iter().any(|existing| {
            existing.request_id == decision.request_id
                && existing.step_id == decision.step_id
                && existing.decided_by == decision.decided_by
        });
        if duplicate {
            return Err(StoreError::UniqueViolation);
        }
        decisions.push(decision.clone());
        Ok(decision)
    }

    async fn list_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        let decisions = self.decisions.read().await;
        Ok(decisions.iter().filter(|d| &d.request_id == request_id).cloned().collect())
    }

    async fn list_for_step(
        &self,
        request_id: &RequestId,
        step_id: &StepId,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        let decisions = self.decisions.read().await;
        Ok(decisions
            .iter()
            .filter(|d| &d.request_id == request_id && &d.step_id == step_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryDelegationStore {
    delegations: RwLock<Vec<Delegation>>,
    roles: RwLock<HashMap<String, HashSet<String>>>,
    managers: RwLock<HashMap<String, String>>,
}

impl InMemoryDelegationStore {
    pub async fn add_delegation(&self, delegation: Delegation) {
        self.delegations.write().await.push(delegation);
    }

    pub async fn grant_role(&self, user_id: &str, role: &str) {
        self.roles.write().await.entry(role.to_string()).or_default().insert(user_id.to_string());
    }

    pub async fn set_manager(&self, user_id: &str, manager_id: &str) {
        self.managers.write().await.insert(user_id.to_string(), manager_id.to_string());
    }
}

#[async_trait]
impl DelegationStore for InMemoryDelegationStore {
    async fn active_delegations_for(
        &self,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Delegation>, StoreError> {
        let delegations = self.delegations.read().await;
        Ok(delegations
            .iter()
            .filter(|d| d.delegate_id == delegate_id && d.is_active_at(at))
            .cloned()
            .collect())
    }

    async fn user_has_role(&self, user_id: &str, role: &str) -> Result<bool, StoreError> {
        let roles = self.roles.read().await;
        Ok(roles.get(role).map_or(false, |members| members.contains(user_id)))
    }

    async fn count_role_members(&self, role: &str) -> Result<u32, StoreError> {
        let roles = self.roles.read().await;
        Ok(roles.get(role).map_or(0, |members| members.len() as u32))
    }

    async fn manager_of(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let managers = self.managers.read().await;
        Ok(managers.get(user_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: RwLock<Vec<AuditEntry>>,
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn list_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|entry| entry.request_id.as_ref() == Some(request_id))
            .cloned()
            .collect())
    }
}
