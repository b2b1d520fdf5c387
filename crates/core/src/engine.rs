//! Orchestrates submit / decide / cancel / resubmit / escalate and the
//! scheduled sweeps. The engine is stateless between calls: all state
//! lives in the stores, all side effects go through the hook registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::config::EngineConfig;
use crate::domain::decision::{DecisionId, DecisionKind, DecisionRecord};
use crate::domain::delegation::DelegationScope;
use crate::domain::flow::{ApprovalFlow, ApprovalStep, ApproverType};
use crate::domain::request::{ApprovalRequest, Context, RequestId, RequestStatus};
use crate::errors::EngineError;
use crate::hooks::{HookEvent, HookPayload, HookRegistry};
use crate::stores::{
    AuditStore, DecisionStore, DelegationStore, FlowStore, RequestStore, StoreError,
};

pub struct ApprovalEngine {
    flows: Arc<dyn FlowStore>,
    requests: Arc<dyn RequestStore>,
    decisions: Arc<dyn DecisionStore>,
    delegations: Arc<dyn DelegationStore>,
    audit: Arc<dyn AuditStore>,
    hooks: Arc<HookRegistry>,
    config: EngineConfig,
}

impl ApprovalEngine {
    pub fn new(
        flows: Arc<dyn FlowStore>,
        requests: Arc<dyn RequestStore>,
        decisions: Arc<dyn DecisionStore>,
        delegations: Arc<dyn DelegationStore>,
        audit: Arc<dyn AuditStore>,
        hooks: Arc<HookRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self { flows, requests, decisions, delegations, audit, hooks, config }
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Routes the entity into the first matching active flow and
    /// creates its request. At most one live request may exist per
    /// entity; the store's uniqueness constraint backs the pre-check.
    pub async fn submit(
        &self,
        entity_type: &str,
        entity_id: &str,
        context: Context,
        requested_by: &str,
    ) -> Result<ApprovalRequest, EngineError> {
        if self.requests.find_live_for_entity(entity_type, entity_id).await?.is_some() {
            return Err(EngineError::AlreadyPending {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            });
        }

        let flow = self
            .select_flow(entity_type, &context)
            .await?
            .ok_or_else(|| EngineError::NoMatchingFlow { entity_type: entity_type.to_string() })?;
        debug!(flow_id = %flow.id, entity_type, entity_id, "flow selected");

        let now = Utc::now();

        if let (Some(threshold), Some(amount)) =
            (flow.auto_approve_below, context.numeric(&flow.amount_field))
        {
            if amount < threshold {
                let request = self
                    .insert_request(new_request(
                        &flow,
                        entity_type,
                        entity_id,
                        context,
                        requested_by,
                        RequestStatus::Approved,
                        None,
                        now,
                    ))
                    .await?;
                self.append_audit(
                    AuditEntry::new(Some(request.id.clone()), requested_by, "request.auto_approved")
                        .with_detail(format!("{amount} below threshold {threshold}"))
                        .with_metadata("flow_id", json!(flow.id.0)),
                )
                .await?;
                info!(request_id = %request.id, %amount, "auto-approved below threshold");
                self.hooks.fire(
                    HookEvent::Approved,
                    &self.payload(&request).with_metadata("auto_approved", json!(true)),
                );
                return Ok(request);
            }
        }

        let first_step =
            flow.steps_after(None).find(|step| !step.is_skipped(&context)).cloned();
        match first_step {
            Some(step) => {
                let request = self
                    .insert_request(new_request(
                        &flow,
                        entity_type,
                        entity_id,
                        context,
                        requested_by,
                        RequestStatus::Pending,
                        Some(step.id.clone()),
                        now,
                    ))
                    .await?;
                self.append_audit(
                    AuditEntry::new(Some(request.id.clone()), requested_by, "request.submitted")
                        .with_metadata("flow_id", json!(flow.id.0))
                        .with_metadata("first_step_id", json!(step.id.0)),
                )
                .await?;
                info!(request_id = %request.id, step_id = %step.id, "request submitted");
                self.hooks.fire(HookEvent::Submitted, &self.payload(&request));
                Ok(request)
            }
            // Every step was skip-eligible: nobody needs to decide, so
            // the request resolves as if it fell off the step list.
            None => {
                let request = self
                    .insert_request(new_request(
                        &flow,
                        entity_type,
                        entity_id,
                        context,
                        requested_by,
                        RequestStatus::Approved,
                        None,
                        now,
                    ))
                    .await?;
                self.append_audit(
                    AuditEntry::new(Some(request.id.clone()), requested_by, "request.approved")
                        .with_detail("every step skipped for this context")
                        .with_metadata("flow_id", json!(flow.id.0)),
                )
                .await?;
                info!(request_id = %request.id, "approved with every step skipped");
                self.hooks.fire(
                    HookEvent::Approved,
                    &self.payload(&request).with_metadata("auto_approved", json!(false)),
                );
                Ok(request)
            }
        }
    }

    /// Records one approver's vote and applies its consequence. The
    /// decision row is inserted before any transition; its uniqueness
    /// constraint closes the double-vote race.
    pub async fn decide(
        &self,
        request_id: &RequestId,
        decision: DecisionKind,
        decided_by: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, EngineError> {
        let request = self.require_request(request_id).await?;
        if !request.status.accepts_decisions() {
            return Err(EngineError::InvalidState {
                request_id: request_id.clone(),
                status: request.status,
            });
        }
        let flow = self.require_flow(&request).await?;
        let step_id = request.current_step_id.clone().ok_or_else(|| {
            EngineError::InvalidState { request_id: request_id.clone(), status: request.status }
        })?;
        let step = flow.step(&step_id).cloned().ok_or(StoreError::NotFound)?;

        let prior = self.decisions.list_for_step(request_id, &step_id).await?;
        if prior.iter().any(|vote| vote.decided_by == decided_by) {
            return Err(EngineError::AlreadyDecided {
                request_id: request_id.clone(),
                step_id,
                decided_by: decided_by.to_string(),
            });
        }

        if !self.is_authorized(&step, &request, decided_by).await? {
            return Err(EngineError::NotAuthorized {
                request_id: request_id.clone(),
                user_id: decided_by.to_string(),
            });
        }

        let record = DecisionRecord {
            id: DecisionId(Uuid::new_v4().to_string()),
            request_id: request_id.clone(),
            step_id: step_id.clone(),
            decided_by: decided_by.to_string(),
            decision,
            comment: comment.map(str::to_string),
            decided_at: Utc::now(),
        };
        match self.decisions.insert(record).await {
            Ok(_) => {}
            Err(StoreError::UniqueViolation) => {
                return Err(EngineError::AlreadyDecided {
                    request_id: request_id.clone(),
                    step_id,
                    decided_by: decided_by.to_string(),
                });
            }
            Err(error) => return Err(error.into()),
        }
        self.append_audit(
            AuditEntry::new(Some(request_id.clone()), decided_by, "decision.recorded")
                .with_metadata("decision", json!(decision.as_str()))
                .with_metadata("step_id", json!(step_id.0)),
        )
        .await?;

        match decision {
            // Fail-fast: one rejection stops the flow regardless of
            // quorum or prior approvals.
            DecisionKind::Rejected => self.finish_rejected(request, decided_by, comment).await,
            DecisionKind::Returned => self.put_on_hold(request, decided_by, comment).await,
            DecisionKind::Approved | DecisionKind::Abstained => {
                self.advance_if_resolved(flow, step, request, decided_by).await
            }
        }
    }

    /// Legal from any live status.
    pub async fn cancel(
        &self,
        request_id: &RequestId,
        cancelled_by: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalRequest, EngineError> {
        let request = self.require_request(request_id).await?;
        if !request.status.is_live() {
            return Err(EngineError::InvalidState {
                request_id: request_id.clone(),
                status: request.status,
            });
        }
        let previous = request.status;
        let mut updated = request;
        updated.status = RequestStatus::Cancelled;
        updated.current_step_id = None;
        updated.resolution_note = reason.map(str::to_string);
        updated.resolved_at = Some(Utc::now());
        let updated = self.requests.update(updated, previous).await?;
        self.append_audit(
            AuditEntry::new(Some(request_id.clone()), cancelled_by, "request.cancelled")
                .with_detail(reason.unwrap_or("cancelled by caller")),
        )
        .await?;
        info!(request_id = %updated.id, "request cancelled");
        Ok(updated)
    }

    /// Opens a fresh request for the same entity with a new context
    /// snapshot. Legal from `rejected` and `on_hold`; an on-hold
    /// request is closed first so it frees the entity's live slot,
    /// and reopened if the new submission does not go through.
    pub async fn resubmit(
        &self,
        old_request_id: &RequestId,
        new_context: Context,
        resubmitted_by: &str,
    ) -> Result<ApprovalRequest, EngineError> {
        let old = self.require_request(old_request_id).await?;
        let closed_on_hold = match old.status {
            RequestStatus::Rejected => false,
            RequestStatus::OnHold => {
                let mut closed = old.clone();
                closed.status = RequestStatus::Cancelled;
                closed.current_step_id = None;
                closed.resolution_note = Some("superseded by resubmission".to_string());
                closed.resolved_at = Some(Utc::now());
                self.requests.update(closed, RequestStatus::OnHold).await?;
                true
            }
            status => {
                return Err(EngineError::InvalidState {
                    request_id: old_request_id.clone(),
                    status,
                });
            }
        };

        let request = match self
            .submit(&old.entity_type, &old.entity_id, new_context, resubmitted_by)
            .await
        {
            Ok(request) => request,
            Err(error) => {
                // The submission never happened; put the on-hold
                // request back so a corrected resubmit stays legal.
                if closed_on_hold {
                    self.requests.update(old.clone(), RequestStatus::Cancelled).await?;
                }
                return Err(error);
            }
        };
        self.append_audit(
            AuditEntry::new(Some(request.id.clone()), resubmitted_by, "request.resubmitted")
                .with_metadata("previous_request_id", json!(old.id.0)),
        )
        .await?;
        Ok(request)
    }

    /// Swaps who decides next. Best-effort: a step without any
    /// escalation target only gets an audit entry. History is never
    /// touched; prior decisions stay on the record.
    pub async fn escalate(
        &self,
        request_id: &RequestId,
        reason: &str,
    ) -> Result<ApprovalRequest, EngineError> {
        let request = self.require_request(request_id).await?;
        if !request.status.accepts_decisions() {
            return Err(EngineError::InvalidState {
                request_id: request_id.clone(),
                status: request.status,
            });
        }
        let flow = self.require_flow(&request).await?;
        let step_id = request.current_step_id.clone().ok_or_else(|| {
            EngineError::InvalidState { request_id: request_id.clone(), status: request.status }
        })?;
        let step = flow.step(&step_id).cloned().ok_or(StoreError::NotFound)?;

        let target_step = step
            .escalation_step_id
            .as_ref()
            .and_then(|target| flow.step(target))
            .cloned();

        let previous = request.status;
        let mut updated = request.clone();
        updated.status = RequestStatus::Escalated;

        if let Some(target) = target_step {
            updated.current_step_id = Some(target.id.clone());
            updated.escalated_to_user_id = None;
            let updated = self.requests.update(updated, previous).await?;
            self.append_audit(
                AuditEntry::new(Some(request_id.clone()), "engine", "request.escalated")
                    .with_detail(reason)
                    .with_metadata("from_step_id", json!(step.id.0))
                    .with_metadata("to_step_id", json!(target.id.0)),
            )
            .await?;
            info!(request_id = %updated.id, to_step = %target.id, "escalated to step");
            Ok(updated)
        } else if let Some(user) = step.escalation_user_id.clone() {
            updated.escalated_to_user_id = Some(user.clone());
            let updated = self.requests.update(updated, previous).await?;
            self.append_audit(
                AuditEntry::new(Some(request_id.clone()), "engine", "request.escalated")
                    .with_detail(reason)
                    .with_metadata("step_id", json!(step.id.0))
                    .with_metadata("to_user_id", json!(user)),
            )
            .await?;
            info!(request_id = %updated.id, "escalated to user");
            Ok(updated)
        } else {
            warn!(request_id = %request.id, step_id = %step.id, "escalation attempted, no path");
            self.append_audit(
                AuditEntry::new(Some(request_id.clone()), "engine", "request.escalation_no_path")
                    .with_detail(reason)
                    .with_metadata("step_id", json!(step.id.0)),
            )
            .await?;
            Ok(request)
        }
    }

    /// Escalates live requests older than the configured timeout age.
    /// Already-escalated and on-hold requests are left alone. Returns
    /// how many requests were escalated.
    pub async fn process_timeouts(&self, now: DateTime<Utc>) -> Result<u32, EngineError> {
        let cutoff = now - self.config.timeout_after;
        let mut escalated = 0;
        for request in self.requests.list_live_older_than(cutoff).await? {
            if !matches!(request.status, RequestStatus::Pending | RequestStatus::InProgress) {
                continue;
            }
            let after = self.escalate(&request.id, "aged past timeout threshold").await?;
            if after.status == RequestStatus::Escalated {
                escalated += 1;
            }
        }
        info!(escalated, "timeout sweep complete");
        Ok(escalated)
    }

    /// Fires `approval.reminder` for live, decidable requests older
    /// than the reminder age. Returns how many reminders fired.
    pub async fn process_reminders(&self, now: DateTime<Utc>) -> Result<u32, EngineError> {
        let cutoff = now - self.config.remind_after;
        let mut reminded = 0;
        for request in self.requests.list_live_older_than(cutoff).await? {
            if !request.status.accepts_decisions() {
                continue;
            }
            let age_hours = (now - request.created_at).num_hours();
            self.hooks.fire(
                HookEvent::Reminder,
                &self.payload(&request).with_metadata("age_hours", json!(age_hours)),
            );
            self.append_audit(
                AuditEntry::new(Some(request.id.clone()), "engine", "request.reminder_sent")
                    .with_metadata("age_hours", json!(age_hours)),
            )
            .await?;
            reminded += 1;
        }
        info!(reminded, "reminder sweep complete");
        Ok(reminded)
    }

    /// Expires every live request older than the expiration age.
    /// Returns how many requests were expired.
    pub async fn process_expirations(&self, now: DateTime<Utc>) -> Result<u32, EngineError> {
        let cutoff = now - self.config.expire_after;
        let mut expired = 0;
        for request in self.requests.list_live_older_than(cutoff).await? {
            let previous = request.status;
            let mut updated = request;
            updated.status = RequestStatus::Expired;
            updated.current_step_id = None;
            updated.resolution_note = Some("expired without resolution".to_string());
            updated.resolved_at = Some(now);
            let updated = self.requests.update(updated, previous).await?;
            self.append_audit(AuditEntry::new(
                Some(updated.id.clone()),
                "engine",
                "request.expired",
            ))
            .await?;
            expired += 1;
        }
        info!(expired, "expiration sweep complete");
        Ok(expired)
    }

    /// First active flow whose trigger conditions match, in stable
    /// admin-assigned order (priority, then id) — independent of store
    /// iteration order.
    async fn select_flow(
        &self,
        entity_type: &str,
        context: &Context,
    ) -> Result<Option<ApprovalFlow>, EngineError> {
        let mut candidates = self.flows.list_active_for_entity(entity_type).await?;
        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(candidates.into_iter().find(|flow| flow.trigger_conditions.matches(context)))
    }

    async fn advance_if_resolved(
        &self,
        flow: ApprovalFlow,
        step: ApprovalStep,
        request: ApprovalRequest,
        decided_by: &str,
    ) -> Result<ApprovalRequest, EngineError> {
        let votes = self.decisions.list_for_step(&request.id, &step.id).await?;
        let approved =
            votes.iter().filter(|vote| vote.decision == DecisionKind::Approved).count() as u32;
        let resolved = if step.requires_all {
            let required = self.required_approver_count(&step).await?;
            required > 0 && approved >= required
        } else {
            approved >= step.min_approvals
        };
        if !resolved {
            debug!(request_id = %request.id, step_id = %step.id, approved, "quorum outstanding");
            return Ok(request);
        }

        let next = flow
            .steps_after(Some(step.step_order))
            .find(|candidate| !candidate.is_skipped(&request.context))
            .cloned();
        let previous = request.status;
        let mut updated = request;
        updated.escalated_to_user_id = None;

        match next {
            Some(next_step) => {
                updated.status = RequestStatus::InProgress;
                updated.current_step_id = Some(next_step.id.clone());
                let updated = self.requests.update(updated, previous).await?;
                self.append_audit(
                    AuditEntry::new(Some(updated.id.clone()), decided_by, "request.step_advanced")
                        .with_metadata("from_step_id", json!(step.id.0))
                        .with_metadata("to_step_id", json!(next_step.id.0)),
                )
                .await?;
                debug!(request_id = %updated.id, to_step = %next_step.id, "step advanced");
                self.hooks.fire(
                    HookEvent::StepAdvanced,
                    &self.payload(&updated).with_metadata("from_step_id", json!(step.id.0)),
                );
                Ok(updated)
            }
            None => {
                updated.status = RequestStatus::Approved;
                updated.current_step_id = None;
                updated.resolved_at = Some(Utc::now());
                let updated = self.requests.update(updated, previous).await?;
                self.append_audit(AuditEntry::new(
                    Some(updated.id.clone()),
                    decided_by,
                    "request.approved",
                ))
                .await?;
                info!(request_id = %updated.id, "request approved");
                self.hooks.fire(
                    HookEvent::Approved,
                    &self.payload(&updated).with_metadata("auto_approved", json!(false)),
                );
                Ok(updated)
            }
        }
    }

    async fn finish_rejected(
        &self,
        request: ApprovalRequest,
        decided_by: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, EngineError> {
        let previous = request.status;
        let mut updated = request;
        updated.status = RequestStatus::Rejected;
        updated.current_step_id = None;
        updated.resolution_note = comment.map(str::to_string);
        updated.resolved_at = Some(Utc::now());
        let updated = self.requests.update(updated, previous).await?;
        self.append_audit(
            AuditEntry::new(Some(updated.id.clone()), decided_by, "request.rejected")
                .with_detail(comment.unwrap_or("rejected")),
        )
        .await?;
        info!(request_id = %updated.id, "request rejected");
        let mut payload = self.payload(&updated);
        if let Some(comment) = comment {
            payload = payload.with_metadata("comment", json!(comment));
        }
        self.hooks.fire(HookEvent::Rejected, &payload);
        Ok(updated)
    }

    async fn put_on_hold(
        &self,
        request: ApprovalRequest,
        decided_by: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, EngineError> {
        let previous = request.status;
        let mut updated = request;
        updated.status = RequestStatus::OnHold;
        updated.resolution_note = comment.map(str::to_string);
        let updated = self.requests.update(updated, previous).await?;
        self.append_audit(
            AuditEntry::new(Some(updated.id.clone()), decided_by, "request.returned")
                .with_detail(comment.unwrap_or("returned to requester")),
        )
        .await?;
        info!(request_id = %updated.id, "request returned, on hold until resubmission");
        let mut payload = self.payload(&updated);
        if let Some(comment) = comment {
            payload = payload.with_metadata("comment", json!(comment));
        }
        self.hooks.fire(HookEvent::Returned, &payload);
        Ok(updated)
    }

    async fn is_authorized(
        &self,
        step: &ApprovalStep,
        request: &ApprovalRequest,
        user_id: &str,
    ) -> Result<bool, EngineError> {
        if self.directly_authorized(step, request, user_id).await? {
            return Ok(true);
        }
        if request.status == RequestStatus::Escalated
            && request.escalated_to_user_id.as_deref() == Some(user_id)
        {
            return Ok(true);
        }
        for delegation in
            self.delegations.active_delegations_for(user_id, Utc::now()).await?
        {
            match &delegation.scope {
                DelegationScope::Role(role) => {
                    if step.approver_role_name.as_deref() == Some(role.as_str()) {
                        return Ok(true);
                    }
                }
                DelegationScope::Step(scope_step) => {
                    if scope_step == &step.id
                        && self
                            .directly_authorized(step, request, &delegation.delegator_id)
                            .await?
                    {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn directly_authorized(
        &self,
        step: &ApprovalStep,
        request: &ApprovalRequest,
        user_id: &str,
    ) -> Result<bool, EngineError> {
        let authorized = match step.approver_type {
            ApproverType::SpecificUser => step.approver_user_id.as_deref() == Some(user_id),
            ApproverType::Role => match step.approver_role_name.as_deref() {
                Some(role) => self.delegations.user_has_role(user_id, role).await?,
                None => false,
            },
            ApproverType::ContextApprover => match step.approver_role_name.as_deref() {
                Some(field) => request.context.string(field) == Some(user_id),
                None => false,
            },
            ApproverType::DepartmentManager => {
                self.delegations.manager_of(&request.requested_by).await?.as_deref()
                    == Some(user_id)
            }
        };
        Ok(authorized)
    }

    async fn required_approver_count(&self, step: &ApprovalStep) -> Result<u32, EngineError> {
        match (step.approver_type, step.approver_role_name.as_deref()) {
            (ApproverType::Role, Some(role)) => {
                Ok(self.delegations.count_role_members(role).await?)
            }
            _ => Ok(1),
        }
    }

    async fn require_request(
        &self,
        request_id: &RequestId,
    ) -> Result<ApprovalRequest, EngineError> {
        self.requests
            .find_by_id(request_id)
            .await?
            .ok_or_else(|| EngineError::RequestNotFound(request_id.clone()))
    }

    async fn require_flow(
        &self,
        request: &ApprovalRequest,
    ) -> Result<ApprovalFlow, EngineError> {
        Ok(self.flows.find_by_id(&request.flow_id).await?.ok_or(StoreError::NotFound)?)
    }

    async fn insert_request(
        &self,
        request: ApprovalRequest,
    ) -> Result<ApprovalRequest, EngineError> {
        let entity_type = request.entity_type.clone();
        let entity_id = request.entity_id.clone();
        match self.requests.insert(request).await {
            Ok(inserted) => Ok(inserted),
            // Constraint fired under a concurrent submit that slipped
            // past the pre-check.
            Err(StoreError::UniqueViolation) => {
                Err(EngineError::AlreadyPending { entity_type, entity_id })
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), EngineError> {
        Ok(self.audit.append(entry).await?)
    }

    fn payload(&self, request: &ApprovalRequest) -> HookPayload {
        HookPayload::new(
            request.id.clone(),
            request.entity_type.clone(),
            request.entity_id.clone(),
            request.flow_id.clone(),
            request.current_step_id.clone(),
        )
    }
}

fn new_request(
    flow: &ApprovalFlow,
    entity_type: &str,
    entity_id: &str,
    context: Context,
    requested_by: &str,
    status: RequestStatus,
    current_step_id: Option<crate::domain::flow::StepId>,
    now: DateTime<Utc>,
) -> ApprovalRequest {
    let resolved_at = if status.is_live() { None } else { Some(now) };
    ApprovalRequest {
        id: RequestId(Uuid::new_v4().to_string()),
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        flow_id: flow.id.clone(),
        status,
        current_step_id,
        context,
        requested_by: requested_by.to_string(),
        resolution_note: None,
        escalated_to_user_id: None,
        created_at: now,
        resolved_at,
    }
}
