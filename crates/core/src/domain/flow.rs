use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is allowed to decide a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverType {
    SpecificUser,
    Role,
    /// Approver user id is read from the request context; the step's
    /// `approver_role_name` names the context field to read.
    ContextApprover,
    /// Resolved through the org hierarchy of the requester.
    DepartmentManager,
}

impl ApproverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecificUser => "specific_user",
            Self::Role => "role",
            Self::ContextApprover => "context_approver",
            Self::DepartmentManager => "department_manager",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "specific_user" => Some(Self::SpecificUser),
            "role" => Some(Self::Role),
            "context_approver" => Some(Self::ContextApprover),
            "department_manager" => Some(Self::DepartmentManager),
            _ => None,
        }
    }
}

/// One hop in a flow: who decides, under what quorum, and where the
/// step escalates when it times out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: StepId,
    pub flow_id: FlowId,
    pub step_order: u32,
    pub approver_type: ApproverType,
    pub approver_user_id: Option<String>,
    pub approver_role_name: Option<String>,
    /// Quorum mode: true requires every eligible approver, false
    /// requires `min_approvals` of them.
    pub requires_all: bool,
    pub min_approvals: u32,
    pub skip_conditions: ConditionSet,
    pub escalation_step_id: Option<StepId>,
    pub escalation_user_id: Option<String>,
}

impl ApprovalStep {
    /// A step is skipped only when its skip set is non-empty and
    /// matches; an empty set must not skip (empty-matches-all is
    /// trigger semantics).
    pub fn is_skipped(&self, context: &crate::domain::request::Context) -> bool {
        !self.skip_conditions.is_empty() && self.skip_conditions.matches(context)
    }
}

/// Admin-configured routing for one entity type. Reference data; the
/// engine never mutates flows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalFlow {
    pub id: FlowId,
    pub name: String,
    pub entity_type: String,
    pub trigger_conditions: ConditionSet,
    pub auto_approve_below: Option<Decimal>,
    /// Context field the auto-approve threshold reads.
    pub amount_field: String,
    /// Stable admin-assigned selection order; lower wins.
    pub priority: i32,
    pub is_active: bool,
    /// Ordered by `step_order` ascending.
    pub steps: Vec<ApprovalStep>,
}

impl ApprovalFlow {
    pub fn step(&self, id: &StepId) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| &step.id == id)
    }

    /// Steps after `order`, in step order. `None` starts at the front.
    pub fn steps_after(&self, order: Option<u32>) -> impl Iterator<Item = &ApprovalStep> {
        let mut steps: Vec<&ApprovalStep> = self
            .steps
            .iter()
            .filter(move |step| order.map_or(true, |o| step.step_order > o))
            .collect();
        steps.sort_by_key(|step| step.step_order);
        steps.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{ApprovalFlow, ApprovalStep, ApproverType, FlowId, StepId};
    use crate::conditions::ConditionSet;

    fn step(id: &str, order: u32) -> ApprovalStep {
        ApprovalStep {
            id: StepId(id.to_string()),
            flow_id: FlowId("flow-1".to_string()),
            step_order: order,
            approver_type: ApproverType::SpecificUser,
            approver_user_id: Some("u-1".to_string()),
            approver_role_name: None,
            requires_all: false,
            min_approvals: 1,
            skip_conditions: ConditionSet::default(),
            escalation_step_id: None,
            escalation_user_id: None,
        }
    }

    #[test]
    fn steps_after_iterates_in_step_order() {
        let flow = ApprovalFlow {
            id: FlowId("flow-1".to_string()),
            name: "invoice approval".to_string(),
            entity_type: "invoice".to_string(),
            trigger_conditions: ConditionSet::default(),
            auto_approve_below: None,
            amount_field: "amount".to_string(),
            priority: 10,
            is_active: true,
            steps: vec![step("s-3", 3), step("s-1", 1), step("s-2", 2)],
        };

        let from_start: Vec<u32> = flow.steps_after(None).map(|s| s.step_order).collect();
        assert_eq!(from_start, vec![1, 2, 3]);

        let after_first: Vec<u32> = flow.steps_after(Some(1)).map(|s| s.step_order).collect();
        assert_eq!(after_first, vec![2, 3]);
    }

    #[test]
    fn approver_type_round_trips_through_wire_names() {
        for approver_type in [
            ApproverType::SpecificUser,
            ApproverType::Role,
            ApproverType::ContextApprover,
            ApproverType::DepartmentManager,
        ] {
            assert_eq!(ApproverType::parse(approver_type.as_str()), Some(approver_type));
        }
        assert_eq!(ApproverType::parse("committee"), None);
    }
}
