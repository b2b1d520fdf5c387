pub mod decision;
pub mod delegation;
pub mod flow;
pub mod request;

pub use decision::{DecisionId, DecisionKind, DecisionRecord};
pub use delegation::{Delegation, DelegationId, DelegationScope};
pub use flow::{ApprovalFlow, ApprovalStep, ApproverType, FlowId, StepId};
pub use request::{ApprovalRequest, Context, RequestId, RequestStatus};
