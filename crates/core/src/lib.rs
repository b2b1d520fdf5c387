pub mod audit;
pub mod conditions;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod hooks;
pub mod stores;

pub use audit::AuditEntry;
pub use conditions::{Condition, ConditionOp, ConditionSet};
pub use config::{ConfigError, EngineConfig};
pub use domain::decision::{DecisionId, DecisionKind, DecisionRecord};
pub use domain::delegation::{Delegation, DelegationId, DelegationScope};
pub use domain::flow::{ApprovalFlow, ApprovalStep, ApproverType, FlowId, StepId};
pub use domain::request::{ApprovalRequest, Context, RequestId, RequestStatus};
pub use engine::ApprovalEngine;
pub use errors::EngineError;
pub use hooks::{HookError, HookEvent, HookPayload, HookRegistry};
pub use stores::{
    AuditStore, DecisionStore, DelegationStore, FlowStore, RequestStore, StoreError,
};
