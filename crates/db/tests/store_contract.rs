use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Map};

use flowgate_core::{
    ApprovalEngine, ApprovalFlow, ApprovalRequest, ApprovalStep, ApproverType, ConditionSet,
    Context, DecisionId, DecisionKind, DecisionRecord, DecisionStore, Delegation, DelegationId,
    DelegationScope, DelegationStore, EngineConfig, FlowId, FlowStore, HookRegistry, RequestId,
    RequestStatus, RequestStore, StepId, StoreError,
};
use flowgate_core::AuditStore;
use flowgate_db::{
    connect_with_settings, migrations, DbPool, SqlAuditStore, SqlDecisionStore,
    SqlDelegationStore, SqlFlowStore, SqlRequestStore,
};

// A shared in-memory database needs a single connection: every pool
// connection would otherwise see its own empty schema.
async fn pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrate");
    pool
}

fn sample_flow() -> ApprovalFlow {
    let mut trigger = Map::new();
    trigger.insert("amount_gte".to_string(), json!(100));
    ApprovalFlow {
        id: FlowId("flow-1".to_string()),
        name: "invoice approval".to_string(),
        entity_type: "invoice".to_string(),
        trigger_conditions: ConditionSet::parse(trigger),
        auto_approve_below: None,
        amount_field: "amount".to_string(),
        priority: 10,
        is_active: true,
        steps: vec![
            ApprovalStep {
                id: StepId("s-1".to_string()),
                flow_id: FlowId("flow-1".to_string()),
                step_order: 1,
                approver_type: ApproverType::SpecificUser,
                approver_user_id: Some("u-manager".to_string()),
                approver_role_name: None,
                requires_all: false,
                min_approvals: 1,
                skip_conditions: ConditionSet::default(),
                escalation_step_id: None,
                escalation_user_id: None,
            },
            ApprovalStep {
                id: StepId("s-2".to_string()),
                flow_id: FlowId("flow-1".to_string()),
                step_order: 2,
                approver_type: ApproverType::Role,
                approver_user_id: None,
                approver_role_name: Some("finance".to_string()),
                requires_all: false,
                min_approvals: 1,
                skip_conditions: ConditionSet::default(),
                escalation_step_id: None,
                escalation_user_id: None,
            },
        ],
    }
}

fn sample_request(id: &str, entity_id: &str, status: RequestStatus) -> ApprovalRequest {
    let mut context = Map::new();
    context.insert("amount".to_string(), json!(500));
    ApprovalRequest {
        id: RequestId(id.to_string()),
        entity_type: "invoice".to_string(),
        entity_id: entity_id.to_string(),
        flow_id: FlowId("flow-1".to_string()),
        status,
        current_step_id: Some(StepId("s-1".to_string())),
        context: Context(context),
        requested_by: "u-clerk".to_string(),
        resolution_note: None,
        escalated_to_user_id: None,
        created_at: Utc::now(),
        resolved_at: None,
    }
}

#[tokio::test]
async fn flow_round_trips_with_steps_in_order() {
    let pool = pool().await;
    let flows = SqlFlowStore::new(pool);
    flows.save(&sample_flow()).await.expect("save");

    let loaded = flows
        .find_by_id(&FlowId("flow-1".to_string()))
        .await
        .expect("find")
        .expect("flow exists");
    assert_eq!(loaded.steps.len(), 2);
    assert_eq!(loaded.steps[0].id, StepId("s-1".to_string()));
    assert_eq!(loaded.steps[1].approver_role_name.as_deref(), Some("finance"));

    let matching = Context({
        let mut map = Map::new();
        map.insert("amount".to_string(), json!(250));
        map
    });
    assert!(loaded.trigger_conditions.matches(&matching));

    let active = flows.list_active_for_entity("invoice").await.expect("list");
    assert_eq!(active.len(), 1);
    assert!(flows.list_active_for_entity("purchase_order").await.expect("list").is_empty());

    let missing = flows.find_by_id(&FlowId("flow-404".to_string())).await.expect("find");
    assert!(missing.is_none());
}

#[tokio::test]
async fn second_live_request_for_an_entity_hits_the_partial_index() {
    let pool = pool().await;
    let flows = SqlFlowStore::new(pool.clone());
    flows.save(&sample_flow()).await.expect("save flow");
    let requests = SqlRequestStore::new(pool);

    requests.insert(sample_request("r-1", "inv-1", RequestStatus::Pending)).await.expect("first");
    let error = requests
        .insert(sample_request("r-2", "inv-1", RequestStatus::InProgress))
        .await
        .expect_err("second live request for same entity");
    assert!(matches!(error, StoreError::UniqueViolation));

    // Terminal rows do not occupy the live slot.
    let mut terminal = sample_request("r-3", "inv-1", RequestStatus::Rejected);
    terminal.current_step_id = None;
    terminal.resolved_at = Some(Utc::now());
    requests.insert(terminal).await.expect("terminal row coexists");

    let live = requests
        .find_live_for_entity("invoice", "inv-1")
        .await
        .expect("find live")
        .expect("live row");
    assert_eq!(live.id, RequestId("r-1".to_string()));
}

#[tokio::test]
async fn guarded_update_rejects_stale_status() {
    let pool = pool().await;
    let flows = SqlFlowStore::new(pool.clone());
    flows.save(&sample_flow()).await.expect("save flow");
    let requests = SqlRequestStore::new(pool);

    let request =
        requests.insert(sample_request("r-1", "inv-1", RequestStatus::Pending)).await.expect("insert");

    let mut approved = request.clone();
    approved.status = RequestStatus::Approved;
    approved.current_step_id = None;
    approved.resolved_at = Some(Utc::now());
    requests.update(approved, RequestStatus::Pending).await.expect("guarded update");

    let mut stale = request.clone();
    stale.status = RequestStatus::Cancelled;
    let error = requests
        .update(stale, RequestStatus::Pending)
        .await
        .expect_err("row no longer pending");
    assert!(matches!(error, StoreError::Conflict));

    let mut missing = request;
    missing.id = RequestId("r-404".to_string());
    let error = requests
        .update(missing, RequestStatus::Pending)
        .await
        .expect_err("no such row");
    assert!(matches!(error, StoreError::NotFound));
}

#[tokio::test]
async fn older_than_listing_only_returns_live_rows_past_the_cutoff() {
    let pool = pool().await;
    let flows = SqlFlowStore::new(pool.clone());
    flows.save(&sample_flow()).await.expect("save flow");
    let requests = SqlRequestStore::new(pool);

    let mut old = sample_request("r-old", "inv-1", RequestStatus::Pending);
    old.created_at = Utc::now() - Duration::days(2);
    requests.insert(old).await.expect("old row");
    requests.insert(sample_request("r-new", "inv-2", RequestStatus::Pending)).await.expect("new row");

    let cutoff = Utc::now() - Duration::days(1);
    let aged = requests.list_live_older_than(cutoff).await.expect("list");
    assert_eq!(aged.len(), 1);
    assert_eq!(aged[0].id, RequestId("r-old".to_string()));
}

#[tokio::test]
async fn duplicate_vote_hits_the_decision_unique_key() {
    let pool = pool().await;
    let flows = SqlFlowStore::new(pool.clone());
    flows.save(&sample_flow()).await.expect("save flow");
    let requests = SqlRequestStore::new(pool.clone());
    requests.insert(sample_request("r-1", "inv-1", RequestStatus::Pending)).await.expect("insert");
    let decisions = SqlDecisionStore::new(pool);

    let vote = DecisionRecord {
        id: DecisionId("d-1".to_string()),
        request_id: RequestId("r-1".to_string()),
        step_id: StepId("s-1".to_string()),
        decided_by: "u-manager".to_string(),
        decision: DecisionKind::Approved,
        comment: None,
        decided_at: Utc::now(),
    };
    decisions.insert(vote.clone()).await.expect("first vote");

    let mut duplicate = vote;
    duplicate.id = DecisionId("d-2".to_string());
    let error = decisions.insert(duplicate).await.expect_err("same voter, same step");
    assert!(matches!(error, StoreError::UniqueViolation));

    let votes = decisions
        .list_for_step(&RequestId("r-1".to_string()), &StepId("s-1".to_string()))
        .await
        .expect("list");
    assert_eq!(votes.len(), 1);
}

#[tokio::test]
async fn delegation_queries_respect_the_active_window() {
    let pool = pool().await;
    let delegations = SqlDelegationStore::new(pool);
    let now = Utc::now();

    delegations
        .save_delegation(&Delegation {
            id: DelegationId("d-live".to_string()),
            delegator_id: "u-manager".to_string(),
            delegate_id: "u-deputy".to_string(),
            scope: DelegationScope::Role("finance".to_string()),
            starts_at: now - Duration::hours(1),
            ends_at: Some(now + Duration::days(7)),
        })
        .await
        .expect("save live");
    delegations
        .save_delegation(&Delegation {
            id: DelegationId("d-over".to_string()),
            delegator_id: "u-manager".to_string(),
            delegate_id: "u-deputy".to_string(),
            scope: DelegationScope::Step(StepId("s-1".to_string())),
            starts_at: now - Duration::days(14),
            ends_at: Some(now - Duration::days(7)),
        })
        .await
        .expect("save expired");

    let active = delegations.active_delegations_for("u-deputy", now).await.expect("query");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, DelegationId("d-live".to_string()));
    assert_eq!(active[0].scope, DelegationScope::Role("finance".to_string()));

    delegations.grant_role("u-a", "finance").await.expect("grant");
    delegations.grant_role("u-b", "finance").await.expect("grant");
    assert!(delegations.user_has_role("u-a", "finance").await.expect("query"));
    assert!(!delegations.user_has_role("u-a", "legal").await.expect("query"));
    assert_eq!(delegations.count_role_members("finance").await.expect("count"), 2);

    delegations.set_manager("u-clerk", "u-dept-head").await.expect("set");
    assert_eq!(
        delegations.manager_of("u-clerk").await.expect("query").as_deref(),
        Some("u-dept-head"),
    );
    assert!(delegations.manager_of("u-orphan").await.expect("query").is_none());
}

#[tokio::test]
async fn engine_runs_a_two_step_flow_over_sql_stores() {
    let pool = pool().await;
    let flows = Arc::new(SqlFlowStore::new(pool.clone()));
    flows.save(&sample_flow()).await.expect("save flow");
    let delegations = Arc::new(SqlDelegationStore::new(pool.clone()));
    delegations.grant_role("u-finance", "finance").await.expect("grant");

    let audit = Arc::new(SqlAuditStore::new(pool.clone()));
    let engine = ApprovalEngine::new(
        flows,
        Arc::new(SqlRequestStore::new(pool.clone())),
        Arc::new(SqlDecisionStore::new(pool.clone())),
        delegations,
        audit.clone() as Arc<dyn AuditStore>,
        Arc::new(HookRegistry::new()),
        EngineConfig::default(),
    );

    let mut context = Map::new();
    context.insert("amount".to_string(), json!(5000));
    let request = engine
        .submit("invoice", "inv-1", Context(context), "u-clerk")
        .await
        .expect("submit");
    assert_eq!(request.status, RequestStatus::Pending);

    let request = engine
        .decide(&request.id, DecisionKind::Approved, "u-manager", None)
        .await
        .expect("step one");
    assert_eq!(request.status, RequestStatus::InProgress);

    let request = engine
        .decide(&request.id, DecisionKind::Approved, "u-finance", None)
        .await
        .expect("step two");
    assert_eq!(request.status, RequestStatus::Approved);

    let trail = audit.list_for_request(&request.id).await.expect("audit");
    assert!(trail.iter().any(|entry| entry.action == "request.approved"));
}
