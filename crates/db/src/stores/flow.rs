use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;

use flowgate_core::{
    ApprovalFlow, ApprovalStep, ApproverType, ConditionSet, FlowId, FlowStore, StepId, StoreError,
};

use super::{col, map_sqlx, parse_json_object};
use crate::DbPool;

pub struct SqlFlowStore {
    pool: DbPool,
}

impl SqlFlowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Upserts a flow definition together with its steps. Configuration
    /// writes happen out-of-band of the engine, so this replaces the
    /// step list wholesale.
    pub async fn save(&self, flow: &ApprovalFlow) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(
            "INSERT INTO approval_flow (id, name, entity_type, trigger_conditions,
                                        auto_approve_below, amount_field, priority,
                                        is_active, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 entity_type = excluded.entity_type,
                 trigger_conditions = excluded.trigger_conditions,
                 auto_approve_below = excluded.auto_approve_below,
                 amount_field = excluded.amount_field,
                 priority = excluded.priority,
                 is_active = excluded.is_active",
        )
        .bind(&flow.id.0)
        .bind(&flow.name)
        .bind(&flow.entity_type)
        .bind(serde_json::Value::Object(flow.trigger_conditions.raw().clone()).to_string())
        .bind(flow.auto_approve_below.map(|d| d.to_string()))
        .bind(&flow.amount_field)
        .bind(flow.priority)
        .bind(flow.is_active)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query("DELETE FROM approval_step WHERE flow_id = ?")
            .bind(&flow.id.0)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        for step in &flow.steps {
            sqlx::query(
                "INSERT INTO approval_step (id, flow_id, step_order, approver_type,
                                            approver_user_id, approver_role_name,
                                            requires_all, min_approvals, skip_conditions,
                                            escalation_step_id, escalation_user_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.id.0)
            .bind(&flow.id.0)
            .bind(step.step_order)
            .bind(step.approver_type.as_str())
            .bind(&step.approver_user_id)
            .bind(&step.approver_role_name)
            .bind(step.requires_all)
            .bind(step.min_approvals)
            .bind(serde_json::Value::Object(step.skip_conditions.raw().clone()).to_string())
            .bind(step.escalation_step_id.as_ref().map(|id| id.0.clone()))
            .bind(&step.escalation_user_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)
    }

    async fn steps_for(&self, flow_id: &FlowId) -> Result<Vec<ApprovalStep>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, flow_id, step_order, approver_type, approver_user_id,
                    approver_role_name, requires_all, min_approvals, skip_conditions,
                    escalation_step_id, escalation_user_id
             FROM approval_step WHERE flow_id = ? ORDER BY step_order",
        )
        .bind(&flow_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_step).collect()
    }
}

fn row_to_step(row: &SqliteRow) -> Result<ApprovalStep, StoreError> {
    let approver_type_raw: String = col(row, "approver_type")?;
    let approver_type = ApproverType::parse(&approver_type_raw)
        .ok_or_else(|| StoreError::Decode(format!("approver_type {approver_type_raw:?}")))?;
    let skip_raw: String = col(row, "skip_conditions")?;

    Ok(ApprovalStep {
        id: StepId(col(row, "id")?),
        flow_id: FlowId(col(row, "flow_id")?),
        step_order: col::<i64>(row, "step_order")? as u32,
        approver_type,
        approver_user_id: col(row, "approver_user_id")?,
        approver_role_name: col(row, "approver_role_name")?,
        requires_all: col(row, "requires_all")?,
        min_approvals: col::<i64>(row, "min_approvals")? as u32,
        skip_conditions: ConditionSet::parse(parse_json_object(&skip_raw)?),
        escalation_step_id: col::<Option<String>>(row, "escalation_step_id")?.map(StepId),
        escalation_user_id: col(row, "escalation_user_id")?,
    })
}

fn row_to_flow(row: &SqliteRow, steps: Vec<ApprovalStep>) -> Result<ApprovalFlow, StoreError> {
    let trigger_raw: String = col(row, "trigger_conditions")?;
    let auto_raw: Option<String> = col(row, "auto_approve_below")?;
    let auto_approve_below = match auto_raw {
        Some(raw) => Some(
            raw.parse::<Decimal>()
                .map_err(|e| StoreError::Decode(format!("auto_approve_below {raw:?}: {e}")))?,
        ),
        None => None,
    };

    Ok(ApprovalFlow {
        id: FlowId(col(row, "id")?),
        name: col(row, "name")?,
        entity_type: col(row, "entity_type")?,
        trigger_conditions: ConditionSet::parse(parse_json_object(&trigger_raw)?),
        auto_approve_below,
        amount_field: col(row, "amount_field")?,
        priority: col::<i64>(row, "priority")? as i32,
        is_active: col(row, "is_active")?,
        steps,
    })
}

#[async_trait]
impl FlowStore for SqlFlowStore {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, entity_type, trigger_conditions, auto_approve_below,
                    amount_field, priority, is_active
             FROM approval_flow WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => {
                let steps = self.steps_for(id).await?;
                Ok(Some(row_to_flow(&row, steps)?))
            }
            None => Ok(None),
        }
    }

    async fn list_active_for_entity(
        &self,
        entity_type: &str,
    ) -> Result<Vec<ApprovalFlow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, entity_type, trigger_conditions, auto_approve_below,
                    amount_field, priority, is_active
             FROM approval_flow WHERE entity_type = ? AND is_active = 1",
        )
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut flows = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = FlowId(col(row, "id")?);
            let steps = self.steps_for(&id).await?;
            flows.push(row_to_flow(row, steps)?);
        }
        Ok(flows)
    }
}
