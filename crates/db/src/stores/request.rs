use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;

use flowgate_core::{
    ApprovalRequest, Context, FlowId, RequestId, RequestStatus, RequestStore, StepId, StoreError,
};

use super::{col, map_sqlx, parse_json_object, parse_timestamp};
use crate::DbPool;

pub struct SqlRequestStore {
    pool: DbPool,
}

impl SqlRequestStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const REQUEST_COLUMNS: &str = "id, entity_type, entity_id, flow_id, status, current_step_id,
     context, requested_by, resolution_note, escalated_to_user_id, created_at, resolved_at";

fn row_to_request(row: &SqliteRow) -> Result<ApprovalRequest, StoreError> {
    let status_raw: String = col(row, "status")?;
    let status = RequestStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("status {status_raw:?}")))?;
    let context_raw: String = col(row, "context")?;
    let created_at_raw: String = col(row, "created_at")?;
    let resolved_at_raw: Option<String> = col(row, "resolved_at")?;

    Ok(ApprovalRequest {
        id: RequestId(col(row, "id")?),
        entity_type: col(row, "entity_type")?,
        entity_id: col(row, "entity_id")?,
        flow_id: FlowId(col(row, "flow_id")?),
        status,
        current_step_id: col::<Option<String>>(row, "current_step_id")?.map(StepId),
        context: Context(parse_json_object(&context_raw)?),
        requested_by: col(row, "requested_by")?,
        resolution_note: col(row, "resolution_note")?,
        escalated_to_user_id: col(row, "escalated_to_user_id")?,
        created_at: parse_timestamp(&created_at_raw)?,
        resolved_at: resolved_at_raw.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn live_status_list() -> String {
    RequestStatus::LIVE
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl RequestStore for SqlRequestStore {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(row_to_request).transpose()
    }

    async fn find_live_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request
             WHERE entity_type = ? AND entity_id = ? AND status IN ({})",
            live_status_list(),
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(row_to_request).transpose()
    }

    async fn insert(&self, request: ApprovalRequest) -> Result<ApprovalRequest, StoreError> {
        sqlx::query(
            "INSERT INTO approval_request (id, entity_type, entity_id, flow_id, status,
                                           current_step_id, context, requested_by,
                                           resolution_note, escalated_to_user_id,
                                           created_at, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(&request.entity_type)
        .bind(&request.entity_id)
        .bind(&request.flow_id.0)
        .bind(request.status.as_str())
        .bind(request.current_step_id.as_ref().map(|id| id.0.clone()))
        .bind(serde_json::Value::Object(request.context.0.clone()).to_string())
        .bind(&request.requested_by)
        .bind(&request.resolution_note)
        .bind(&request.escalated_to_user_id)
        .bind(request.created_at.to_rfc3339())
        .bind(request.resolved_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(request)
    }

    async fn update(
        &self,
        request: ApprovalRequest,
        expected_status: RequestStatus,
    ) -> Result<ApprovalRequest, StoreError> {
        let result = sqlx::query(
            "UPDATE approval_request
             SET status = ?, current_step_id = ?, context = ?, resolution_note = ?,
                 escalated_to_user_id = ?, resolved_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(request.status.as_str())
        .bind(request.current_step_id.as_ref().map(|id| id.0.clone()))
        .bind(serde_json::Value::Object(request.context.0.clone()).to_string())
        .bind(&request.resolution_note)
        .bind(&request.escalated_to_user_id)
        .bind(request.resolved_at.map(|dt| dt.to_rfc3339()))
        .bind(&request.id.0)
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM approval_request WHERE id = ?")
                .bind(&request.id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
            return Err(if exists.is_some() { StoreError::Conflict } else { StoreError::NotFound });
        }

        Ok(request)
    }

    async fn list_live_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request
             WHERE status IN ({}) AND created_at < ?
             ORDER BY created_at",
            live_status_list(),
        ))
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_request).collect()
    }
}
