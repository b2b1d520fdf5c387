use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;

use flowgate_core::{AuditEntry, AuditStore, RequestId, StoreError};

use super::{col, map_sqlx, parse_json_object, parse_timestamp};
use crate::DbPool;

pub struct SqlAuditStore {
    pool: DbPool,
}

impl SqlAuditStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<AuditEntry, StoreError> {
    let metadata_raw: String = col(row, "metadata")?;
    let metadata = parse_json_object(&metadata_raw)?.into_iter().collect();
    let occurred_at_raw: String = col(row, "occurred_at")?;

    Ok(AuditEntry {
        entry_id: col(row, "entry_id")?,
        request_id: col::<Option<String>>(row, "request_id")?.map(RequestId),
        actor: col(row, "actor")?,
        action: col(row, "action")?,
        detail: col(row, "detail")?,
        metadata,
        occurred_at: parse_timestamp(&occurred_at_raw)?,
    })
}

#[async_trait]
impl AuditStore for SqlAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let metadata: serde_json::Map<String, serde_json::Value> =
            entry.metadata.clone().into_iter().collect();
        sqlx::query(
            "INSERT INTO audit_log (entry_id, request_id, actor, action, detail,
                                    metadata, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.entry_id)
        .bind(entry.request_id.as_ref().map(|id| id.0.clone()))
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.detail)
        .bind(serde_json::Value::Object(metadata).to_string())
        .bind(entry.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT entry_id, request_id, actor, action, detail, metadata, occurred_at
             FROM audit_log WHERE request_id = ? ORDER BY occurred_at, rowid",
        )
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_entry).collect()
    }
}
