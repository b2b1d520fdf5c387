use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;

use flowgate_core::{
    DecisionId, DecisionKind, DecisionRecord, DecisionStore, RequestId, StepId, StoreError,
};

use super::{col, map_sqlx, parse_timestamp};
use crate::DbPool;

pub struct SqlDecisionStore {
    pool: DbPool,
}

impl SqlDecisionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_decision(row: &SqliteRow) -> Result<DecisionRecord, StoreError> {
    let decision_raw: String = col(row, "decision")?;
    let decision = DecisionKind::parse(&decision_raw)
        .ok_or_else(|| StoreError::Decode(format!("decision {decision_raw:?}")))?;
    let decided_at_raw: String = col(row, "decided_at")?;

    Ok(DecisionRecord {
        id: DecisionId(col(row, "id")?),
        request_id: RequestId(col(row, "request_id")?),
        step_id: StepId(col(row, "step_id")?),
        decided_by: col(row, "decided_by")?,
        decision,
        comment: col(row, "comment")?,
        decided_at: parse_timestamp(&decided_at_raw)?,
    })
}

#[async_trait]
impl DecisionStore for SqlDecisionStore {
    async fn insert(&self, decision: DecisionRecord) -> Result<DecisionRecord, StoreError> {
        sqlx::query(
            "INSERT INTO approval_decision (id, request_id, step_id, decided_by,
                                            decision, comment, decided_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.id.0)
        .bind(&decision.request_id.0)
        .bind(&decision.step_id.0)
        .bind(&decision.decided_by)
        .bind(decision.decision.as_str())
        .bind(&decision.comment)
        .bind(decision.decided_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(decision)
    }

    async fn list_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, request_id, step_id, decided_by, decision, comment, decided_at
             FROM approval_decision WHERE request_id = ? ORDER BY decided_at, rowid",
        )
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_decision).collect()
    }

    async fn list_for_step(
        &self,
        request_id: &RequestId,
        step_id: &StepId,
    ) -> Result<Vec<DecisionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, request_id, step_id, decided_by, decision, comment, decided_at
             FROM approval_decision
             WHERE request_id = ? AND step_id = ? ORDER BY decided_at, rowid",
        )
        .bind(&request_id.0)
        .bind(&step_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_decision).collect()
    }
}
