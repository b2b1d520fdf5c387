use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use flowgate_core::{
    Delegation, DelegationId, DelegationScope, DelegationStore, StepId, StoreError,
};

use super::{col, map_sqlx, parse_timestamp};
use crate::DbPool;

pub struct SqlDelegationStore {
    pool: DbPool,
}

impl SqlDelegationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn save_delegation(&self, delegation: &Delegation) -> Result<(), StoreError> {
        let (scope_kind, scope_value) = match &delegation.scope {
            DelegationScope::Role(role) => ("role", role.clone()),
            DelegationScope::Step(step_id) => ("step", step_id.0.clone()),
        };
        sqlx::query(
            "INSERT INTO delegation (id, delegator_id, delegate_id, scope_kind,
                                     scope_value, starts_at, ends_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 delegator_id = excluded.delegator_id,
                 delegate_id = excluded.delegate_id,
                 scope_kind = excluded.scope_kind,
                 scope_value = excluded.scope_value,
                 starts_at = excluded.starts_at,
                 ends_at = excluded.ends_at",
        )
        .bind(&delegation.id.0)
        .bind(&delegation.delegator_id)
        .bind(&delegation.delegate_id)
        .bind(scope_kind)
        .bind(scope_value)
        .bind(delegation.starts_at.to_rfc3339())
        .bind(delegation.ends_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn grant_role(&self, user_id: &str, role: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO role_member (role, user_id) VALUES (?, ?)")
            .bind(role)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn set_manager(&self, user_id: &str, manager_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO org_hierarchy (user_id, manager_id) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET manager_id = excluded.manager_id",
        )
        .bind(user_id)
        .bind(manager_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

fn row_to_delegation(row: &SqliteRow) -> Result<Delegation, StoreError> {
    let scope_kind: String = col(row, "scope_kind")?;
    let scope_value: String = col(row, "scope_value")?;
    let scope = match scope_kind.as_str() {
        "role" => DelegationScope::Role(scope_value),
        "step" => DelegationScope::Step(StepId(scope_value)),
        other => return Err(StoreError::Decode(format!("scope_kind {other:?}"))),
    };
    let starts_at_raw: String = col(row, "starts_at")?;
    let ends_at_raw: Option<String> = col(row, "ends_at")?;

    Ok(Delegation {
        id: DelegationId(col(row, "id")?),
        delegator_id: col(row, "delegator_id")?,
        delegate_id: col(row, "delegate_id")?,
        scope,
        starts_at: parse_timestamp(&starts_at_raw)?,
        ends_at: ends_at_raw.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[async_trait]
impl DelegationStore for SqlDelegationStore {
    async fn active_delegations_for(
        &self,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Delegation>, StoreError> {
        let at_str = at.to_rfc3339();
        let rows = sqlx::query(
            "SELECT id, delegator_id, delegate_id, scope_kind, scope_value, starts_at, ends_at
             FROM delegation
             WHERE delegate_id = ? AND starts_at <= ?
               AND (ends_at IS NULL OR ends_at > ?)",
        )
        .bind(delegate_id)
        .bind(&at_str)
        .bind(&at_str)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_delegation).collect()
    }

    async fn user_has_role(&self, user_id: &str, role: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM role_member WHERE role = ? AND user_id = ?")
            .bind(role)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }

    async fn count_role_members(&self, role: &str) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM role_member WHERE role = ?")
            .bind(role)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let count: i64 = row.try_get("count").map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(count as u32)
    }

    async fn manager_of(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT manager_id FROM org_hierarchy WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.map(|row| col(&row, "manager_id")).transpose()
    }
}
