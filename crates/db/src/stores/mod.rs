//! Durable implementations of the engine's store traits. All writes
//! that the engine relies on for correctness are constraint-backed:
//! the partial unique index closes the double-submit race, the
//! decision table's unique key closes the double-vote race, and
//! status-guarded updates close concurrent transitions.

use chrono::{DateTime, Utc};
use flowgate_core::StoreError;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub mod audit;
pub mod decision;
pub mod delegation;
pub mod flow;
pub mod request;

pub use audit::SqlAuditStore;
pub use decision::SqlDecisionStore;
pub use delegation::SqlDelegationStore;
pub use flow::SqlFlowStore;
pub use request::SqlRequestStore;

fn map_sqlx(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation,
        _ => StoreError::Database(error.to_string()),
    }
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(|e| StoreError::Decode(format!("{name}: {e}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("timestamp {raw:?}: {e}")))
}

fn parse_json_object(raw: &str) -> Result<serde_json::Map<String, Value>, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Decode(format!("json object: {e}")))
}
