//! SQLite checkpoint store.
//!
//! The `(execution_id, sequence)` primary key turns a second writer on the
//! same lineage into `RepositoryError::Conflict`.

use flowstate_core::repository::CheckpointStore;
use flowstate_types::error::RepositoryError;
use flowstate_types::execution::{CheckpointRecord, Usage};
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteBackend, format_datetime, is_unique_violation, parse_datetime, parse_uuid, query_err,
    to_u64,
};

struct CheckpointRow {
    execution_id: String,
    sequence: i64,
    machine: String,
    state: String,
    context: String,
    step_count: i64,
    api_calls: i64,
    cost: f64,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            sequence: row.try_get("sequence")?,
            machine: row.try_get("machine")?,
            state: row.try_get("state")?,
            context: row.try_get("context")?,
            step_count: row.try_get("step_count")?,
            api_calls: row.try_get("api_calls")?,
            cost: row.try_get("cost")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_record(self) -> Result<CheckpointRecord, RepositoryError> {
        let context = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid checkpoint context JSON: {e}")))?;
        let step_count = u32::try_from(self.step_count)
            .map_err(|_| RepositoryError::Query(format!("invalid step_count: {}", self.step_count)))?;

        Ok(CheckpointRecord {
            execution_id: parse_uuid(&self.execution_id)?,
            machine: self.machine,
            state: self.state,
            context,
            sequence: to_u64(self.sequence, "sequence")?,
            step_count,
            usage: Usage::new(to_u64(self.api_calls, "api_calls")?, self.cost),
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<CheckpointRecord, RepositoryError> {
    CheckpointRow::from_row(row).map_err(query_err)?.into_record()
}

impl CheckpointStore for SqliteBackend {
    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        let context = serde_json::to_string(&record.context).map_err(query_err)?;

        let result = sqlx::query(
            r#"INSERT INTO checkpoints
               (execution_id, sequence, machine, state, context, step_count, api_calls, cost, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.execution_id.to_string())
        .bind(record.sequence as i64)
        .bind(&record.machine)
        .bind(&record.state)
        .bind(context)
        .bind(i64::from(record.step_count))
        .bind(record.usage.api_calls as i64)
        .bind(record.usage.cost)
        .bind(format_datetime(&record.created_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Conflict(format!(
                "checkpoint {} of execution {} already exists",
                record.sequence, record.execution_id
            ))),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn load_latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE execution_id = ? ORDER BY sequence DESC LIMIT 1",
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.as_ref().map(decode).transpose()
    }

    async fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM checkpoints WHERE execution_id = ? ORDER BY sequence ASC")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter().map(decode).collect()
    }

    async fn delete_checkpoints(&self, execution_id: &Uuid) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
