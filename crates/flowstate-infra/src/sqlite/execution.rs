//! SQLite execution index.

use flowstate_core::repository::ExecutionStore;
use flowstate_types::error::RepositoryError;
use flowstate_types::execution::{ExecutionFilter, ExecutionRecord, ExecutionStatus};
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use super::{SqliteBackend, format_datetime, parse_datetime, parse_uuid, query_err, to_u64};

/// Internal row type for mapping SQLite rows to `ExecutionRecord`.
struct ExecutionRow {
    id: String,
    machine: String,
    status: String,
    current_state: String,
    parent_id: Option<String>,
    launched_by: Option<String>,
    attempts: i64,
    error_type: Option<String>,
    error: Option<String>,
    total_api_calls: i64,
    total_cost: f64,
    created_at: String,
    updated_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            machine: row.try_get("machine")?,
            status: row.try_get("status")?,
            current_state: row.try_get("current_state")?,
            parent_id: row.try_get("parent_id")?,
            launched_by: row.try_get("launched_by")?,
            attempts: row.try_get("attempts")?,
            error_type: row.try_get("error_type")?,
            error: row.try_get("error")?,
            total_api_calls: row.try_get("total_api_calls")?,
            total_cost: row.try_get("total_cost")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord, RepositoryError> {
        let status: ExecutionStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| RepositoryError::Query(format!("invalid attempts: {}", self.attempts)))?;

        Ok(ExecutionRecord {
            id: parse_uuid(&self.id)?,
            machine: self.machine,
            status,
            current_state: self.current_state,
            parent_id: self.parent_id.as_deref().map(parse_uuid).transpose()?,
            launched_by: self.launched_by.as_deref().map(parse_uuid).transpose()?,
            attempts,
            error_type: self.error_type,
            error: self.error,
            total_api_calls: to_u64(self.total_api_calls, "total_api_calls")?,
            total_cost: self.total_cost,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionRecord, RepositoryError> {
    ExecutionRow::from_row(row).map_err(query_err)?.into_record()
}

impl ExecutionStore for SqliteBackend {
    async fn upsert_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO executions
               (id, machine, status, current_state, parent_id, launched_by, attempts,
                error_type, error, total_api_calls, total_cost, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   machine = excluded.machine,
                   status = excluded.status,
                   current_state = excluded.current_state,
                   parent_id = excluded.parent_id,
                   launched_by = excluded.launched_by,
                   attempts = excluded.attempts,
                   error_type = excluded.error_type,
                   error = excluded.error,
                   total_api_calls = excluded.total_api_calls,
                   total_cost = excluded.total_cost,
                   updated_at = excluded.updated_at"#,
        )
        .bind(record.id.to_string())
        .bind(&record.machine)
        .bind(record.status.as_str())
        .bind(&record.current_state)
        .bind(record.parent_id.map(|id| id.to_string()))
        .bind(record.launched_by.map(|id| id.to_string()))
        .bind(i64::from(record.attempts))
        .bind(&record.error_type)
        .bind(&record.error)
        .bind(record.total_api_calls as i64)
        .bind(record.total_cost)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(decode).transpose()
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM executions WHERE 1 = 1");

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(machine) = &filter.machine {
            query.push(" AND machine = ").push_bind(machine.clone());
        }
        if let Some(parent_id) = filter.parent_id {
            query.push(" AND parent_id = ").push_bind(parent_id.to_string());
        }
        if let Some(before) = filter.updated_before {
            query.push(" AND updated_at < ").push_bind(format_datetime(&before));
        }
        if filter.terminal_only {
            query.push(" AND status != 'running'");
        }

        query.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = query
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter().map(decode).collect()
    }

    async fn delete_execution(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
