//! SQLite result backend. Values are written once and never overwritten.

use chrono::Utc;
use flowstate_core::repository::ResultBackend;
use flowstate_types::error::RepositoryError;
use serde_json::Value;
use sqlx::Row;

use super::{SqliteBackend, format_datetime, query_err};

impl ResultBackend for SqliteBackend {
    async fn write_result(&self, key: &str, value: &Value) -> Result<bool, RepositoryError> {
        let json = serde_json::to_string(value).map_err(query_err)?;

        let result = sqlx::query(
            "INSERT INTO results (key, value, created_at) VALUES (?, ?, ?) ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(json)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        let written = result.rows_affected() > 0;
        if !written {
            tracing::debug!(key, "result already present, keeping existing value");
        }
        Ok(written)
    }

    async fn read_result(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        let row = sqlx::query("SELECT value FROM results WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value").map_err(query_err)?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| RepositoryError::Query(format!("invalid result JSON: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn delete_result(&self, key: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM results WHERE key = ?")
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_support::test_backend;
    use flowstate_core::repository::result_key;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn first_write_wins() {
        let (_dir, backend) = test_backend().await;
        let key = result_key("flowstate", &Uuid::now_v7());

        assert!(backend.write_result(&key, &json!({ "success": true, "n": 1 })).await.unwrap());
        assert!(!backend.write_result(&key, &json!({ "success": true, "n": 2 })).await.unwrap());

        let stored = backend.read_result(&key).await.unwrap().unwrap();
        assert_eq!(stored["n"], 1);
    }

    #[tokio::test]
    async fn missing_key_reads_none() {
        let (_dir, backend) = test_backend().await;
        assert!(backend.read_result("flowstate://nothing/result").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let (_dir, backend) = test_backend().await;
        let key = result_key("flowstate", &Uuid::now_v7());
        backend.write_result(&key, &json!("done")).await.unwrap();

        assert!(backend.delete_result(&key).await.unwrap());
        assert!(!backend.delete_result(&key).await.unwrap());
        assert!(backend.read_result(&key).await.unwrap().is_none());
    }
}
