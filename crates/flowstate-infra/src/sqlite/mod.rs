//! SQLite storage for Flowstate.
//!
//! One [`SqliteBackend`] implements every storage port of `flowstate-core`
//! over a shared [`DatabasePool`]: the checkpoint lineage, the result
//! backend, and the execution index.

pub mod checkpoint;
pub mod execution;
pub mod pool;
pub mod result;

use chrono::{DateTime, SecondsFormat, Utc};
use flowstate_core::repository::Backend;
use flowstate_types::error::RepositoryError;
use uuid::Uuid;

pub use pool::DatabasePool;

/// SQLite-backed implementation of all storage ports.
#[derive(Clone, Debug)]
pub struct SqliteBackend {
    pool: DatabasePool,
}

impl SqliteBackend {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open (and migrate) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = DatabasePool::new(database_url).await.map_err(|e| {
            tracing::error!(database_url, error = %e, "failed to open sqlite database");
            RepositoryError::Connection
        })?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn query_err(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE"))
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse()
        .map_err(|e| RepositoryError::Query(format!("invalid uuid '{s}': {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so that text comparison in SQL orders by time.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_u64(value: i64, column: &str) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| RepositoryError::Query(format!("negative {column}: {value}")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Fresh migrated database in a temp dir. The dir guard must outlive the
    /// backend.
    pub async fn test_backend() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteBackend::new(pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatted_datetimes_sort_chronologically() {
        let a = DateTime::parse_from_rfc3339("2026-01-01T00:00:09Z").unwrap().with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2026-01-01T00:00:10.5Z").unwrap().with_timezone(&Utc);
        assert!(format_datetime(&a) < format_datetime(&b));
        assert_eq!(parse_datetime(&format_datetime(&b)).unwrap(), b);
    }

    #[tokio::test]
    async fn backend_reports_its_name() {
        let (_dir, backend) = test_support::test_backend().await;
        assert_eq!(backend.name(), "sqlite");
    }

    #[tokio::test]
    async fn connect_fails_for_unreachable_path() {
        let err = SqliteBackend::connect("sqlite:///nonexistent-dir/deeper/flow.db")
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Connection));
    }
}
