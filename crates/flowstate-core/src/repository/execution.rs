//! Execution store trait definition.

use flowstate_types::error::RepositoryError;
use flowstate_types::execution::{ExecutionFilter, ExecutionRecord};
use uuid::Uuid;

/// Backend-agnostic index of executions.
///
/// Holds `ExecutionRecord` summaries only; checkpoint payloads live in the
/// `CheckpointStore`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace a record by id. `created_at` of an existing record
    /// is preserved.
    fn upsert_execution(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRecord>, RepositoryError>> + Send;

    /// Records matching the filter, newest first.
    fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send;

    /// Returns `true` if the record existed.
    fn delete_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
