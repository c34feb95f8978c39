//! Checkpoint store trait definition.

use flowstate_types::error::RepositoryError;
use flowstate_types::execution::CheckpointRecord;
use uuid::Uuid;

/// Append-only store of checkpoint records keyed by execution id.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint.
    ///
    /// Must fail with `RepositoryError::Conflict` when a record with the same
    /// `(execution_id, sequence)` already exists, so that two runners can
    /// never interleave writes into one lineage.
    fn save_checkpoint(
        &self,
        record: &CheckpointRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// The checkpoint with the highest sequence number, if any.
    fn load_latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send;

    /// Full lineage in ascending sequence order.
    fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<CheckpointRecord>, RepositoryError>> + Send;

    /// Delete every checkpoint of an execution. Returns how many were removed.
    fn delete_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
