//! Checkpoint manager: the engine-facing side of the persistence protocol.
//!
//! Wraps a `CheckpointStore` and turns an `Execution` into an immutable
//! `CheckpointRecord` meaning "about to enter `state` with `context`". Records
//! are only ever appended; resume reads the highest sequence.

use std::sync::Arc;

use chrono::Utc;
use flowstate_types::error::RepositoryError;
use flowstate_types::execution::{CheckpointRecord, Execution};
use serde_json::Value;
use uuid::Uuid;

use super::context::{context_size, MAX_CONTEXT_SIZE};
use crate::repository::CheckpointStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `S: CheckpointStore` so it works with any storage backend.
pub struct CheckpointManager<S: CheckpointStore> {
    store: Arc<S>,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Persist a checkpoint of `execution` at `sequence`.
    ///
    /// Fails with `CheckpointError::Conflict` if another runner already wrote
    /// that sequence for the same execution.
    pub async fn save(
        &self,
        execution: &Execution,
        sequence: u64,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let size = context_size(&execution.context);
        if size > MAX_CONTEXT_SIZE {
            return Err(CheckpointError::SnapshotTooLarge {
                size,
                max: MAX_CONTEXT_SIZE,
            });
        }

        let record = CheckpointRecord {
            execution_id: execution.id,
            machine: execution.machine.clone(),
            state: execution.current_state.clone(),
            context: Value::Object(execution.context.clone()),
            sequence,
            step_count: execution.steps,
            usage: execution.usage,
            created_at: Utc::now(),
        };

        self.store
            .save_checkpoint(&record)
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(_) => CheckpointError::Conflict {
                    execution_id: execution.id,
                    sequence,
                },
                other => CheckpointError::Repository(other.to_string()),
            })?;

        tracing::debug!(
            execution_id = %execution.id,
            state = execution.current_state.as_str(),
            sequence,
            size,
            "checkpoint saved"
        );

        Ok(record)
    }

    pub async fn load_latest(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        self.store
            .load_latest_checkpoint(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Full lineage, oldest first.
    pub async fn history(&self, execution_id: Uuid) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        self.store
            .list_checkpoints(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn discard(&self, execution_id: Uuid) -> Result<u64, CheckpointError> {
        self.store
            .delete_checkpoints(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// Another runner already wrote this sequence (single-writer violation).
    #[error("checkpoint {sequence} of execution {execution_id} already exists")]
    Conflict { execution_id: Uuid, sequence: u64 },

    #[error("context snapshot is {size} bytes, limit is {max}")]
    SnapshotTooLarge { size: usize, max: usize },

    /// A stored snapshot cannot be turned back into a context.
    #[error("corrupt checkpoint for execution {execution_id}: {message}")]
    Corrupt { execution_id: Uuid, message: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryBackend;
    use flowstate_types::execution::{ExecutionStatus, Usage};
    use flowstate_types::machine::Mapping;
    use serde_json::json;

    fn execution(state: &str) -> Execution {
        let now = Utc::now();
        let mut context = Mapping::new();
        context.insert("result".to_string(), json!("H"));
        Execution {
            id: Uuid::now_v7(),
            machine: "char_build".to_string(),
            current_state: state.to_string(),
            context,
            status: ExecutionStatus::Running,
            parent_id: None,
            launched_by: None,
            steps: 1,
            attempt: 1,
            usage: Usage::new(1, 0.0),
            sequence: None,
            output: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_then_load_latest() {
        let manager = CheckpointManager::new(Arc::new(InMemoryBackend::new()));
        let mut exec = execution("append");
        manager.save(&exec, 0).await.unwrap();
        exec.current_state = "check".to_string();
        exec.steps = 2;
        manager.save(&exec, 1).await.unwrap();

        let latest = manager.load_latest(exec.id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 1);
        assert_eq!(latest.state, "check");
        assert_eq!(latest.step_count, 2);
        assert_eq!(latest.context["result"], "H");
        assert_eq!(manager.history(exec.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_sequence_maps_to_conflict() {
        let manager = CheckpointManager::new(Arc::new(InMemoryBackend::new()));
        let exec = execution("append");
        manager.save(&exec, 0).await.unwrap();
        let err = manager.save(&exec, 0).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Conflict { sequence: 0, .. }));
    }

    #[tokio::test]
    async fn oversized_snapshot_is_rejected() {
        let manager = CheckpointManager::new(Arc::new(InMemoryBackend::new()));
        let mut exec = execution("append");
        exec.context
            .insert("blob".to_string(), json!("x".repeat(MAX_CONTEXT_SIZE + 1)));
        let err = manager.save(&exec, 0).await.unwrap_err();
        assert!(matches!(err, CheckpointError::SnapshotTooLarge { .. }));
        assert!(manager.load_latest(exec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discard_removes_lineage() {
        let manager = CheckpointManager::new(Arc::new(InMemoryBackend::new()));
        let exec = execution("append");
        manager.save(&exec, 0).await.unwrap();
        assert_eq!(manager.discard(exec.id).await.unwrap(), 1);
        assert!(manager.history(exec.id).await.unwrap().is_empty());
    }
}
