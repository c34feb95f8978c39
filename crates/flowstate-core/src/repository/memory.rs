//! In-memory storage backend.
//!
//! Keeps checkpoints, results, and execution records in process-local
//! `DashMap`s. State is lost when the process exits, which makes it the
//! backend of choice for tests and for machines with persistence disabled.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowstate_types::error::RepositoryError;
use flowstate_types::execution::{CheckpointRecord, ExecutionFilter, ExecutionRecord};
use serde_json::Value;
use uuid::Uuid;

use super::{Backend, CheckpointStore, ExecutionStore, ResultBackend};

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    checkpoints: DashMap<Uuid, Vec<CheckpointRecord>>,
    results: DashMap<String, Value>,
    executions: DashMap<Uuid, ExecutionRecord>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

impl CheckpointStore for InMemoryBackend {
    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        let mut lineage = self.checkpoints.entry(record.execution_id).or_default();
        if lineage.iter().any(|c| c.sequence == record.sequence) {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} already exists for execution {}",
                record.sequence, record.execution_id
            )));
        }
        lineage.push(record.clone());
        lineage.sort_by_key(|c| c.sequence);
        Ok(())
    }

    async fn load_latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        Ok(self
            .checkpoints
            .get(execution_id)
            .and_then(|lineage| lineage.last().cloned()))
    }

    async fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        Ok(self
            .checkpoints
            .get(execution_id)
            .map(|lineage| lineage.clone())
            .unwrap_or_default())
    }

    async fn delete_checkpoints(&self, execution_id: &Uuid) -> Result<u64, RepositoryError> {
        Ok(self
            .checkpoints
            .remove(execution_id)
            .map(|(_, lineage)| lineage.len() as u64)
            .unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// ResultBackend
// ---------------------------------------------------------------------------

impl ResultBackend for InMemoryBackend {
    async fn write_result(&self, key: &str, value: &Value) -> Result<bool, RepositoryError> {
        match self.results.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
                Ok(true)
            }
        }
    }

    async fn read_result(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        Ok(self.results.get(key).map(|v| v.value().clone()))
    }

    async fn delete_result(&self, key: &str) -> Result<bool, RepositoryError> {
        Ok(self.results.remove(key).is_some())
    }
}

// ---------------------------------------------------------------------------
// ExecutionStore
// ---------------------------------------------------------------------------

impl ExecutionStore for InMemoryBackend {
    async fn upsert_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let mut incoming = record.clone();
        if let Some(existing) = self.executions.get(&record.id) {
            incoming.created_at = existing.created_at;
        }
        self.executions.insert(record.id, incoming);
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        Ok(self.executions.get(id).map(|r| r.value().clone()))
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit as usize);
        }
        Ok(records)
    }

    async fn delete_execution(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.executions.remove(id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowstate_types::execution::{ExecutionStatus, Usage};
    use serde_json::json;

    fn checkpoint(execution_id: Uuid, sequence: u64, state: &str) -> CheckpointRecord {
        CheckpointRecord {
            execution_id,
            machine: "char_build".to_string(),
            state: state.to_string(),
            context: json!({ "result": "" }),
            sequence,
            step_count: sequence as u32,
            usage: Usage::default(),
            created_at: Utc::now(),
        }
    }

    fn record(machine: &str, status: ExecutionStatus) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            id: Uuid::now_v7(),
            machine: machine.to_string(),
            status,
            current_state: "start".to_string(),
            parent_id: None,
            launched_by: None,
            attempts: 1,
            error_type: None,
            error: None,
            total_api_calls: 0,
            total_cost: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn latest_checkpoint_is_highest_sequence() {
        let backend = InMemoryBackend::new();
        let id = Uuid::now_v7();
        backend.save_checkpoint(&checkpoint(id, 0, "start")).await.unwrap();
        backend.save_checkpoint(&checkpoint(id, 2, "done")).await.unwrap();
        backend.save_checkpoint(&checkpoint(id, 1, "middle")).await.unwrap();

        let latest = backend.load_latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.state, "done");

        let lineage = backend.list_checkpoints(&id).await.unwrap();
        let sequences: Vec<u64> = lineage.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn duplicate_sequence_is_conflict() {
        let backend = InMemoryBackend::new();
        let id = Uuid::now_v7();
        backend.save_checkpoint(&checkpoint(id, 0, "start")).await.unwrap();
        let err = backend
            .save_checkpoint(&checkpoint(id, 0, "start"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_checkpoints_reports_count() {
        let backend = InMemoryBackend::new();
        let id = Uuid::now_v7();
        backend.save_checkpoint(&checkpoint(id, 0, "a")).await.unwrap();
        backend.save_checkpoint(&checkpoint(id, 1, "b")).await.unwrap();
        assert_eq!(backend.delete_checkpoints(&id).await.unwrap(), 2);
        assert_eq!(backend.delete_checkpoints(&id).await.unwrap(), 0);
        assert!(backend.load_latest_checkpoint(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn results_are_write_once() {
        let backend = InMemoryBackend::new();
        assert!(backend.write_result("k", &json!({"v": 1})).await.unwrap());
        assert!(!backend.write_result("k", &json!({"v": 2})).await.unwrap());
        assert_eq!(
            backend.read_result("k").await.unwrap(),
            Some(json!({"v": 1}))
        );
        assert!(backend.delete_result("k").await.unwrap());
        assert!(backend.read_result("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_preserves_created_at() {
        let backend = InMemoryBackend::new();
        let mut rec = record("triage", ExecutionStatus::Running);
        backend.upsert_execution(&rec).await.unwrap();
        let original = rec.created_at;

        rec.status = ExecutionStatus::Succeeded;
        rec.created_at = original + chrono::Duration::seconds(30);
        backend.upsert_execution(&rec).await.unwrap();

        let stored = backend.get_execution(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Succeeded);
        assert_eq!(stored.created_at, original);
    }

    #[tokio::test]
    async fn list_filters_and_limits() {
        let backend = InMemoryBackend::new();
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            ExecutionStatus::Failed,
        ] {
            backend.upsert_execution(&record("triage", status)).await.unwrap();
        }
        backend
            .upsert_execution(&record("other", ExecutionStatus::Failed))
            .await
            .unwrap();

        let failed = backend
            .list_executions(
                &ExecutionFilter::default()
                    .with_status(ExecutionStatus::Failed)
                    .with_machine("triage"),
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);

        let limited = backend
            .list_executions(&ExecutionFilter::default().with_limit(3))
            .await
            .unwrap();
        assert_eq!(limited.len(), 3);
    }

    #[tokio::test]
    async fn delete_execution_reports_presence() {
        let backend = InMemoryBackend::new();
        let rec = record("triage", ExecutionStatus::Failed);
        backend.upsert_execution(&rec).await.unwrap();
        assert!(backend.delete_execution(&rec.id).await.unwrap());
        assert!(!backend.delete_execution(&rec.id).await.unwrap());
    }
}
