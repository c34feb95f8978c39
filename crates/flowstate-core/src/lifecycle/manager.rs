//! Execution lifecycle management.
//!
//! Wraps an `Engine` with a retry policy, resumability checks, listing, and
//! garbage collection of terminal executions.

use chrono::Utc;
use flowstate_types::config::RetryPolicy;
use flowstate_types::execution::{Execution, ExecutionFilter, ExecutionRecord, ExecutionStatus};
use flowstate_types::machine::MachineConfig;
use serde_json::Value;
use uuid::Uuid;

use super::retry::RetryHandler;
use crate::engine::{Engine, EngineError, RunOptions};
use crate::repository::Backend;

/// Lifecycle manager generic over the storage backend.
///
/// Retries reuse the execution id. A retry continues from the latest
/// checkpoint when the machine persists them and reruns from the initial
/// state otherwise.
pub struct ExecutionManager<B: Backend> {
    engine: Engine<B>,
    policy: RetryPolicy,
}

impl<B: Backend> ExecutionManager<B> {
    pub fn new(engine: Engine<B>, policy: RetryPolicy) -> Self {
        Self { engine, policy }
    }

    /// Manager using the engine's configured retry policy.
    pub fn from_settings(engine: Engine<B>) -> Self {
        let policy = engine.settings().retry.clone();
        Self::new(engine, policy)
    }

    pub fn engine(&self) -> &Engine<B> {
        &self.engine
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `config` to a terminal status, retrying retryable failures.
    ///
    /// Every attempt is recorded on the execution record; on exhaustion the
    /// record keeps the last failure.
    pub async fn run(&self, config: &MachineConfig, input: Value) -> Result<Execution, EngineError> {
        let execution = self.engine.run(config, input.clone()).await?;
        self.retry_loop(execution, Some((config, &input))).await
    }

    /// Resume a failed (or orphaned running) execution from its latest
    /// checkpoint, then apply the retry policy to the resumed attempts.
    pub async fn resume(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let record = self
            .engine
            .backend()
            .get_execution(&execution_id)
            .await?
            .ok_or(EngineError::NotFound(execution_id))?;

        let resumable = match record.status {
            ExecutionStatus::Failed => true,
            ExecutionStatus::Running => !self.engine.is_active(execution_id),
            ExecutionStatus::Succeeded | ExecutionStatus::Cancelled => false,
        };
        if !resumable {
            return Err(EngineError::NotResumable {
                id: execution_id,
                status: record.status,
            });
        }

        let attempt = record.attempts.saturating_add(1);
        let execution = self.engine.resume_with(execution_id, Some(attempt)).await?;
        self.retry_loop(execution, None).await
    }

    async fn retry_loop(
        &self,
        mut execution: Execution,
        fresh: Option<(&MachineConfig, &Value)>,
    ) -> Result<Execution, EngineError> {
        loop {
            if execution.status != ExecutionStatus::Failed {
                return Ok(execution);
            }
            let Some(failure) = execution.failure.as_ref() else {
                return Ok(execution);
            };
            if !RetryHandler::should_retry(&self.policy, execution.attempt, failure) {
                if failure.retryable {
                    tracing::warn!(
                        execution_id = %execution.id,
                        attempts = execution.attempt,
                        error_type = failure.error_type.as_str(),
                        "retry attempts exhausted"
                    );
                }
                return Ok(execution);
            }

            let delay = RetryHandler::delay_for(&self.policy, execution.attempt);
            let next = execution.attempt + 1;
            tracing::info!(
                execution_id = %execution.id,
                attempt = next,
                max_attempts = self.policy.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error_type = failure.error_type.as_str(),
                "retrying execution"
            );
            tokio::time::sleep(delay).await;

            let has_checkpoint = self
                .engine
                .checkpoints()
                .load_latest(execution.id)
                .await?
                .is_some();
            execution = match (has_checkpoint, fresh) {
                (false, Some((config, input))) => {
                    let options = RunOptions::default()
                        .with_execution_id(execution.id)
                        .with_attempt(next);
                    self.engine.run_with(config, input.clone(), options).await?
                }
                _ => self.engine.resume_with(execution.id, Some(next)).await?,
            };
        }
    }

    // -----------------------------------------------------------------------
    // Index
    // -----------------------------------------------------------------------

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        Ok(self.engine.backend().list_executions(filter).await?)
    }

    pub async fn get(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>, EngineError> {
        Ok(self.engine.backend().get_execution(&execution_id).await?)
    }

    /// Delete an execution with its checkpoints and stored result.
    ///
    /// Running executions are refused unless `force` is set; an execution
    /// this engine is actively driving is always refused.
    pub async fn delete(&self, execution_id: Uuid, force: bool) -> Result<bool, EngineError> {
        let Some(record) = self.get(execution_id).await? else {
            return Ok(false);
        };
        if self.engine.is_active(execution_id)
            || (record.status == ExecutionStatus::Running && !force)
        {
            return Err(EngineError::StillRunning(execution_id));
        }
        self.purge(execution_id).await?;
        tracing::info!(execution_id = %execution_id, "deleted execution");
        Ok(true)
    }

    /// Delete terminal executions last updated more than `older_than` ago.
    /// Returns how many were removed. Running executions are never touched.
    pub async fn cleanup(&self, older_than: chrono::Duration) -> Result<u64, EngineError> {
        let filter = ExecutionFilter {
            terminal_only: true,
            updated_before: Some(Utc::now() - older_than),
            ..ExecutionFilter::default()
        };
        let candidates = self.engine.backend().list_executions(&filter).await?;

        let mut removed = 0;
        for record in candidates {
            if !record.status.is_terminal() || self.engine.is_active(record.id) {
                continue;
            }
            self.purge(record.id).await?;
            removed += 1;
        }

        tracing::info!(removed, "cleaned up terminal executions");
        Ok(removed)
    }

    async fn purge(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let checkpoints = self.engine.checkpoints().discard(execution_id).await?;
        let key = self.engine.result_key(execution_id);
        self.engine.backend().delete_result(&key).await?;
        self.engine.backend().delete_execution(&execution_id).await?;
        tracing::debug!(execution_id = %execution_id, checkpoints, "purged execution");
        Ok(())
    }
}

/// Run with the engine's default retry policy (`EngineSettings.retry`).
pub async fn supervised_run<B: Backend>(
    engine: &Engine<B>,
    config: &MachineConfig,
    input: Value,
) -> Result<Execution, EngineError> {
    ExecutionManager::from_settings(engine.clone())
        .run(config, input)
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
