//! Peering: fire-and-forget launches and result rendezvous.
//!
//! A launched execution gets a fresh id, its own cancellation token, and its
//! own checkpoint lineage. The launcher only keeps the id; the outcome is
//! delivered out-of-band through the result backend under the launched
//! execution's result key.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowstate_types::event::ExecutionEvent;
use flowstate_types::execution::{ExecutionStatus, FailureRecord};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::EngineError;
use super::scheduler::{Engine, RunOptions};
use crate::machine::ConfigError;
use crate::repository::Backend;

/// What a launcher gets back immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchHandle {
    pub execution_id: Uuid,
    /// Where the outcome will be published.
    pub result_key: String,
}

impl<B: Backend> Engine<B> {
    /// Start a registered machine as an independent execution and return
    /// without waiting for it.
    ///
    /// Fails only if the execution cannot start. Cancelling the launcher
    /// never reaches the launched execution.
    pub async fn launch(
        &self,
        machine: &str,
        input: Value,
        launched_by: Option<Uuid>,
    ) -> Result<LaunchHandle, EngineError> {
        let config = self
            .inner
            .machines
            .get(machine)
            .ok_or_else(|| ConfigError::UnknownMachine(machine.to_string()))?;
        let options = RunOptions {
            launched_by,
            token: Some(CancellationToken::new()),
            ..RunOptions::default()
        };
        let (execution, token) = self.prepare(&config, input, &options).await?;
        let handle = LaunchHandle {
            execution_id: execution.id,
            result_key: self.result_key(execution.id),
        };

        self.inner.events.publish(ExecutionEvent::Launched {
            execution_id: execution.id,
            launched_by,
            machine: machine.to_string(),
        });
        tracing::info!(
            execution_id = %execution.id,
            launched_by = ?launched_by,
            machine,
            "launched detached execution"
        );

        let engine = self.clone();
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            engine.run_prepared(execution, config, token).await;
        });

        Ok(handle)
    }

    /// Read a published outcome. `None` until the execution succeeds.
    pub async fn read_result(&self, execution_id: Uuid) -> Result<Option<Value>, EngineError> {
        let key = self.result_key(execution_id);
        Ok(self.inner.backend.read_result(&key).await?)
    }

    /// Poll the result backend until the outcome is published.
    ///
    /// Gives up early with the execution's failure when its record shows it
    /// ended without success, and with `WaitTimeout` once `timeout` elapses.
    pub async fn wait_for_result(
        &self,
        execution_id: Uuid,
        poll: Duration,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        let started = Instant::now();
        let poll = poll.max(Duration::from_millis(1));

        loop {
            if let Some(value) = self.read_result(execution_id).await? {
                return Ok(value);
            }

            if !self.is_active(execution_id)
                && let Some(record) = self.inner.backend.get_execution(&execution_id).await?
                && record.status.is_terminal()
                && record.status != ExecutionStatus::Succeeded
            {
                let error_type = record
                    .error_type
                    .clone()
                    .unwrap_or_else(|| record.status.as_str().to_string());
                return Err(EngineError::Child {
                    machine: record.machine.clone(),
                    failure: FailureRecord {
                        retryable: false,
                        error_type,
                        summary: record
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("execution is {}", record.status)),
                        last_state: record.current_state.clone(),
                    },
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(EngineError::WaitTimeout {
                    execution_id,
                    waited_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(poll.min(timeout - elapsed)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
