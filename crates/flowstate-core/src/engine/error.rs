//! Engine error taxonomy.
//!
//! Every failure that stops an execution maps to one `EngineError`, which
//! names its taxonomy kind (`error_type`) and whether a retry policy may
//! attempt the execution again.

use flowstate_types::error::RepositoryError;
use flowstate_types::execution::{ExecutionStatus, FailureRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::checkpoint::CheckpointError;
use super::expression::ExpressionError;
use crate::machine::ConfigError;

/// One failed branch of a parallel or foreach join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFailure {
    /// Position in declaration (parallel) or input (foreach) order.
    pub index: usize,
    pub error_type: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// No transition matched, a guard failed, or the step limit was hit.
    #[error("transition error in state '{state}': {message}")]
    Transition { state: String, message: String },

    #[error("agent '{agent}' failed in state '{state}': {message}")]
    AgentCall {
        agent: String,
        state: String,
        message: String,
        retryable: bool,
    },

    #[error("{} of {total} branches failed in state '{state}'", .failures.len())]
    Concurrency {
        state: String,
        total: usize,
        failures: Vec<BranchFailure>,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] CheckpointError),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),

    #[error("expression error in state '{state}': {source}")]
    Expression {
        state: String,
        #[source]
        source: ExpressionError,
    },

    #[error("state '{state}' timed out after {secs}s")]
    Timeout { state: String, secs: u64 },

    #[error("execution cancelled")]
    Cancelled,

    #[error("no result for execution {execution_id} after {waited_ms}ms")]
    WaitTimeout { execution_id: Uuid, waited_ms: u64 },

    /// A nested machine run ended without success.
    #[error("child machine '{machine}' failed: {}", .failure.summary)]
    Child {
        machine: String,
        failure: FailureRecord,
    },

    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("execution {id} is {status} and cannot be resumed")]
    NotResumable { id: Uuid, status: ExecutionStatus },

    #[error("execution {0} is already active")]
    AlreadyActive(Uuid),

    #[error("execution {0} is still running")]
    StillRunning(Uuid),
}

impl EngineError {
    /// Taxonomy name recorded in failure records and outcomes.
    pub fn error_type(&self) -> &str {
        match self {
            EngineError::Config(_) => "ConfigError",
            EngineError::Transition { .. } => "TransitionError",
            EngineError::AgentCall { .. } => "AgentCallError",
            EngineError::Concurrency { .. } => "ConcurrencyError",
            EngineError::Persistence(_) | EngineError::Storage(_) => "PersistenceError",
            EngineError::Expression { .. } => "ExpressionError",
            EngineError::Timeout { .. } | EngineError::WaitTimeout { .. } => "TimeoutError",
            EngineError::Cancelled => "Cancelled",
            EngineError::Child { failure, .. } => &failure.error_type,
            EngineError::NotFound(_) => "NotFound",
            EngineError::NotResumable { .. } => "NotResumable",
            EngineError::AlreadyActive(_) | EngineError::StillRunning(_) => "Conflict",
        }
    }

    /// Whether a retry policy may attempt the execution again.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::AgentCall { retryable, .. } => *retryable,
            EngineError::Timeout { .. } => true,
            EngineError::Concurrency { failures, .. } => {
                !failures.is_empty() && failures.iter().all(|f| f.retryable)
            }
            EngineError::Child { failure, .. } => failure.retryable,
            _ => false,
        }
    }

    pub fn to_failure(&self, last_state: &str) -> FailureRecord {
        FailureRecord {
            error_type: self.error_type().to_string(),
            summary: self.to_string(),
            last_state: last_state.to_string(),
            retryable: self.is_retryable(),
        }
    }

    /// Convert to the failure of one branch in a join.
    pub(crate) fn to_branch_failure(&self, index: usize) -> BranchFailure {
        BranchFailure {
            index,
            error_type: self.error_type().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
