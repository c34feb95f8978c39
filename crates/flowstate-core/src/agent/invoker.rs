//! Agent invocation trait and its request/response types.

use flowstate_types::execution::Usage;
use serde_json::Value;
use uuid::Uuid;

/// One call from a state (or branch) to an agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub execution_id: Uuid,
    pub machine: String,
    pub state: String,
    /// Evaluated input mapping, or the whole context when no mapping is declared.
    pub input: Value,
}

/// What an agent returns on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    pub output: Value,
    pub usage: Usage,
}

impl AgentResponse {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, api_calls: u64, cost: f64) -> Self {
        self.usage = Usage::new(api_calls, cost);
        self
    }
}

/// Agent call failure, classified for the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Worth retrying (rate limits, timeouts, flaky upstreams).
    #[error("transient agent failure: {0}")]
    Transient(String),

    /// Retrying will not help (bad request, rejected input).
    #[error("agent failure: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }
}

/// An external call-producing unit invoked from a state.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// Wrap implementations in [`super::BoxAgent`] for dynamic dispatch.
pub trait AgentInvoker: Send + Sync {
    fn invoke(
        &self,
        request: &AgentRequest,
    ) -> impl std::future::Future<Output = Result<AgentResponse, AgentError>> + Send;
}
