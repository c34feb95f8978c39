//! Small agent implementations: closure adapter and echo.

use std::future::Future;

use super::invoker::{AgentError, AgentInvoker, AgentRequest, AgentResponse};

/// Adapts an async closure into an [`AgentInvoker`].
///
/// Useful for embedding engines in services and for tests.
pub struct FnAgent<F> {
    f: F,
}

impl<F, Fut> FnAgent<F>
where
    F: Fn(AgentRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AgentResponse, AgentError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> AgentInvoker for FnAgent<F>
where
    F: Fn(AgentRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AgentResponse, AgentError>> + Send,
{
    fn invoke(
        &self,
        request: &AgentRequest,
    ) -> impl Future<Output = Result<AgentResponse, AgentError>> + Send {
        (self.f)(request.clone())
    }
}

/// Returns its input unchanged. Registered as `echo` by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAgent;

impl AgentInvoker for EchoAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        Ok(AgentResponse::new(request.input.clone()))
    }
}
