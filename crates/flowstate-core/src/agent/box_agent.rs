//! BoxAgent -- object-safe dynamic dispatch wrapper for AgentInvoker.
//!
//! 1. Define an object-safe `AgentInvokerDyn` trait with boxed futures
//! 2. Blanket-impl `AgentInvokerDyn` for all `T: AgentInvoker`
//! 3. `BoxAgent` wraps `Box<dyn AgentInvokerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use super::invoker::{AgentError, AgentInvoker, AgentRequest, AgentResponse};

/// Object-safe version of [`AgentInvoker`] with boxed futures.
pub trait AgentInvokerDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, AgentError>> + Send + 'a>>;
}

impl<T: AgentInvoker> AgentInvokerDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, AgentError>> + Send + 'a>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased agent for registries keyed by name.
///
/// Since `AgentInvoker` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxAgent` delegates to the inner `AgentInvokerDyn` object.
pub struct BoxAgent {
    inner: Box<dyn AgentInvokerDyn + Send + Sync>,
}

impl BoxAgent {
    pub fn new<T: AgentInvoker + 'static>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    pub async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        self.inner.invoke_boxed(request).await
    }
}

impl std::fmt::Debug for BoxAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgent").finish_non_exhaustive()
    }
}
