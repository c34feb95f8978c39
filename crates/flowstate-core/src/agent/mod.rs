//! Agent invocation: the port through which states call external agents.
//!
//! Concrete agents (LLM providers, tools, services) live outside the engine.
//! The engine only sees `AgentInvoker` implementations registered by name in
//! an `AgentRegistry`.

pub mod box_agent;
pub mod builtin;
pub mod invoker;
pub mod registry;

pub use box_agent::BoxAgent;
pub use builtin::{EchoAgent, FnAgent};
pub use invoker::{AgentError, AgentInvoker, AgentRequest, AgentResponse};
pub use registry::AgentRegistry;
