//! Execution event distribution.
//!
//! The engine publishes an `ExecutionEvent` at every lifecycle boundary
//! (start, state entry, checkpoint, terminal status). Subscribers observe;
//! they never influence scheduling.

pub mod bus;

pub use bus::EventBus;
