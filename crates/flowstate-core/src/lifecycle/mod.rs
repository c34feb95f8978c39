//! Lifecycle management: retries, resumability, listing, and cleanup.

pub mod manager;
pub mod retry;

pub use manager::{supervised_run, ExecutionManager};
pub use retry::RetryHandler;
