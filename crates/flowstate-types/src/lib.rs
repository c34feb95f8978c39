//! Shared domain types for Flowstate.
//!
//! Machine definitions, execution records, checkpoint records, engine
//! settings, events, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod machine;
