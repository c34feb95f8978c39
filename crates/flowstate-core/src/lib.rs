//! Execution engine and storage ports for Flowstate.
//!
//! This crate defines the "ports" (storage and agent traits) that the
//! infrastructure layer implements, plus the scheduler, concurrency
//! coordinator, peering manager, and lifecycle manager built on top of them.
//! It depends only on `flowstate-types` -- never on `flowstate-infra` or any
//! database/IO crate.

pub mod agent;
pub mod engine;
pub mod event;
pub mod lifecycle;
pub mod machine;
pub mod repository;
