//! Infrastructure layer for Flowstate.
//!
//! Contains implementations of the storage ports defined in `flowstate-core`
//! (SQLite checkpoints, results, and execution index behind one
//! [`sqlite::SqliteBackend`]) and the `config.toml` loader.

pub mod config;
pub mod sqlite;
