//! Storage ports.
//!
//! These traits define the storage interface that the infrastructure layer
//! (flowstate-infra) implements. The engine never depends on any specific
//! storage technology. `InMemoryBackend` is the reference implementation used
//! for tests and embedded engines.

pub mod checkpoint;
pub mod execution;
pub mod memory;
pub mod result;

pub use checkpoint::CheckpointStore;
pub use execution::ExecutionStore;
pub use memory::InMemoryBackend;
pub use result::{parse_result_key, result_key, ResultBackend};

/// Everything an engine needs from storage: checkpoints, results, and the
/// execution index, shared across all executions of one engine.
///
/// Implementations must tolerate concurrent access from independent
/// executions; the only ordering they must enforce is the per-execution
/// checkpoint sequence.
pub trait Backend: CheckpointStore + ResultBackend + ExecutionStore + 'static {
    /// Backend name matched against a machine's `persistence.backend`.
    fn name(&self) -> &'static str;
}
