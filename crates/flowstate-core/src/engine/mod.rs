//! The execution engine.
//!
//! - `scheduler`: the state loop, run/resume entry points, cancellation
//! - `coordinator`: `parallel` and `foreach` fan-out and deterministic joins
//! - `peering`: detached launches and result rendezvous
//! - `checkpoint`: the checkpoint side of the persistence protocol
//! - `context` / `expression`: the data bag and the JEXL evaluator over it

pub mod checkpoint;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod expression;
pub mod peering;
pub mod scheduler;

pub use checkpoint::{CheckpointError, CheckpointManager};
pub use coordinator::{ForeachPlan, JoinOutput};
pub use error::{BranchFailure, EngineError};
pub use expression::{ExpressionError, ExpressionEvaluator};
pub use peering::LaunchHandle;
pub use scheduler::{Engine, RunOptions};
