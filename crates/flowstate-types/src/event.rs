//! Execution events published on the engine's broadcast bus.
//!
//! Events are fire-and-forget notifications for observers (CLI progress,
//! tests, external monitoring). They carry ids and summaries, never full
//! context payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A lifecycle notification about one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// An execution started (fresh run or retry attempt).
    Started {
        execution_id: Uuid,
        machine: String,
        parent_id: Option<Uuid>,
        attempt: u32,
    },

    /// An execution continued from a checkpoint.
    Resumed {
        execution_id: Uuid,
        state: String,
        sequence: u64,
    },

    /// The scheduler is about to dispatch a state.
    StateEntered {
        execution_id: Uuid,
        state: String,
        kind: String,
        step: u32,
    },

    /// A checkpoint was persisted.
    Checkpointed {
        execution_id: Uuid,
        state: String,
        sequence: u64,
    },

    /// A detached execution was launched.
    Launched {
        execution_id: Uuid,
        launched_by: Option<Uuid>,
        machine: String,
    },

    /// An execution reached a final state.
    Succeeded {
        execution_id: Uuid,
        machine: String,
        steps: u32,
        duration_ms: u64,
    },

    /// An execution stopped with a failure record.
    Failed {
        execution_id: Uuid,
        machine: String,
        error_type: String,
        summary: String,
    },

    /// An execution was cancelled.
    Cancelled { execution_id: Uuid },
}

impl ExecutionEvent {
    /// The execution this event is about.
    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::Started { execution_id, .. }
            | ExecutionEvent::Resumed { execution_id, .. }
            | ExecutionEvent::StateEntered { execution_id, .. }
            | ExecutionEvent::Checkpointed { execution_id, .. }
            | ExecutionEvent::Launched { execution_id, .. }
            | ExecutionEvent::Succeeded { execution_id, .. }
            | ExecutionEvent::Failed { execution_id, .. }
            | ExecutionEvent::Cancelled { execution_id } => *execution_id,
        }
    }
}
