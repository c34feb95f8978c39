//! CLI command definitions for the `flowstate` binary.

pub mod execution;
pub mod machine;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use flowstate_core::repository::parse_result_key;
use uuid::Uuid;

/// Run and manage declarative agent workflows.
#[derive(Parser)]
#[command(name = "flowstate", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Only log errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a machine definition file to completion.
    Run {
        /// Path to a `.yaml`, `.yml`, or `.json` machine definition.
        file: PathBuf,

        /// Input object as JSON.
        #[arg(short, long)]
        input: Option<String>,

        /// Override the configured retry attempts.
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Resume a failed or interrupted execution from its latest checkpoint.
    Resume {
        id: Uuid,
    },

    /// List executions, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by status (running, succeeded, failed, cancelled).
        #[arg(long)]
        status: Option<String>,

        /// Filter by machine name.
        #[arg(long)]
        machine: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one execution and its checkpoint lineage.
    Show {
        id: Uuid,
    },

    /// Print the published result of an execution.
    Result {
        /// Execution id, or its full result key (`flowstate://<id>/result`).
        #[arg(value_parser = parse_result_target)]
        target: ResultTarget,
    },

    /// Delete an execution with its checkpoints and result.
    #[command(alias = "rm")]
    Delete {
        id: Uuid,

        /// Skip confirmation and allow deleting a stale running execution.
        #[arg(long)]
        force: bool,
    },

    /// Delete terminal executions older than the given age.
    Cleanup {
        #[arg(long)]
        older_than_hours: u32,

        /// Skip confirmation.
        #[arg(long)]
        yes: bool,
    },

    /// Check a machine definition without running it.
    Validate {
        file: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        shell: Shell,
    },
}

/// What `flowstate result` was pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultTarget {
    pub id: Uuid,
    /// Scheme named by a full result key; `None` for a bare id.
    pub scheme: Option<String>,
}

fn parse_result_target(raw: &str) -> Result<ResultTarget, String> {
    if let Ok(id) = raw.parse::<Uuid>() {
        return Ok(ResultTarget { id, scheme: None });
    }
    parse_result_key(raw)
        .map(|(scheme, id)| ResultTarget {
            id,
            scheme: Some(scheme.to_string()),
        })
        .ok_or_else(|| format!("expected an execution id or a <scheme>://<id>/result key, got '{raw}'"))
}
