//! Flowstate CLI entry point.
//!
//! Binary name: `flowstate`
//!
//! Parses arguments, installs tracing, opens the SQLite-backed engine under
//! the data directory, and dispatches to a command handler. Commands that
//! report an unsuccessful execution exit with status 1.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use flowstate_observe::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or the database
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "flowstate", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    init_tracing(
        &TracingOptions::from_verbosity(cli.verbose, cli.quiet)
            .with_json(cli.json)
            .with_otel(cli.otel),
    )?;

    let outcome = dispatch(cli).await;
    shutdown_tracing();

    Ok(if outcome? { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn dispatch(cli: Cli) -> anyhow::Result<bool> {
    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Run {
            file,
            input,
            max_attempts,
        } => cli::execution::run(&state, &file, input.as_deref(), max_attempts, json).await,

        Commands::Resume { id } => cli::execution::resume(&state, id, json).await,

        Commands::List {
            status,
            machine,
            limit,
        } => {
            cli::execution::list(&state, status, machine, limit, json).await?;
            Ok(true)
        }

        Commands::Show { id } => {
            cli::execution::show(&state, id, json).await?;
            Ok(true)
        }

        Commands::Result { target } => cli::execution::result(&state, &target, json).await,

        Commands::Delete { id, force } => {
            cli::execution::delete(&state, id, force, json).await?;
            Ok(true)
        }

        Commands::Cleanup {
            older_than_hours,
            yes,
        } => {
            cli::execution::cleanup(&state, older_than_hours, yes, json).await?;
            Ok(true)
        }

        Commands::Validate { file } => cli::machine::validate(&state, &file, json),

        Commands::Completions { .. } => Ok(true),
    }
}
