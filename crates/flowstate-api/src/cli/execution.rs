//! Execution commands: run, resume, list, show, result, delete, cleanup.

use std::path::Path;

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;
use serde_json::{Value, json};
use uuid::Uuid;

use flowstate_core::machine::definition::load_machine_file;
use flowstate_types::execution::{Execution, ExecutionFilter, ExecutionRecord, ExecutionStatus};

use crate::cli::ResultTarget;
use crate::state::AppState;

/// Parse `--input`. Absent means an empty object; anything else must be a
/// JSON object.
pub fn parse_input(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(json!({}));
    };
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        bail!("--input must be a JSON object, got {}", kind_of(&value));
    }
    Ok(value)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Run a machine file under the retry policy. Returns whether it succeeded.
pub async fn run(
    state: &AppState,
    file: &Path,
    input: Option<&str>,
    max_attempts: Option<u32>,
    json: bool,
) -> Result<bool> {
    let input = parse_input(input)?;
    let config = state.adopt_machine(load_machine_file(file)?)?;

    let execution = state.manager(max_attempts).run(&config, input).await?;
    report(&execution, json)?;
    Ok(execution.is_success())
}

/// Resume an execution. Returns whether it succeeded.
pub async fn resume(state: &AppState, id: Uuid, json: bool) -> Result<bool> {
    let execution = state.manager(None).resume(id).await?;
    report(&execution, json)?;
    Ok(execution.is_success())
}

fn report(execution: &Execution, json: bool) -> Result<()> {
    if json {
        let payload = json!({
            "execution_id": execution.id,
            "machine": execution.machine,
            "status": execution.status,
            "attempt": execution.attempt,
            "steps": execution.steps,
            "outcome": execution.outcome(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!();
    let (mark, verb) = match execution.status {
        ExecutionStatus::Succeeded => (style("✓").green().bold(), "succeeded"),
        ExecutionStatus::Cancelled => (style("○").yellow().bold(), "was cancelled"),
        _ => (style("✗").red().bold(), "failed"),
    };
    println!(
        "  {} {} {}",
        mark,
        style(&execution.machine).cyan().bold(),
        verb
    );
    println!();
    println!("  {}         {}", style("ID:").bold(), style(execution.id).dim());
    println!("  {}      {}", style("State:").bold(), execution.current_state);
    println!(
        "  {}      {} (attempt {})",
        style("Steps:").bold(),
        execution.steps,
        execution.attempt
    );
    println!(
        "  {}      {} calls, cost {:.4}",
        style("Usage:").bold(),
        execution.usage.api_calls,
        execution.usage.cost
    );
    if let Some(failure) = &execution.failure {
        println!(
            "  {}      {} {}",
            style("Error:").bold(),
            style(&failure.error_type).red(),
            failure.summary
        );
        if failure.retryable {
            println!(
                "  Retry with: {}",
                style(format!("flowstate resume {}", execution.id)).yellow()
            );
        }
    }
    println!();
    println!("  {}", style("── Outcome ──").dim());
    for line in serde_json::to_string_pretty(&execution.outcome())?.lines() {
        println!("  {line}");
    }
    println!();
    Ok(())
}

/// List executions in a table.
pub async fn list(
    state: &AppState,
    status: Option<String>,
    machine: Option<String>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let status = match status {
        Some(s) => Some(s.parse::<ExecutionStatus>().map_err(|e| anyhow::anyhow!(e))?),
        None => None,
    };
    let filter = ExecutionFilter {
        status,
        machine,
        limit: Some(limit),
        ..ExecutionFilter::default()
    };

    let records = state.manager(None).list_executions(&filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!(
            "  {} No executions found. Start one with: {}",
            style("i").blue().bold(),
            style("flowstate run <file>").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("ID").fg(Color::White),
        Cell::new("Machine").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("State").fg(Color::White),
        Cell::new("Attempts").fg(Color::White),
        Cell::new("Calls").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for record in &records {
        table.add_row(vec![
            Cell::new(record.id.to_string()).fg(Color::DarkGrey),
            Cell::new(&record.machine).fg(Color::Cyan),
            status_cell(record.status),
            Cell::new(&record.current_state),
            Cell::new(record.attempts),
            Cell::new(record.total_api_calls),
            Cell::new(format_relative_time(&record.updated_at)),
        ]);
    }

    println!("{table}");
    Ok(())
}

fn status_cell(status: ExecutionStatus) -> Cell {
    match status {
        ExecutionStatus::Running => Cell::new("● running").fg(Color::Blue),
        ExecutionStatus::Succeeded => Cell::new("✓ succeeded").fg(Color::Green),
        ExecutionStatus::Failed => Cell::new("✗ failed").fg(Color::Red),
        ExecutionStatus::Cancelled => Cell::new("○ cancelled").fg(Color::Yellow),
    }
}

/// Show one execution record with its checkpoint lineage.
pub async fn show(state: &AppState, id: Uuid, json: bool) -> Result<()> {
    let Some(record) = state.manager(None).get(id).await? else {
        bail!("execution not found: {id}");
    };
    let lineage = state.engine.checkpoints().history(id).await?;

    if json {
        let payload = json!({
            "execution": record,
            "checkpoints": lineage,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    print_record(&record);

    if lineage.is_empty() {
        println!("  {}", style("(persistence disabled, no checkpoints)").dim());
    } else {
        println!("  {}", style("── Checkpoints ──").dim());
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL_CONDENSED);
        table.set_header(vec!["Seq", "State", "Steps", "Calls", "Taken"]);
        for checkpoint in &lineage {
            table.add_row(vec![
                Cell::new(checkpoint.sequence),
                Cell::new(&checkpoint.state),
                Cell::new(checkpoint.step_count),
                Cell::new(checkpoint.usage.api_calls),
                Cell::new(format_relative_time(&checkpoint.created_at)),
            ]);
        }
        println!("{table}");
    }
    println!();
    Ok(())
}

fn print_record(record: &ExecutionRecord) {
    println!();
    println!(
        "  {} {}",
        style(&record.machine).cyan().bold(),
        style(record.id).dim()
    );
    println!();
    println!("  {}     {}", style("Status:").bold(), record.status);
    println!("  {}      {}", style("State:").bold(), record.current_state);
    println!("  {}   {}", style("Attempts:").bold(), record.attempts);
    println!(
        "  {}      {} calls, cost {:.4}",
        style("Usage:").bold(),
        record.total_api_calls,
        record.total_cost
    );
    if let Some(parent) = record.parent_id {
        println!("  {}     {}", style("Parent:").bold(), parent);
    }
    if let Some(launcher) = record.launched_by {
        println!("  {} {}", style("Launched by:").bold(), launcher);
    }
    if let Some(error) = &record.error {
        println!(
            "  {}      {} {}",
            style("Error:").bold(),
            style(record.error_type.as_deref().unwrap_or("Error")).red(),
            error
        );
    }
    println!(
        "  {}    {}",
        style("Created:").bold(),
        record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  {}    {}",
        style("Updated:").bold(),
        format_relative_time(&record.updated_at)
    );
    println!();
}

/// Print a published result. Returns whether one exists.
pub async fn result(state: &AppState, target: &ResultTarget, json: bool) -> Result<bool> {
    let id = target.id;
    let scheme = &state.engine.settings().result_scheme;
    if let Some(requested) = &target.scheme
        && requested != scheme
    {
        bail!("result key scheme '{requested}' does not match the configured scheme '{scheme}'");
    }
    let value = state.engine.read_result(id).await?;

    match (&value, json) {
        (Some(value), _) => println!("{}", serde_json::to_string_pretty(value)?),
        (None, true) => println!("{}", json!({ "execution_id": id, "result": null })),
        (None, false) => {
            println!(
                "  {} No result published for {} (key {})",
                style("i").blue().bold(),
                id,
                style(state.engine.result_key(id)).dim()
            );
        }
    }
    Ok(value.is_some())
}

/// Delete one execution after confirmation.
pub async fn delete(state: &AppState, id: Uuid, force: bool, json: bool) -> Result<()> {
    let manager = state.manager(None);
    let Some(record) = manager.get(id).await? else {
        bail!("execution not found: {id}");
    };

    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Permanently delete {} execution {} with its checkpoints and result?",
                style(&record.machine).red().bold(),
                id
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let deleted = manager.delete(id, force).await?;

    if json {
        println!("{}", json!({ "deleted": deleted, "execution_id": id }));
    } else {
        println!("  {} Execution {} deleted.", style("✓").red().bold(), id);
    }
    Ok(())
}

/// Remove terminal executions older than `older_than_hours`.
pub async fn cleanup(state: &AppState, older_than_hours: u32, yes: bool, json: bool) -> Result<()> {
    if !yes && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete finished executions older than {older_than_hours}h?"
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let removed = state
        .manager(None)
        .cleanup(chrono::Duration::hours(i64::from(older_than_hours)))
        .await?;

    if json {
        println!("{}", json!({ "removed": removed }));
    } else {
        println!(
            "  {} Removed {} execution{}.",
            style("✓").green().bold(),
            removed,
            if removed == 1 { "" } else { "s" }
        );
    }
    Ok(())
}

fn format_relative_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let diff = chrono::Utc::now() - *dt;

    if diff.num_minutes() < 1 {
        "just now".to_string()
    } else if diff.num_hours() < 1 {
        format!("{}m ago", diff.num_minutes())
    } else if diff.num_days() < 1 {
        format!("{}h ago", diff.num_hours())
    } else if diff.num_days() < 30 {
        format!("{}d ago", diff.num_days())
    } else {
        dt.format("%Y-%m-%d").to_string()
    }
}
