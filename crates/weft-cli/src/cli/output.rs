//! Shared formatting helpers for command output.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color};
use console::style;
use serde_json::Value;
use weft_types::workflow::{InstanceId, WorkflowInstance, WorkflowStatus};

use super::InputArgs;

/// Parse a full instance UUID from the command line.
pub fn parse_instance_id(raw: &str) -> Result<InstanceId> {
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid instance ID: '{raw}'"))
}

/// Resolve `--input` / `--input-file` to a JSON value (`null` when absent).
pub async fn read_input(args: &InputArgs) -> Result<Value> {
    let raw = match (&args.input, &args.input_file) {
        (Some(inline), _) => inline.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read input file {}", path.display()))?,
        (None, None) => return Ok(Value::Null),
    };
    parse_input_json(&raw)
}

pub fn parse_input_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("workflow input is not valid JSON")
}

/// First 8 characters of an instance ID for table display.
pub fn short_id(id: &InstanceId) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn status_cell(status: WorkflowStatus) -> Cell {
    match status {
        WorkflowStatus::Running => Cell::new("running").fg(Color::Blue),
        WorkflowStatus::Completed => Cell::new("completed").fg(Color::Green),
        WorkflowStatus::Failed => Cell::new("failed").fg(Color::Red),
        WorkflowStatus::Cancelled => Cell::new("cancelled").fg(Color::DarkYellow),
    }
}

pub fn styled_status(status: WorkflowStatus) -> String {
    let text = status.to_string();
    match status {
        WorkflowStatus::Running => style(text).blue().to_string(),
        WorkflowStatus::Completed => style(text).green().to_string(),
        WorkflowStatus::Failed => style(text).red().to_string(),
        WorkflowStatus::Cancelled => style(text).yellow().to_string(),
    }
}

/// Strings print as-is; anything else pretty-printed.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Keep the first `max` characters, marking the cut with `...`.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Print one instance in detail (status view and the end of `run`).
pub fn print_instance(instance: &WorkflowInstance, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(instance)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Instance:").bold(),
        style(instance.id.to_string()).cyan()
    );
    println!("  Workflow: {}", style(&instance.workflow_name).cyan());
    println!("  Status: {}", styled_status(instance.status));
    println!("  Created: {}", instance.created_at.format("%Y-%m-%d %H:%M:%S"));
    if instance.status.is_terminal() {
        println!("  Finished: {}", instance.updated_at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref result) = instance.result {
        println!();
        println!("  {}", style("Result:").bold());
        for line in render_value(result).lines() {
            println!("    {line}");
        }
    }
    if let Some(ref err) = instance.error {
        println!("  Error: {}", style(err).red());
    }
    println!();
    Ok(())
}
