//! Workflow instance subcommands.
//!
//! Provides run, start, resume, recover, cancel, status, history, list and
//! workflows over the built-in registry and the SQLite state store.

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tracing::Instrument;
use weft_core::repository::WorkflowRepository;
use weft_observe::attrs;
use weft_types::workflow::{HistoryEvent, WorkflowInstance, WorkflowStatus};

use super::InputArgs;
use super::output::{
    parse_instance_id, print_instance, read_input, render_value, short_id, status_cell, truncate,
};
use super::progress::with_progress;
use crate::state::AppState;

/// How command results are rendered.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputMode {
    pub json: bool,
    pub quiet: bool,
}

impl OutputMode {
    fn progress(self) -> bool {
        !self.json && !self.quiet
    }
}

fn command_span(operation: &'static str) -> tracing::Span {
    tracing::info_span!(
        "weft.command",
        { attrs::OPERATION } = operation,
        { attrs::WORKFLOW_NAME } = tracing::field::Empty,
        { attrs::INSTANCE_ID } = tracing::field::Empty,
        { attrs::INSTANCE_STATUS } = tracing::field::Empty,
        { attrs::INSTANCE_COUNT } = tracing::field::Empty,
    )
}

fn record_outcome(span: &tracing::Span, instance: &WorkflowInstance) {
    span.record(attrs::WORKFLOW_NAME, instance.workflow_name.as_str());
    span.record(attrs::INSTANCE_ID, instance.id.to_string().as_str());
    span.record(attrs::INSTANCE_STATUS, instance.status.to_string().as_str());
}

/// Print a finished instance and turn a non-completed outcome into an error
/// so the process exits non-zero.
fn finish(instance: &WorkflowInstance, mode: OutputMode) -> Result<()> {
    if !mode.quiet || mode.json {
        print_instance(instance, mode.json)?;
    }
    match instance.status {
        WorkflowStatus::Completed | WorkflowStatus::Running => Ok(()),
        WorkflowStatus::Failed => bail!("instance {} failed", instance.id),
        WorkflowStatus::Cancelled => bail!("instance {} was cancelled", instance.id),
    }
}

// ---------------------------------------------------------------------------
// Run / start
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    workflow: &str,
    input: &InputArgs,
    mode: OutputMode,
) -> Result<()> {
    let input = read_input(input).await?;
    let scheduler = &state.scheduler;

    let span = command_span(attrs::OP_RUN);
    span.record(attrs::WORKFLOW_NAME, workflow);
    let instance = with_progress(
        scheduler.event_bus(),
        mode.progress(),
        scheduler.run(workflow, input),
    )
    .instrument(span.clone())
    .await
    .with_context(|| format!("Failed to run workflow '{workflow}'"))?;
    record_outcome(&span, &instance);

    finish(&instance, mode)
}

pub async fn handle_start(
    state: &AppState,
    workflow: &str,
    input: &InputArgs,
    mode: OutputMode,
) -> Result<()> {
    let input = read_input(input).await?;

    let span = command_span(attrs::OP_START);
    span.record(attrs::WORKFLOW_NAME, workflow);
    let id = state
        .scheduler
        .start(workflow, input)
        .instrument(span.clone())
        .await
        .with_context(|| format!("Failed to start workflow '{workflow}'"))?;
    span.record(attrs::INSTANCE_ID, id.to_string().as_str());

    if mode.json {
        let out = serde_json::json!({
            "instance_id": id.to_string(),
            "workflow_name": workflow,
            "status": WorkflowStatus::Running,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if mode.quiet {
        println!("{id}");
        return Ok(());
    }

    println!();
    println!(
        "  {} Started '{}' as {}",
        style("*").green().bold(),
        style(workflow).cyan(),
        style(id.to_string()).cyan()
    );
    println!("  Drive it with: {}", style(format!("weft resume {id}")).dim());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Resume / recover / cancel
// ---------------------------------------------------------------------------

pub async fn handle_resume(state: &AppState, raw_id: &str, mode: OutputMode) -> Result<()> {
    let id = parse_instance_id(raw_id)?;
    let scheduler = &state.scheduler;

    let span = command_span(attrs::OP_RESUME);
    span.record(attrs::INSTANCE_ID, id.to_string().as_str());
    let instance = with_progress(scheduler.event_bus(), mode.progress(), scheduler.resume(id))
        .instrument(span.clone())
        .await
        .with_context(|| format!("Failed to resume instance {id}"))?;
    record_outcome(&span, &instance);

    finish(&instance, mode)
}

pub async fn handle_recover(state: &AppState, mode: OutputMode) -> Result<()> {
    let scheduler = &state.scheduler;

    let span = command_span(attrs::OP_RECOVER);
    let outcomes = with_progress(scheduler.event_bus(), mode.progress(), scheduler.recover_all())
        .instrument(span.clone())
        .await
        .context("Failed to list running instances")?;
    span.record(attrs::INSTANCE_COUNT, outcomes.len() as u64);

    if mode.json {
        let out: Vec<_> = outcomes
            .iter()
            .map(|(id, outcome)| match outcome {
                Ok(instance) => serde_json::json!({
                    "instance_id": id.to_string(),
                    "workflow_name": instance.workflow_name,
                    "status": instance.status,
                    "error": instance.error,
                }),
                Err(e) => serde_json::json!({
                    "instance_id": id.to_string(),
                    "status": "error",
                    "error": e.to_string(),
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if mode.quiet {
        return Ok(());
    }

    if outcomes.is_empty() {
        println!();
        println!("  No running instances to recover.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Error"),
        ]);
    for (id, outcome) in &outcomes {
        match outcome {
            Ok(instance) => table.add_row(vec![
                Cell::new(short_id(id)),
                Cell::new(&instance.workflow_name),
                status_cell(instance.status),
                Cell::new(
                    instance
                        .error
                        .as_deref()
                        .map(|e| truncate(e, 50))
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ]),
            Err(e) => table.add_row(vec![
                Cell::new(short_id(id)),
                Cell::new("-"),
                Cell::new("error").fg(Color::Red),
                Cell::new(truncate(&e.to_string(), 50)),
            ]),
        };
    }

    println!();
    println!("  Recovered {} instance(s)", style(outcomes.len()).cyan());
    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn handle_cancel(state: &AppState, raw_id: &str, mode: OutputMode) -> Result<()> {
    let id = parse_instance_id(raw_id)?;

    let span = command_span(attrs::OP_CANCEL);
    span.record(attrs::INSTANCE_ID, id.to_string().as_str());
    let cancelled = state
        .scheduler
        .cancel(id)
        .instrument(span)
        .await
        .with_context(|| format!("Failed to cancel instance {id}"))?;

    if mode.json {
        let out = serde_json::json!({
            "instance_id": id.to_string(),
            "cancelled": cancelled,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if mode.quiet {
        return Ok(());
    }

    println!();
    if cancelled {
        println!(
            "  {} Cancelled instance {}",
            style("*").green().bold(),
            style(short_id(&id)).cyan()
        );
    } else {
        println!(
            "  Instance {} had already finished; nothing to cancel.",
            style(short_id(&id)).cyan()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Status / history / list
// ---------------------------------------------------------------------------

async fn load_instance(state: &AppState, raw_id: &str) -> Result<WorkflowInstance> {
    let id = parse_instance_id(raw_id)?;
    state
        .scheduler
        .repository()
        .get_instance(&id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load instance: {e}"))?
        .with_context(|| format!("Instance '{raw_id}' not found"))
}

pub async fn handle_status(state: &AppState, raw_id: &str, mode: OutputMode) -> Result<()> {
    let instance = load_instance(state, raw_id).await?;
    print_instance(&instance, mode.json)
}

/// One-line summary of a history event for the table view.
fn describe_event(event: &HistoryEvent) -> (String, String) {
    match event {
        HistoryEvent::ActivityScheduled { name, input, .. } => (
            "scheduled".to_string(),
            format!("{name} {}", truncate(&input.to_string(), 60)),
        ),
        HistoryEvent::ActivityCompleted { output, .. } => (
            "completed".to_string(),
            truncate(&render_value(output).replace('\n', " "), 70),
        ),
        HistoryEvent::ActivityFailed { failure, .. } => {
            ("failed".to_string(), truncate(&failure.to_string(), 70))
        }
    }
}

pub async fn handle_history(state: &AppState, raw_id: &str, mode: OutputMode) -> Result<()> {
    let instance = load_instance(state, raw_id).await?;
    let records = state
        .scheduler
        .repository()
        .load_history_records(&instance.id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load history: {e}"))?;

    if mode.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!(
            "  No history recorded for instance '{}'.",
            short_id(&instance.id)
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Pos").fg(Color::Cyan),
            Cell::new("Seq"),
            Cell::new("Event"),
            Cell::new("Detail"),
            Cell::new("Recorded"),
        ]);

    for record in &records {
        let (kind, detail) = describe_event(&record.event);
        let kind_cell = match record.event {
            HistoryEvent::ActivityScheduled { .. } => Cell::new(kind),
            HistoryEvent::ActivityCompleted { .. } => Cell::new(kind).fg(Color::Green),
            HistoryEvent::ActivityFailed { .. } => Cell::new(kind).fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(record.position),
            Cell::new(record.event.seq()),
            kind_cell,
            Cell::new(detail),
            Cell::new(record.recorded_at.format("%H:%M:%S%.3f").to_string()),
        ]);
    }

    println!();
    println!(
        "  History of '{}' ({})",
        style(&instance.workflow_name).cyan(),
        style(short_id(&instance.id)).cyan()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn handle_list(
    state: &AppState,
    status: Option<WorkflowStatus>,
    limit: u32,
    mode: OutputMode,
) -> Result<()> {
    let instances = state
        .scheduler
        .repository()
        .list_instances(status, limit)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list instances: {e}"))?;

    if mode.json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No workflow instances yet.");
        println!();
        println!(
            "  Start one with: {}",
            style("weft run recipe_builder").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Created"),
            Cell::new("Updated"),
        ]);

    for instance in &instances {
        table.add_row(vec![
            Cell::new(short_id(&instance.id)),
            Cell::new(&instance.workflow_name),
            status_cell(instance.status),
            Cell::new(instance.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(instance.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub fn handle_workflows(state: &AppState, mode: OutputMode) -> Result<()> {
    let registry = state.scheduler.registry();
    let default_timeout = state.config.default_activity_timeout_secs;

    if mode.json {
        let mut activities = Vec::new();
        for name in registry.activity_names() {
            let activity = registry.resolve_activity(name)?;
            activities.push(serde_json::json!({
                "name": name,
                "timeout_secs": activity.options().timeout_secs.unwrap_or(default_timeout),
                "retry": activity.options().retry,
                "input_schema": activity.input_schema(),
            }));
        }
        let out = serde_json::json!({
            "workflows": registry.workflow_names(),
            "activities": activities,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {}", style("Workflows").bold());
    for name in registry.workflow_names() {
        println!("    {}", style(name).cyan());
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Activity").fg(Color::Cyan),
            Cell::new("Timeout"),
            Cell::new("Attempts"),
            Cell::new("Typed input"),
        ]);
    for name in registry.activity_names() {
        let activity = registry.resolve_activity(name)?;
        let options = activity.options();
        table.add_row(vec![
            Cell::new(name),
            Cell::new(format!("{}s", options.timeout_secs.unwrap_or(default_timeout))),
            Cell::new(options.retry.as_ref().map_or(1, |r| r.max_attempts)),
            Cell::new(if activity.input_schema().is_some() { "yes" } else { "no" }),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}
