//! Orchestrator-workers: break a request into subtasks, run one worker per
//! subtask, then synthesise the worker outputs into a single plan.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use weft_core::workflow::{ActivityError, Registry, RegistryError, WorkflowContext, WorkflowError};
use weft_types::workflow::ActivityOptions;

use super::parse_input;

pub const WORKFLOW: &str = "conference_planner";

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct PlanRequest {
    pub request: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ConferenceTask {
    pub task_id: String,
    pub description: String,
    /// Prompt handed to the worker.
    pub query: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct OrchestratorPlan {
    pub tasks: Vec<ConferenceTask>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TaskInput {
    pub task: ConferenceTask,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct WorkerOutput {
    pub task_id: String,
    pub result: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SynthesisInput {
    pub request: String,
    pub results: Vec<WorkerOutput>,
}

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    register_activities(registry)?;
    registry.register_workflow(WORKFLOW, conference_planner)
}

pub fn register_activities(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_typed_activity("create_plan", ActivityOptions::default(), create_plan)?;
    registry.register_typed_activity("execute_task", ActivityOptions::default(), execute_task)?;
    registry.register_typed_activity("synthesize_plan", ActivityOptions::default(), synthesize_plan)
}

async fn conference_planner(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
    let params: PlanRequest = parse_input(WORKFLOW, input)?;

    let plan: OrchestratorPlan = ctx
        .call("create_plan", json!({ "request": params.request }))
        .await?;
    tracing::debug!(tasks = plan.tasks.len(), "conference plan created");

    // Workers are independent, so they run as one batch.
    let calls = plan
        .tasks
        .iter()
        .map(|task| ctx.call_activity("execute_task", json!({ "task": task })))
        .collect();
    let outputs = ctx.try_when_all(calls).await?;

    let mut results = Vec::with_capacity(outputs.len());
    for (task, output) in plan.tasks.iter().zip(outputs) {
        let result = match output {
            Value::String(s) => s,
            other => other.to_string(),
        };
        results.push(WorkerOutput {
            task_id: task.task_id.clone(),
            result,
        });
    }

    let final_plan = ctx
        .call_activity(
            "synthesize_plan",
            json!({ "request": params.request, "results": results }),
        )
        .await?;
    Ok(final_plan)
}

/// Each `- item` line of the request becomes a task; a request without any
/// falls back to venue, speakers and schedule.
async fn create_plan(input: PlanRequest) -> Result<OrchestratorPlan, ActivityError> {
    let request = input.request.trim();
    if request.is_empty() {
        return Err(ActivityError::InvalidInput("empty request".to_string()));
    }

    let mut items: Vec<String> = request
        .lines()
        .filter_map(|line| line.trim().strip_prefix('-'))
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();
    if items.is_empty() {
        items = vec![
            "Find a venue".to_string(),
            "Book keynote and panel speakers".to_string(),
            "Draft a day-by-day schedule".to_string(),
        ];
    }

    let summary = request.lines().next().unwrap_or(request).trim();
    Ok(OrchestratorPlan {
        tasks: items
            .into_iter()
            .enumerate()
            .map(|(i, description)| ConferenceTask {
                task_id: format!("task-{}", i + 1),
                query: format!("{description} for: {summary}"),
                description,
            })
            .collect(),
    })
}

async fn execute_task(input: TaskInput) -> Result<String, ActivityError> {
    Ok(format!(
        "{}: proposal drafted ({})",
        input.task.description, input.task.query
    ))
}

async fn synthesize_plan(input: SynthesisInput) -> Result<String, ActivityError> {
    let mut plan = format!("Conference plan\nRequest: {}\n", input.request.trim());
    for output in &input.results {
        plan.push_str(&format!("\n[{}] {}", output.task_id, output.result));
    }
    Ok(plan)
}
