//! Evaluate-refine loop: draft a recipe, score it against criteria, and
//! refine with the evaluator's feedback until it passes or the iteration
//! budget runs out.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use weft_core::workflow::{ActivityError, Registry, RegistryError, WorkflowContext, WorkflowError};
use weft_types::workflow::ActivityOptions;

use super::parse_input;

pub const WORKFLOW: &str = "recipe_refinement";

fn default_max_iterations() -> u32 {
    2
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct RefinementRequest {
    /// What to cook, e.g. "a healthy vegan breakfast".
    pub request: String,
    /// Comma-separated criteria, e.g. "high protein, low sugar".
    pub criteria: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenerateInput {
    pub request: String,
    #[serde(default)]
    pub feedback: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EvaluateInput {
    pub recipe: String,
    pub criteria: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Evaluation {
    /// Quality score from 1 to 10.
    pub score: u32,
    pub feedback: Vec<String>,
    pub meets_criteria: bool,
}

/// Workflow result.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RefinementResult {
    pub final_recipe: String,
    /// Evaluation rounds performed.
    pub iterations: u32,
    pub final_score: u32,
}

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    register_activities(registry)?;
    register_workflow(registry)
}

pub fn register_workflow(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_workflow(WORKFLOW, recipe_refinement)
}

pub fn register_activities(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_typed_activity("generate_recipe", ActivityOptions::default(), generate_recipe)?;
    registry.register_typed_activity("evaluate_recipe", ActivityOptions::default(), evaluate_recipe)
}

async fn recipe_refinement(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
    let params: RefinementRequest = parse_input(WORKFLOW, input)?;

    let mut recipe: String = ctx
        .call(
            "generate_recipe",
            json!({ "request": params.request, "feedback": null }),
        )
        .await?;

    let mut iterations = 0;
    let mut final_score = 0;
    while iterations < params.max_iterations {
        iterations += 1;
        let evaluation: Evaluation = ctx
            .call(
                "evaluate_recipe",
                json!({ "recipe": recipe, "criteria": params.criteria }),
            )
            .await?;
        final_score = evaluation.score;
        if evaluation.meets_criteria {
            break;
        }

        recipe = ctx
            .call(
                "generate_recipe",
                json!({ "request": params.request, "feedback": evaluation.feedback }),
            )
            .await?;
    }

    serde_json::to_value(RefinementResult {
        final_recipe: recipe,
        iterations,
        final_score,
    })
    .map_err(|e| WorkflowError::failed(e.to_string()))
}

fn criteria_list(criteria: &str) -> Vec<String> {
    criteria
        .split(',')
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

async fn generate_recipe(input: GenerateInput) -> Result<String, ActivityError> {
    let mut recipe = format!(
        "Recipe: {}\n- Combine oats, berries and a splash of plant milk.\n- Serve chilled.",
        input.request.trim()
    );
    if let Some(feedback) = input.feedback.filter(|f| !f.is_empty()) {
        recipe.push_str("\nAdjustments:");
        for item in feedback {
            recipe.push_str("\n- ");
            recipe.push_str(&item);
        }
    }
    Ok(recipe)
}

/// Scores by the share of criteria the recipe text mentions.
async fn evaluate_recipe(input: EvaluateInput) -> Result<Evaluation, ActivityError> {
    let criteria = criteria_list(&input.criteria);
    if criteria.is_empty() {
        return Err(ActivityError::InvalidInput("no criteria given".to_string()));
    }

    let text = input.recipe.to_lowercase();
    let missing: Vec<&String> = criteria.iter().filter(|c| !text.contains(c.as_str())).collect();
    let met = criteria.len() - missing.len();
    let score = (1 + 9 * met / criteria.len()) as u32;

    Ok(Evaluation {
        score,
        feedback: missing.iter().map(|c| format!("make it {c}")).collect(),
        meets_criteria: missing.is_empty(),
    })
}
