//! Sequential chain: pick a dish, look up its ingredients, summarise.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use weft_core::workflow::{ActivityError, Registry, RegistryError, WorkflowContext, WorkflowError};
use weft_types::workflow::ActivityOptions;

use super::{clock_pick, parse_input};

pub const WORKFLOW: &str = "recipe_builder";

const DISHES: [&str; 3] = ["pasta", "salad", "stir-fry"];

/// Workflow input. Without a `dish`, one is picked at random.
#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct RecipeRequest {
    #[serde(default)]
    pub dish: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DishInput {
    pub dish: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Ingredients {
    pub items: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SummaryInput {
    pub dish: String,
    pub ingredients: Ingredients,
}

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    register_activities(registry)?;
    registry.register_workflow(WORKFLOW, recipe_builder)
}

pub fn register_activities(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_typed_activity("pick_dish", ActivityOptions::default(), pick_dish)?;
    registry.register_typed_activity("get_ingredients", ActivityOptions::default(), get_ingredients)?;
    registry.register_typed_activity("summarize_recipe", ActivityOptions::default(), summarize_recipe)
}

async fn recipe_builder(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
    let request: RecipeRequest = parse_input(WORKFLOW, input)?;

    let dish: String = ctx.call("pick_dish", json!({ "dish": request.dish })).await?;
    let ingredients = ctx
        .call_activity("get_ingredients", json!({ "dish": dish }))
        .await?;
    let recipe = ctx
        .call_activity(
            "summarize_recipe",
            json!({ "dish": dish, "ingredients": ingredients }),
        )
        .await?;
    Ok(recipe)
}

async fn pick_dish(request: RecipeRequest) -> Result<String, ActivityError> {
    Ok(request
        .dish
        .unwrap_or_else(|| DISHES[clock_pick(DISHES.len())].to_string()))
}

async fn get_ingredients(input: DishInput) -> Result<Ingredients, ActivityError> {
    let items: &[&str] = match input.dish.as_str() {
        "pasta" => &["spaghetti", "tomato sauce", "garlic"],
        "salad" => &["lettuce", "tomato", "feta cheese"],
        "stir-fry" => &["chicken", "broccoli", "soy sauce"],
        _ => &[],
    };
    Ok(Ingredients {
        items: items.iter().map(|s| s.to_string()).collect(),
    })
}

async fn summarize_recipe(input: SummaryInput) -> Result<String, ActivityError> {
    if input.ingredients.items.is_empty() {
        return Err(ActivityError::failed(format!(
            "no ingredients known for '{}'",
            input.dish
        )));
    }
    Ok(format!(
        "To make {}, you'll need: {}.",
        input.dish,
        input.ingredients.items.join(", ")
    ))
}
