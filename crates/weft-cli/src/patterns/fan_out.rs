//! Fan-out / fan-in: pick genres, recommend one movie per genre in parallel,
//! then summarise the picks.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use weft_core::workflow::{ActivityError, Registry, RegistryError, WorkflowContext, WorkflowError};
use weft_types::workflow::ActivityOptions;

use super::{clock_pick, parse_input};

pub const WORKFLOW: &str = "movie_night";

const GENRES: [&str; 5] = ["Action", "Comedy", "Sci-Fi", "Drama", "Horror"];
const DEFAULT_COUNT: usize = 3;

/// Workflow input. Explicit `genres` skip the random pick.
#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct MovieNightRequest {
    #[serde(default)]
    pub genres: Option<Vec<String>>,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Genre {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Genres {
    pub genres: Vec<Genre>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenreInput {
    pub genre: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlanInput {
    pub recommendations: Vec<String>,
}

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    register_activities(registry)?;
    registry.register_workflow(WORKFLOW, movie_night)
}

pub fn register_activities(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_typed_activity("pick_genres", ActivityOptions::default(), pick_genres)?;
    registry.register_typed_activity("recommend_movie", ActivityOptions::default(), recommend_movie)?;
    registry.register_typed_activity("summarize_plan", ActivityOptions::default(), summarize_plan)
}

async fn movie_night(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
    let request: MovieNightRequest = parse_input(WORKFLOW, input)?;

    let picked: Genres = ctx
        .call(
            "pick_genres",
            json!({ "genres": request.genres, "count": request.count }),
        )
        .await?;

    let calls = picked
        .genres
        .iter()
        .map(|genre| ctx.call_activity("recommend_movie", json!({ "genre": genre.name })))
        .collect();
    let recommendations = ctx.try_when_all(calls).await?;

    let plan = ctx
        .call_activity("summarize_plan", json!({ "recommendations": recommendations }))
        .await?;
    Ok(plan)
}

async fn pick_genres(request: MovieNightRequest) -> Result<Genres, ActivityError> {
    let names: Vec<String> = match request.genres {
        Some(genres) => genres,
        None => {
            let count = request.count.unwrap_or(DEFAULT_COUNT).min(GENRES.len());
            let offset = clock_pick(GENRES.len());
            (0..count)
                .map(|i| GENRES[(offset + i) % GENRES.len()].to_string())
                .collect()
        }
    };
    Ok(Genres {
        genres: names.into_iter().map(|name| Genre { name }).collect(),
    })
}

async fn recommend_movie(input: GenreInput) -> Result<String, ActivityError> {
    let title = match input.genre.as_str() {
        "Action" => "Mad Max: Fury Road",
        "Comedy" => "The Grand Budapest Hotel",
        "Sci-Fi" => "Interstellar",
        "Drama" => "The Shawshank Redemption",
        "Horror" => "Get Out",
        _ => "Unknown",
    };
    Ok(format!("{}: {title}", input.genre))
}

async fn summarize_plan(input: PlanInput) -> Result<String, ActivityError> {
    Ok(format!("Movie Night Picks:\n{}", input.recommendations.join("\n")))
}
