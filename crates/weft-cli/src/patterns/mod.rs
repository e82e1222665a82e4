//! Built-in pattern workflows.
//!
//! Each submodule registers one workflow definition plus the activities it
//! calls. Activities are deterministic stand-ins for LLM-backed steps: they
//! take the same typed inputs and return the same shapes a prompt-driven
//! activity would, so the orchestration is exercised without a provider.
//!
//! To put a model behind a step, register the workflow and the stand-ins you
//! keep, then register an [`weft_core::llm::LlmActivity`] under the name of
//! the step it replaces, e.g. `LlmActivity::new(provider, model, "Write a
//! recipe for {dish}").register(&mut registry, "summarize_recipe", options)`.
//! The workflow body is unchanged; only the recorded outputs differ.
//!
//! | Workflow             | Pattern                     |
//! |----------------------|-----------------------------|
//! | `recipe_builder`     | sequential chain            |
//! | `movie_night`        | fan-out / fan-in            |
//! | `it_support`         | routing                     |
//! | `recipe_refinement`  | evaluate-refine loop        |
//! | `conference_planner` | orchestrator-workers        |
//! | `job_application`    | chain with tool-backed step |

pub mod chaining;
pub mod evaluator;
pub mod fan_out;
pub mod job_application;
pub mod orchestrator;
pub mod routing;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use weft_core::workflow::{Registry, WorkflowError};

/// Registry holding every built-in workflow and its activities.
pub fn builtin_registry() -> anyhow::Result<Registry> {
    let mut registry = Registry::new();
    chaining::register(&mut registry)?;
    fan_out::register(&mut registry)?;
    routing::register(&mut registry)?;
    evaluator::register(&mut registry)?;
    orchestrator::register(&mut registry)?;
    job_application::register(&mut registry, Arc::new(job_application::tools()?))?;
    Ok(registry)
}

/// Deserialise a workflow's input, failing the instance on mismatch.
pub(crate) fn parse_input<T: DeserializeOwned>(workflow: &str, input: Value) -> Result<T, WorkflowError> {
    serde_json::from_value(input)
        .map_err(|e| WorkflowError::failed(format!("{workflow}: invalid input: {e}")))
}

/// Clock-derived index in `0..len`; activities may be nondeterministic,
/// their recorded output is what replay sees.
pub(crate) fn clock_pick(len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    chrono::Utc::now().timestamp_subsec_nanos() as usize % len
}
