//! Routing: classify each support ticket, then hand it to the matching
//! handler activity.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use weft_core::workflow::{ActivityError, Registry, RegistryError, WorkflowContext, WorkflowError};
use weft_types::workflow::ActivityOptions;

use super::parse_input;

pub const WORKFLOW: &str = "it_support";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Hardware,
    Software,
    Network,
    Other,
}

impl QueryType {
    /// Activity that handles tickets of this type.
    pub fn handler(self) -> &'static str {
        match self {
            QueryType::Hardware => "handle_hardware",
            QueryType::Software => "handle_software",
            QueryType::Network => "handle_network",
            QueryType::Other => "handle_other",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryType::Hardware => write!(f, "hardware"),
            QueryType::Software => write!(f, "software"),
            QueryType::Network => write!(f, "network"),
            QueryType::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RoutingDecision {
    pub query_type: QueryType,
    pub reason: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SupportQuery {
    pub query: String,
}

/// One handled ticket in the workflow result.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TicketResponse {
    pub ticket_number: usize,
    pub query: String,
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub response: String,
}

const KEYWORDS: [(QueryType, &[&str]); 3] = [
    (
        QueryType::Hardware,
        &["laptop", "power", "screen", "keyboard", "mouse", "printer", "battery", "monitor"],
    ),
    (
        QueryType::Software,
        &["app", "crash", "install", "update", "save", "error", "login", "license"],
    ),
    (
        QueryType::Network,
        &["vpn", "wifi", "wi-fi", "network", "internet", "dns", "router", "connect"],
    ),
];

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    register_activities(registry)?;
    registry.register_workflow(WORKFLOW, it_support)
}

pub fn register_activities(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_typed_activity("route_query", ActivityOptions::default(), route_query)?;
    for query_type in [
        QueryType::Hardware,
        QueryType::Software,
        QueryType::Network,
        QueryType::Other,
    ] {
        registry.register_typed_activity(
            query_type.handler(),
            ActivityOptions::default(),
            move |input: SupportQuery| handle(query_type, input),
        )?;
    }
    Ok(())
}

/// Input: a JSON array of ticket texts. Tickets are handled one at a time.
async fn it_support(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
    let tickets: Vec<String> = parse_input(WORKFLOW, input)?;

    let mut results = Vec::with_capacity(tickets.len());
    for (idx, query) in tickets.into_iter().enumerate() {
        let decision: RoutingDecision = ctx.call("route_query", json!({ "query": query })).await?;
        let response: String = ctx
            .call(decision.query_type.handler(), json!({ "query": query }))
            .await?;
        results.push(TicketResponse {
            ticket_number: idx + 1,
            query,
            query_type: decision.query_type,
            response,
        });
    }

    serde_json::to_value(results).map_err(|e| WorkflowError::failed(e.to_string()))
}

/// Keyword classifier; the category with the most hits wins, ties go to
/// the earlier category.
pub fn classify(query: &str) -> RoutingDecision {
    let lowered = query.to_lowercase();
    let mut best: Option<(QueryType, Vec<&str>)> = None;

    for (query_type, words) in KEYWORDS {
        let hits: Vec<&str> = words
            .iter()
            .copied()
            .filter(|word| lowered.contains(word))
            .collect();
        let better = match &best {
            Some((_, best_hits)) => hits.len() > best_hits.len(),
            None => !hits.is_empty(),
        };
        if better {
            best = Some((query_type, hits));
        }
    }

    match best {
        Some((query_type, hits)) => RoutingDecision {
            query_type,
            reason: format!("mentions {}", hits.join(", ")),
        },
        None => RoutingDecision {
            query_type: QueryType::Other,
            reason: "no hardware, software or network terms".to_string(),
        },
    }
}

async fn route_query(input: SupportQuery) -> Result<RoutingDecision, ActivityError> {
    if input.query.trim().is_empty() {
        return Err(ActivityError::InvalidInput("empty ticket".to_string()));
    }
    Ok(classify(&input.query))
}

async fn handle(query_type: QueryType, input: SupportQuery) -> Result<String, ActivityError> {
    let steps = match query_type {
        QueryType::Hardware => "Check the power supply and cables, hold the power button for 30 seconds, then try a different outlet.",
        QueryType::Software => "Restart the application, clear its cache, and reinstall the latest version if the problem persists.",
        QueryType::Network => "Confirm you are online, restart your router, then reconnect the VPN client with fresh credentials.",
        QueryType::Other => "Your request has been forwarded to the service desk; an agent will follow up shortly.",
    };
    Ok(format!("[{query_type}] {}: {steps}", input.query.trim()))
}
