//! LLM-backed activity.
//!
//! An `LlmActivity` renders a prompt template from the activity input, sends
//! it to a provider and returns either the raw text or a JSON value extracted
//! from the reply. All parsing of model output happens here, inside the
//! activity, so workflow bodies only ever see recorded JSON.

use std::sync::Arc;

use schemars::JsonSchema;
use serde_json::Value;

use weft_types::llm::{CompletionRequest, Message, ResponseFormat, ToolSpec};
use weft_types::workflow::ActivityOptions;

use crate::workflow::registry::{ActivityError, Registry, RegistryError};

use super::box_provider::BoxLlmProvider;

const DEFAULT_MAX_TOKENS: u32 = 1024;

/// What the activity returns.
#[derive(Debug, Clone, PartialEq)]
enum OutputMode {
    Text,
    Json { schema: Option<(String, Value)> },
}

/// An activity whose handler is a single LLM completion.
#[derive(Clone)]
pub struct LlmActivity {
    provider: Arc<BoxLlmProvider>,
    model: String,
    template: String,
    system: Option<String>,
    max_tokens: u32,
    temperature: Option<f64>,
    tools: Vec<ToolSpec>,
    output: OutputMode,
}

impl LlmActivity {
    /// `template` may reference input fields as `{field}`.
    pub fn new(
        provider: Arc<BoxLlmProvider>,
        model: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            template: template.into(),
            system: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            tools: Vec::new(),
            output: OutputMode::Text,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    /// Return the first JSON document found in the reply.
    pub fn with_json_output(mut self) -> Self {
        self.output = OutputMode::Json { schema: None };
        self
    }

    /// Ask for JSON matching `T`'s schema and return the extracted document.
    pub fn with_structured_output<T: JsonSchema>(mut self) -> Self {
        let schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);
        self.output = OutputMode::Json {
            schema: Some((T::schema_name().to_string(), schema)),
        };
        self
    }

    /// Build the request for one input.
    pub fn build_request(&self, input: &Value) -> Result<CompletionRequest, ActivityError> {
        let prompt = render_prompt(&self.template, input)?;
        let response_format = match &self.output {
            OutputMode::Json {
                schema: Some((name, schema)),
            } => ResponseFormat::JsonSchema {
                name: name.clone(),
                schema: schema.clone(),
            },
            _ => ResponseFormat::Text,
        };
        Ok(CompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::user(prompt)],
            system: self.system.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: self.tools.clone(),
            response_format,
        })
    }

    /// Run one completion for `input`.
    pub async fn run(&self, input: Value) -> Result<Value, ActivityError> {
        let request = self.build_request(&input)?;
        let response = self.provider.complete(&request).await?;
        tracing::debug!(
            provider = self.provider.name(),
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "llm activity completed"
        );

        if response.content.trim().is_empty() {
            return Err(ActivityError::failed("LLM returned empty response"));
        }
        match self.output {
            OutputMode::Text => Ok(Value::String(response.content)),
            OutputMode::Json { .. } => extract_json(&response.content).ok_or_else(|| {
                ActivityError::failed("LLM response did not contain a JSON document")
            }),
        }
    }

    /// Register this activity under `name`.
    pub fn register(
        self,
        registry: &mut Registry,
        name: impl Into<String>,
        options: ActivityOptions,
    ) -> Result<(), RegistryError> {
        let activity = Arc::new(self);
        registry.register_activity_with(name, options, move |input| {
            let activity = Arc::clone(&activity);
            async move { activity.run(input).await }
        })
    }
}

impl std::fmt::Debug for LlmActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmActivity")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("output", &self.output)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Prompt rendering
// ---------------------------------------------------------------------------

/// Substitute `{field}` placeholders with values from `input`.
///
/// Object inputs fill placeholders by key; any other input fills every
/// placeholder. Strings are inserted verbatim, other values as JSON. Braces
/// that do not enclose an identifier are left alone.
pub fn render_prompt(template: &str, input: &Value) -> Result<String, ActivityError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let key_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());

        if key_len > 0 && after[key_len..].starts_with('}') {
            let key = &after[..key_len];
            let value = match input {
                Value::Object(map) => map.get(key).ok_or_else(|| {
                    ActivityError::InvalidInput(format!("prompt field '{key}' missing from input"))
                })?,
                other => other,
            };
            match value {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
            rest = &after[key_len + 1..];
        } else {
            out.push('{');
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Extract a JSON document from model text.
///
/// Tries, in order: the first fenced code block, the whole text, then the
/// span from the first `{`/`[` to the last matching closer.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(block) = fenced_block(text) {
        if let Ok(value) = serde_json::from_str(block.trim()) {
            return Some(value);
        }
    }

    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let start = trimmed.find(|c: char| c == '{' || c == '[')?;
    let closer = if trimmed[start..].starts_with('{') { '}' } else { ']' };
    let end = trimmed.rfind(closer)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Body of the first ``` fenced block, without its language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::LlmProvider;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;
    use weft_types::llm::{CompletionResponse, LlmError, StopReason, Usage};

    /// Replies with a canned text and remembers the last request.
    struct MockProvider {
        reply: String,
        last_request: Arc<Mutex<Option<CompletionRequest>>>,
    }

    impl MockProvider {
        fn replying(reply: &str) -> (Self, Arc<Mutex<Option<CompletionRequest>>>) {
            let last_request = Arc::new(Mutex::new(None));
            (
                Self {
                    reply: reply.to_string(),
                    last_request: Arc::clone(&last_request),
                },
                last_request,
            )
        }
    }

    impl LlmProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            *self.last_request.lock().unwrap() = Some(request.clone());
            Ok(CompletionResponse {
                id: "resp-mock".to_string(),
                content: self.reply.clone(),
                model: request.model.clone(),
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
            })
        }
    }

    struct FailingProvider;

    impl LlmProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::RateLimited {
                retry_after_ms: Some(1000),
            })
        }
    }

    #[derive(Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct Evaluation {
        score: u32,
        feedback: String,
    }

    #[test]
    fn render_prompt_fills_object_fields() {
        let prompt = render_prompt(
            "Create a recipe for {dish} with {count} steps",
            &json!({"dish": "ramen", "count": 3}),
        )
        .unwrap();
        assert_eq!(prompt, "Create a recipe for ramen with 3 steps");
    }

    #[test]
    fn render_prompt_uses_scalar_input_for_every_placeholder() {
        let prompt = render_prompt("Recommend a {genre} movie", &json!("noir")).unwrap();
        assert_eq!(prompt, "Recommend a noir movie");
    }

    #[test]
    fn render_prompt_leaves_non_placeholder_braces() {
        let prompt = render_prompt("Return {\"ok\": true} for {x}", &json!({"x": 1})).unwrap();
        assert_eq!(prompt, "Return {\"ok\": true} for 1");
    }

    #[test]
    fn render_prompt_reports_missing_field() {
        let err = render_prompt("Hi {name}", &json!({})).unwrap_err();
        assert!(matches!(err, ActivityError::InvalidInput(_)));
    }

    #[test]
    fn extract_json_prefers_fenced_block() {
        let text = "Here you go:\n```json\n{\"score\": 7}\n```\nThanks";
        assert_eq!(extract_json(text), Some(json!({"score": 7})));
    }

    #[test]
    fn extract_json_finds_embedded_object() {
        let text = "The evaluation is {\"score\": 9, \"feedback\": \"great\"}.";
        assert_eq!(
            extract_json(text),
            Some(json!({"score": 9, "feedback": "great"}))
        );
    }

    #[test]
    fn extract_json_handles_bare_arrays_and_garbage() {
        assert_eq!(extract_json("[1, 2]"), Some(json!([1, 2])));
        assert_eq!(extract_json("no json here"), None);
    }

    #[tokio::test]
    async fn text_activity_returns_reply_and_sends_rendered_prompt() {
        let (provider, last_request) = MockProvider::replying("Spaghetti carbonara");
        let activity = LlmActivity::new(
            Arc::new(BoxLlmProvider::new(provider)),
            "test-model",
            "Pick a {cuisine} dish",
        )
        .with_system("You are a chef");

        let output = activity.run(json!({"cuisine": "Italian"})).await.unwrap();
        assert_eq!(output, json!("Spaghetti carbonara"));

        let request = last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.messages[0].content, "Pick a Italian dish");
        assert_eq!(request.system.as_deref(), Some("You are a chef"));
        assert_eq!(request.response_format, ResponseFormat::Text);
    }

    #[tokio::test]
    async fn structured_activity_requests_schema_and_extracts_json() {
        let (provider, last_request) =
            MockProvider::replying("```json\n{\"score\": 6, \"feedback\": \"more salt\"}\n```");
        let activity = LlmActivity::new(
            Arc::new(BoxLlmProvider::new(provider)),
            "test-model",
            "Evaluate: {recipe}",
        )
        .with_structured_output::<Evaluation>();

        let output = activity.run(json!({"recipe": "soup"})).await.unwrap();
        assert_eq!(output, json!({"score": 6, "feedback": "more salt"}));

        let request = last_request.lock().unwrap().clone().unwrap();
        assert!(matches!(
            request.response_format,
            ResponseFormat::JsonSchema { ref name, .. } if name.as_str() == "Evaluation"
        ));
    }

    #[tokio::test]
    async fn empty_reply_is_an_activity_error() {
        let (provider, _) = MockProvider::replying("   ");
        let activity =
            LlmActivity::new(Arc::new(BoxLlmProvider::new(provider)), "m", "anything");
        let err = activity.run(json!(null)).await.unwrap_err();
        assert!(err.to_string().contains("empty response"));
    }

    #[tokio::test]
    async fn provider_error_becomes_activity_error() {
        let activity =
            LlmActivity::new(Arc::new(BoxLlmProvider::new(FailingProvider)), "m", "anything");
        let err = activity.run(json!(null)).await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn registered_activity_is_resolvable() {
        let (provider, _) = MockProvider::replying("ok");
        let mut registry = Registry::new();
        LlmActivity::new(Arc::new(BoxLlmProvider::new(provider)), "m", "{x}")
            .register(&mut registry, "ask", ActivityOptions::default())
            .unwrap();

        let activity = registry.resolve_activity("ask").unwrap();
        assert_eq!(activity.invoke(json!({"x": "hi"})).await.unwrap(), json!("ok"));
    }
}
