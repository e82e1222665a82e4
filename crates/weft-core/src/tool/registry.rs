use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use weft_types::llm::ToolSpec;

type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

struct ToolEntry {
    spec: ToolSpec,
    handler: ToolHandler,
}

/// Registry of callable tools keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool whose arguments deserialise into `A`.
    ///
    /// The input schema is generated from `A`.
    pub fn register<A, O, F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Result<(), ToolError>
    where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    {
        let name = name.into();
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateName(name));
        }

        let input_schema = serde_json::to_value(schemars::schema_for!(A))
            .map_err(|e| ToolError::Execution(format!("schema generation failed: {e}")))?;
        let tool_name = name.clone();
        let handler: ToolHandler = Arc::new(move |args: Value| {
            match serde_json::from_value::<A>(args) {
                Ok(args) => {
                    let fut = handler(args);
                    async move {
                        let output = fut.await?;
                        serde_json::to_value(output)
                            .map_err(|e| ToolError::Execution(format!("serialize output: {e}")))
                    }
                    .boxed()
                }
                Err(e) => futures_util::future::ready(Err(ToolError::InvalidArguments {
                    tool: tool_name.clone(),
                    message: e.to_string(),
                }))
                .boxed(),
            }
        });

        self.tools.insert(
            name.clone(),
            ToolEntry {
                spec: ToolSpec {
                    name,
                    description: description.into(),
                    input_schema,
                },
                handler,
            },
        );
        Ok(())
    }

    /// Invoke the named tool with JSON arguments.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        tracing::debug!(tool = name, "invoking tool");
        (entry.handler)(args).await
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|entry| &entry.spec)
    }

    /// Declarations of every tool, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|e| e.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool '{0}' is already registered")]
    DuplicateName(String),

    #[error("unknown tool: '{0}'")]
    Unknown(String),

    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("tool execution failed: {0}")]
    Execution(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn registry() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools
            .register("add", "Add two integers", |args: AddArgs| async move {
                Ok(args.a + args.b)
            })
            .unwrap();
        tools
    }

    #[tokio::test]
    async fn invoke_deserialises_arguments() {
        let tools = registry();
        let sum = tools.invoke("add", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(sum, json!(5));
    }

    #[tokio::test]
    async fn invalid_arguments_are_reported() {
        let tools = registry();
        let err = tools.invoke("add", json!({"a": "x"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { ref tool, .. } if tool == "add"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let tools = registry();
        assert!(matches!(
            tools.invoke("sub", json!({})).await,
            Err(ToolError::Unknown(_))
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut tools = registry();
        let err = tools
            .register("add", "again", |args: AddArgs| async move { Ok(args.a) })
            .unwrap_err();
        assert!(matches!(err, ToolError::DuplicateName(_)));
    }

    #[test]
    fn specs_carry_generated_schema() {
        let tools = registry();
        let spec = tools.spec("add").unwrap();
        assert_eq!(spec.description, "Add two integers");
        assert!(spec.input_schema["properties"]["a"].is_object());
        assert_eq!(tools.specs().len(), 1);
    }
}
