//! Explicit registry of workflow definitions and activity handlers.
//!
//! Built once per process, then frozen behind an `Arc` and handed to the
//! scheduler. Names are unique per kind; re-registering a name is an error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use weft_types::llm::LlmError;
use weft_types::workflow::{ActivityFailure, ActivityOptions};

use super::context::WorkflowContext;
use super::orchestrator::WorkflowError;

// ---------------------------------------------------------------------------
// Activities
// ---------------------------------------------------------------------------

/// Error returned by an activity handler.
///
/// The scheduler records it as an `ActivityFailed` event; it never aborts the
/// instance by itself.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ActivityError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Convert into the failure descriptor stored in history.
    pub fn into_failure(self) -> ActivityFailure {
        match self {
            ActivityError::Failed(message) => ActivityFailure::execution(message),
            ActivityError::InvalidInput(message) => ActivityFailure::invalid_input(message),
        }
    }
}

impl From<LlmError> for ActivityError {
    fn from(err: LlmError) -> Self {
        ActivityError::Failed(err.to_string())
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        ActivityError::Failed(format!("serialization error: {err}"))
    }
}

/// Type-erased activity handler: JSON in, JSON out.
pub type ActivityHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ActivityError>> + Send + Sync>;

/// A registered activity: handler plus execution options.
pub struct ActivityDefinition {
    name: String,
    options: ActivityOptions,
    input_schema: Option<Value>,
    handler: ActivityHandler,
}

impl ActivityDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ActivityOptions {
        &self.options
    }

    /// JSON schema of the declared input type, for typed activities.
    pub fn input_schema(&self) -> Option<&Value> {
        self.input_schema.as_ref()
    }

    /// Start one execution of the handler.
    pub fn invoke(&self, input: Value) -> BoxFuture<'static, Result<Value, ActivityError>> {
        (self.handler)(input)
    }
}

impl std::fmt::Debug for ActivityDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("typed", &self.input_schema.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

type WorkflowBody =
    Arc<dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<Value, WorkflowError>> + Send + Sync>;

/// A registered workflow definition.
///
/// The body must be deterministic: given the same input and the same recorded
/// activity results it has to issue the same calls in the same order.
pub struct WorkflowDefinition {
    name: String,
    body: WorkflowBody,
}

impl WorkflowDefinition {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(move |ctx: WorkflowContext, input: Value| body(ctx, input).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a fresh future for the body. Called once per advance.
    pub fn start(
        &self,
        ctx: WorkflowContext,
        input: Value,
    ) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        (self.body)(ctx, input)
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name -> definition mappings for workflows and activities.
#[derive(Default)]
pub struct Registry {
    activities: HashMap<String, Arc<ActivityDefinition>>,
    workflows: HashMap<String, Arc<WorkflowDefinition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity with default options.
    pub fn register_activity<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        self.register_activity_with(name, ActivityOptions::default(), handler)
    }

    /// Register an activity with explicit timeout / retry options.
    pub fn register_activity_with<F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: ActivityOptions,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |input: Value| handler(input).boxed());
        self.insert_activity(name.into(), options, None, handler)
    }

    /// Register an activity whose input is deserialised into `I`.
    ///
    /// Input that does not match `I` is recorded as an `InvalidInput` failure
    /// without calling the handler. The JSON schema of `I` is kept on the
    /// definition.
    pub fn register_typed_activity<I, O, F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: ActivityOptions,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        I: DeserializeOwned + JsonSchema + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    {
        let schema = serde_json::to_value(schemars::schema_for!(I)).ok();
        let handler: ActivityHandler = Arc::new(move |input: Value| {
            match serde_json::from_value::<I>(input) {
                Ok(typed) => {
                    let fut = handler(typed);
                    async move {
                        let output = fut.await?;
                        serde_json::to_value(output).map_err(ActivityError::from)
                    }
                    .boxed()
                }
                Err(e) => {
                    futures_util::future::ready(Err(ActivityError::InvalidInput(e.to_string())))
                        .boxed()
                }
            }
        });
        self.insert_activity(name.into(), options, schema, handler)
    }

    fn insert_activity(
        &mut self,
        name: String,
        options: ActivityOptions,
        input_schema: Option<Value>,
        handler: ActivityHandler,
    ) -> Result<(), RegistryError> {
        if self.activities.contains_key(&name) {
            return Err(RegistryError::DuplicateName {
                kind: "activity",
                name,
            });
        }
        tracing::debug!(activity = %name, "registered activity");
        self.activities.insert(
            name.clone(),
            Arc::new(ActivityDefinition {
                name,
                options,
                input_schema,
                handler,
            }),
        );
        Ok(())
    }

    pub fn resolve_activity(&self, name: &str) -> Result<Arc<ActivityDefinition>, RegistryError> {
        self.activities
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownActivity(name.to_string()))
    }

    pub fn register_workflow<F, Fut>(
        &mut self,
        name: impl Into<String>,
        body: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        let definition = WorkflowDefinition::new(name, body);
        if self.workflows.contains_key(definition.name()) {
            return Err(RegistryError::DuplicateName {
                kind: "workflow",
                name: definition.name,
            });
        }
        tracing::debug!(workflow = %definition.name, "registered workflow");
        self.workflows
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn resolve_workflow(&self, name: &str) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflow(name.to_string()))
    }

    /// Registered activity names, sorted.
    pub fn activity_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.activities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered workflow names, sorted.
    pub fn workflow_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("activities", &self.activity_names())
            .field("workflows", &self.workflow_names())
            .finish()
    }
}

/// Registry misuse. Always a programmer error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{kind} '{name}' is already registered")]
    DuplicateName { kind: &'static str, name: String },

    #[error("unknown activity: '{0}'")]
    UnknownActivity(String),

    #[error("unknown workflow: '{0}'")]
    UnknownWorkflow(String),
}
