//! Durable workflow execution.
//!
//! - `registry`: explicit name -> definition mappings for workflows/activities
//! - `history`: validated append-only event history of one instance
//! - `context`: the handle a workflow body uses to call activities
//! - `orchestrator`: replay engine turning history into the next action
//! - `retry`: activity retry decisions and backoff
//! - `scheduler`: drives instances against a repository

pub mod context;
pub mod history;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod scheduler;

pub use context::{ActivityCall, WorkflowContext};
pub use history::{ExecutionHistory, HistoryError};
pub use orchestrator::{
    DeterminismViolation, Orchestrator, OrchestratorOutcome, PendingCall, WorkflowError,
};
pub use registry::{ActivityDefinition, ActivityError, Registry, RegistryError, WorkflowDefinition};
pub use scheduler::{InstanceScheduler, SchedulerError};
