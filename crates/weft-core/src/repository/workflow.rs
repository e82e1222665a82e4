//! Workflow repository trait definition.
//!
//! Defines the durable state store for workflow instances and their event
//! histories. The infrastructure layer (weft-infra) implements this trait
//! with SQLite persistence; [`super::memory::MemoryWorkflowRepository`] keeps
//! everything in process.

use serde_json::Value;

use weft_types::error::RepositoryError;
use weft_types::workflow::{
    HistoryEvent, HistoryRecord, InstanceId, WorkflowInstance, WorkflowStatus,
};

/// Repository trait for workflow instance persistence.
///
/// Covers two entity families:
/// - **Instances:** create/query records and move them to a terminal status.
/// - **History:** append-only event log per instance, keyed by position.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Create a new instance record.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an instance by id.
    fn get_instance(
        &self,
        id: &InstanceId,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Move a `Running` instance to `status`, storing the result or error.
    ///
    /// Terminal states are final: updating an instance that is no longer
    /// `Running` fails with `RepositoryError::Conflict`, and an unknown id
    /// with `RepositoryError::NotFound`.
    fn update_instance_status(
        &self,
        id: &InstanceId,
        status: WorkflowStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List instances, newest first, optionally filtered by status.
    fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// All instances still `Running` (crash recovery candidates), oldest first.
    fn list_running_instances(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Append an event at `position`. Positions are 0-based and contiguous;
    /// writing a position that already exists fails with `Conflict`.
    fn append_event(
        &self,
        id: &InstanceId,
        position: u64,
        event: &HistoryEvent,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load an instance's history in append order.
    fn load_history(
        &self,
        id: &InstanceId,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryEvent>, RepositoryError>> + Send;

    /// Load the history with positions and timestamps, for display.
    fn load_history_records(
        &self,
        id: &InstanceId,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryRecord>, RepositoryError>> + Send;
}
