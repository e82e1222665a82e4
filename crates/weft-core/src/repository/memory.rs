//! In-process `WorkflowRepository` backed by `DashMap`.
//!
//! Used for tests and for ephemeral runs that do not need to survive a
//! restart. Enforces the same terminal-state and position rules as the
//! SQLite implementation.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

use weft_types::error::RepositoryError;
use weft_types::workflow::{
    HistoryEvent, HistoryRecord, InstanceId, WorkflowInstance, WorkflowStatus,
};

use super::workflow::WorkflowRepository;

#[derive(Debug, Default)]
pub struct MemoryWorkflowRepository {
    instances: DashMap<InstanceId, WorkflowInstance>,
    history: DashMap<InstanceId, Vec<HistoryRecord>>,
}

impl MemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowRepository for MemoryWorkflowRepository {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        if self.instances.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(
        &self,
        id: &InstanceId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.instances.get(id).map(|entry| entry.value().clone()))
    }

    async fn update_instance_status(
        &self,
        id: &InstanceId,
        status: WorkflowStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;
        let instance = entry.value_mut();
        if instance.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "instance {id} is already {}",
                instance.status
            )));
        }
        instance.status = status;
        instance.result = result.cloned();
        instance.error = error.map(str::to_string);
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut instances: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|entry| status.is_none_or(|s| entry.status == s))
            .map(|entry| entry.value().clone())
            .collect();
        instances.sort_by(|a, b| b.id.cmp(&a.id));
        instances.truncate(limit as usize);
        Ok(instances)
    }

    async fn list_running_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut instances: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|entry| entry.status == WorkflowStatus::Running)
            .map(|entry| entry.value().clone())
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    async fn append_event(
        &self,
        id: &InstanceId,
        position: u64,
        event: &HistoryEvent,
    ) -> Result<(), RepositoryError> {
        if !self.instances.contains_key(id) {
            return Err(RepositoryError::NotFound);
        }
        let mut records = self.history.entry(*id).or_default();
        if position != records.len() as u64 {
            return Err(RepositoryError::Conflict(format!(
                "instance {id}: expected position {}, got {position}",
                records.len()
            )));
        }
        records.push(HistoryRecord {
            instance_id: *id,
            position,
            event: event.clone(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn load_history(&self, id: &InstanceId) -> Result<Vec<HistoryEvent>, RepositoryError> {
        Ok(self
            .history
            .get(id)
            .map(|records| records.iter().map(|r| r.event.clone()).collect())
            .unwrap_or_default())
    }

    async fn load_history_records(
        &self,
        id: &InstanceId,
    ) -> Result<Vec<HistoryRecord>, RepositoryError> {
        Ok(self
            .history
            .get(id)
            .map(|records| records.clone())
            .unwrap_or_default())
    }
}
