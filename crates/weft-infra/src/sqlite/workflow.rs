//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `weft-core` using sqlx with split
//! read/write pools. Instance inputs, results and history events are stored
//! as JSON text. History positions are unique per instance, so a second
//! writer racing for the same slot gets a `Conflict` instead of a fork.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;
use weft_core::repository::workflow::WorkflowRepository;
use weft_types::error::RepositoryError;
use weft_types::workflow::{
    HistoryEvent, HistoryRecord, InstanceId, WorkflowInstance, WorkflowStatus,
};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    workflow_name: String,
    input: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            input: row.try_get("input")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let id = InstanceId::from_uuid(parse_uuid(&self.id)?);
        let status = parse_status(&self.status)?;
        let input: Value = serde_json::from_str(&self.input)
            .map_err(|e| RepositoryError::Query(format!("invalid input JSON: {e}")))?;
        let result = self
            .result
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid result JSON: {e}")))
            })
            .transpose()?;

        Ok(WorkflowInstance {
            id,
            workflow_name: self.workflow_name,
            input,
            status,
            result,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct HistoryRow {
    instance_id: String,
    position: i64,
    event: String,
    recorded_at: String,
}

impl HistoryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            position: row.try_get("position")?,
            event: row.try_get("event")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_record(self) -> Result<HistoryRecord, RepositoryError> {
        Ok(HistoryRecord {
            instance_id: InstanceId::from_uuid(parse_uuid(&self.instance_id)?),
            position: u64::try_from(self.position).map_err(|_| {
                RepositoryError::Query(format!("invalid history position: {}", self.position))
            })?,
            event: parse_event(&self.event)?,
            recorded_at: parse_datetime(&self.recorded_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_status(s: &str) -> Result<WorkflowStatus, RepositoryError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid workflow status: {s}")))
}

fn status_str(status: WorkflowStatus) -> Result<String, RepositoryError> {
    match serde_json::to_value(status).map_err(|e| RepositoryError::Query(e.to_string()))? {
        Value::String(s) => Ok(s),
        other => Err(RepositoryError::Query(format!(
            "unexpected status encoding: {other}"
        ))),
    }
}

fn parse_event(s: &str) -> Result<HistoryEvent, RepositoryError> {
    serde_json::from_str(s)
        .map_err(|e| RepositoryError::Query(format!("invalid history event JSON: {e}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let input = serde_json::to_string(&instance.input)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let result = instance
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
                (id, workflow_name, input, status, result, error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.workflow_name)
        .bind(&input)
        .bind(status_str(instance.status)?)
        .bind(&result)
        .bind(&instance.error)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("instance {} already exists", instance.id))
            } else {
                RepositoryError::Query(e.to_string())
            }
        })?;

        Ok(())
    }

    async fn get_instance(
        &self,
        id: &InstanceId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn update_instance_status(
        &self,
        id: &InstanceId,
        status: WorkflowStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result_str = result
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let outcome = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = ?, result = ?, error = ?, updated_at = ?
               WHERE id = ? AND status = 'running'"#,
        )
        .bind(status_str(status)?)
        .bind(&result_str)
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if outcome.rows_affected() == 0 {
            // Distinguish a missing instance from one that already finished.
            let current: Option<(String,)> =
                sqlx::query_as("SELECT status FROM workflow_instances WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool.writer)
                    .await
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
            return match current {
                Some((current,)) => Err(RepositoryError::Conflict(format!(
                    "instance {id} is already {current}"
                ))),
                None => Err(RepositoryError::NotFound),
            };
        }

        Ok(())
    }

    async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM workflow_instances WHERE status = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(status_str(status)?)
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_instances ORDER BY id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn list_running_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_instances WHERE status = 'running' ORDER BY id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn append_event(
        &self,
        id: &InstanceId,
        position: u64,
        event: &HistoryEvent,
    ) -> Result<(), RepositoryError> {
        let event_json =
            serde_json::to_string(event).map_err(|e| RepositoryError::Query(e.to_string()))?;
        let position_i64 = i64::try_from(position)
            .map_err(|_| RepositoryError::Query(format!("position {position} out of range")))?;

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM workflow_instances WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
        if exists.is_none() {
            return Err(RepositoryError::NotFound);
        }

        let (len,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workflow_history WHERE instance_id = ?")
                .bind(id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
        if len != position_i64 {
            return Err(RepositoryError::Conflict(format!(
                "instance {id}: expected position {len}, got {position}"
            )));
        }

        sqlx::query(
            r#"INSERT INTO workflow_history
                (instance_id, position, seq, kind, event, recorded_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(position_i64)
        .bind(event.seq() as i64)
        .bind(event.kind())
        .bind(&event_json)
        .bind(format_datetime(&Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!(
                    "instance {id}: position {position} already recorded"
                ))
            } else {
                RepositoryError::Query(e.to_string())
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn load_history(&self, id: &InstanceId) -> Result<Vec<HistoryEvent>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT event FROM workflow_history WHERE instance_id = ? ORDER BY position ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(|(event,)| parse_event(event)).collect()
    }

    async fn load_history_records(
        &self,
        id: &InstanceId,
    ) -> Result<Vec<HistoryRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_history WHERE instance_id = ? ORDER BY position ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r =
                HistoryRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }
}
