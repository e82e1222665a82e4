//! Event types for the Weft lifecycle event bus.
//!
//! `EngineEvent` is broadcast by the scheduler as instances and activities
//! progress. All variants are Clone + Send + Sync for use with tokio broadcast
//! channels.

use serde::{Deserialize, Serialize};

use crate::workflow::{InstanceId, Seq};

/// Events emitted while driving workflow instances.
///
/// Subscribers (CLI progress output, tests) observe these; they carry no
/// authority and are never used for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new instance was created.
    InstanceStarted {
        instance_id: InstanceId,
        workflow_name: String,
    },

    /// An existing instance is being resumed from its recorded history.
    InstanceResumed {
        instance_id: InstanceId,
        workflow_name: String,
        replayed_events: usize,
    },

    /// The orchestrator suspended with a batch of new activity calls.
    BatchScheduled {
        instance_id: InstanceId,
        seqs: Vec<Seq>,
    },

    /// An activity call started executing.
    ActivityStarted {
        instance_id: InstanceId,
        seq: Seq,
        name: String,
        attempt: u32,
    },

    /// An activity call completed successfully.
    ActivityCompleted {
        instance_id: InstanceId,
        seq: Seq,
        name: String,
        duration_ms: u64,
    },

    /// An activity attempt failed.
    ActivityFailed {
        instance_id: InstanceId,
        seq: Seq,
        name: String,
        error: String,
        will_retry: bool,
    },

    /// The instance reached `Completed`.
    InstanceCompleted {
        instance_id: InstanceId,
        workflow_name: String,
        duration_ms: u64,
        activities_completed: u32,
    },

    /// The instance reached `Failed`.
    InstanceFailed {
        instance_id: InstanceId,
        workflow_name: String,
        error: String,
    },

    /// The instance was cancelled.
    InstanceCancelled { instance_id: InstanceId },
}

impl EngineEvent {
    /// The instance every variant refers to.
    pub fn instance_id(&self) -> InstanceId {
        match self {
            EngineEvent::InstanceStarted { instance_id, .. }
            | EngineEvent::InstanceResumed { instance_id, .. }
            | EngineEvent::BatchScheduled { instance_id, .. }
            | EngineEvent::ActivityStarted { instance_id, .. }
            | EngineEvent::ActivityCompleted { instance_id, .. }
            | EngineEvent::ActivityFailed { instance_id, .. }
            | EngineEvent::InstanceCompleted { instance_id, .. }
            | EngineEvent::InstanceFailed { instance_id, .. }
            | EngineEvent::InstanceCancelled { instance_id } => *instance_id,
        }
    }

    /// Whether this event marks the end of an instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::InstanceCompleted { .. }
                | EngineEvent::InstanceFailed { .. }
                | EngineEvent::InstanceCancelled { .. }
        )
    }
}
