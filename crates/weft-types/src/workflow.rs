//! Workflow domain types for Weft.
//!
//! Defines the durable shape of a workflow instance: its identity and status,
//! the append-only event history used for replay, activity failure descriptors,
//! and the per-activity execution options (timeout, retry policy).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Instance identity
// ---------------------------------------------------------------------------

/// Unique identifier for a workflow instance, wrapping a UUID v7 (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    /// Create a new InstanceId using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create an InstanceId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Instance status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Whether no further events will ever be appended for this instance.
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow instance (durable record)
// ---------------------------------------------------------------------------

/// One running or finished execution of a registered workflow definition.
///
/// The event history lives separately (see [`HistoryEvent`]); this record
/// only carries identity, input, status and the terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    /// Name of the workflow definition this instance executes.
    pub workflow_name: String,
    /// JSON input passed to the definition on every replay.
    pub input: Value,
    pub status: WorkflowStatus,
    /// Final result, set only when `status == Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Originating error descriptor, set only when `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Build a fresh `Running` instance for the given workflow and input.
    pub fn new(workflow_name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            workflow_name: workflow_name.into(),
            input,
            status: WorkflowStatus::Running,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// History events
// ---------------------------------------------------------------------------

/// Sequence number correlating an activity call with its outcome.
///
/// Assigned when the call is scheduled, strictly increasing per instance.
pub type Seq = u64;

/// An immutable entry in an instance's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// The orchestrator issued an activity call.
    ActivityScheduled { seq: Seq, name: String, input: Value },
    /// The activity returned a value.
    ActivityCompleted { seq: Seq, output: Value },
    /// The activity failed (error, timeout, bad input).
    ActivityFailed { seq: Seq, failure: ActivityFailure },
}

impl HistoryEvent {
    /// The correlation sequence number carried by every variant.
    pub fn seq(&self) -> Seq {
        match self {
            HistoryEvent::ActivityScheduled { seq, .. }
            | HistoryEvent::ActivityCompleted { seq, .. }
            | HistoryEvent::ActivityFailed { seq, .. } => *seq,
        }
    }

    /// Short kind label used for storage and display.
    pub fn kind(&self) -> &'static str {
        match self {
            HistoryEvent::ActivityScheduled { .. } => "activity_scheduled",
            HistoryEvent::ActivityCompleted { .. } => "activity_completed",
            HistoryEvent::ActivityFailed { .. } => "activity_failed",
        }
    }

    /// Whether this event resolves a previously scheduled call.
    pub fn is_outcome(&self) -> bool {
        !matches!(self, HistoryEvent::ActivityScheduled { .. })
    }
}

/// A history event as persisted: its append position and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub instance_id: InstanceId,
    /// 0-based append position within the instance's history.
    pub position: u64,
    pub event: HistoryEvent,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Activity failures
// ---------------------------------------------------------------------------

/// Why an activity call did not produce an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an error.
    Execution,
    /// The handler exceeded its configured timeout.
    Timeout,
    /// The input did not match the activity's declared input type.
    InvalidInput,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Execution => write!(f, "execution"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::InvalidInput => write!(f, "invalid_input"),
        }
    }
}

/// Error descriptor recorded in an `ActivityFailed` event.
///
/// This is data, not a fatal error: the workflow definition receives it and
/// decides whether to retry, branch, or propagate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("activity {kind} failure after {attempts} attempt(s): {message}")]
pub struct ActivityFailure {
    pub kind: FailureKind,
    pub message: String,
    /// How many attempts were made before giving up (1 without a retry policy).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl ActivityFailure {
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Execution,
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn timeout(timeout_secs: u64) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("activity timed out after {timeout_secs}s"),
            attempts: 1,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::InvalidInput,
            message: message.into(),
            attempts: 1,
        }
    }

    /// Return the same failure annotated with the number of attempts made.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout
    }
}

// ---------------------------------------------------------------------------
// Activity options
// ---------------------------------------------------------------------------

/// Per-activity execution options applied by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Timeout in seconds (falls back to the engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Automatic retry policy. Without one, a single failure is recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl ActivityOptions {
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Exponential-backoff retry policy for an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Whether timeouts are retried as well as execution errors.
    #[serde(default = "default_retry_timeouts")]
    pub retry_timeouts: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_retry_timeouts() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_timeouts: default_retry_timeouts(),
        }
    }
}

impl RetryPolicy {
    /// A policy with `max_attempts` and no delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
