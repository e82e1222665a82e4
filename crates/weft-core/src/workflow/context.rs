//! Per-advance context handed to a workflow definition body.
//!
//! The context hands out sequence numbers in call order and resolves each
//! call against the recorded history. Nothing here performs I/O: calls
//! without a recorded outcome stay pending and are collected so the
//! scheduler can execute them after the advance returns.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::future::{JoinAll, join_all};
use serde::de::DeserializeOwned;
use serde_json::Value;

use weft_types::workflow::{ActivityFailure, InstanceId, Seq};

use super::history::ExecutionHistory;
use super::orchestrator::{DeterminismViolation, PendingCall, WorkflowError};

/// Mutable bookkeeping for one advance.
#[derive(Debug)]
struct TurnState {
    history: Arc<ExecutionHistory>,
    next_seq: Seq,
    pending: Vec<PendingCall>,
    violation: Option<DeterminismViolation>,
    replaying: bool,
}

/// What one advance issued, collected after the body was polled.
#[derive(Debug)]
pub(crate) struct Turn {
    pub issued: Seq,
    pub pending: Vec<PendingCall>,
    pub violation: Option<DeterminismViolation>,
}

/// Handle the workflow body uses to call activities.
///
/// Cheap to clone; all clones share the state of the current advance.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    instance_id: InstanceId,
    state: Arc<Mutex<TurnState>>,
}

impl WorkflowContext {
    pub(crate) fn new(instance_id: InstanceId, history: Arc<ExecutionHistory>) -> Self {
        let replaying = !history.is_empty();
        Self {
            instance_id,
            state: Arc::new(Mutex::new(TurnState {
                history,
                next_seq: 0,
                pending: Vec::new(),
                violation: None,
                replaying,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TurnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// True while the most recent call was answered from recorded history.
    ///
    /// Use it to keep side-effect-free logging from repeating on every replay.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    /// Issue an activity call. The returned future resolves once the call's
    /// outcome is recorded in history.
    pub fn call_activity(&self, name: impl Into<String>, input: Value) -> ActivityCall {
        let name = name.into();
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let recorded = state.history.scheduled(seq).cloned();
        match recorded {
            Some(recorded) => {
                let divergence = if recorded.name != name {
                    Some(DeterminismViolation::NameMismatch {
                        seq,
                        recorded: recorded.name,
                        issued: name,
                    })
                } else if recorded.input != input {
                    Some(DeterminismViolation::InputMismatch { seq, name })
                } else {
                    let resolved = state.history.outcome(seq).is_some();
                    state.replaying = resolved;
                    if !resolved {
                        // Scheduled earlier but never recorded: execute again.
                        state.pending.push(PendingCall {
                            seq,
                            name: recorded.name,
                            input: recorded.input,
                            newly_scheduled: false,
                        });
                    }
                    None
                };
                if let Some(violation) = divergence {
                    state.violation.get_or_insert(violation);
                }
            }
            None => {
                state.replaying = false;
                state.pending.push(PendingCall {
                    seq,
                    name,
                    input,
                    newly_scheduled: true,
                });
            }
        }

        ActivityCall {
            ctx: self.clone(),
            seq,
        }
    }

    /// Call an activity and deserialise its output into `T`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: Value,
    ) -> Result<T, WorkflowError> {
        let name = name.into();
        let output = self.call_activity(name.clone(), input).await?;
        serde_json::from_value(output)
            .map_err(|e| WorkflowError::Output(format!("{name}: {e}")))
    }

    /// Await every call; results come back in issuance order.
    ///
    /// All calls are issued before the first poll, so a fan-out is scheduled
    /// as one batch and the join resolves only when every result is recorded.
    pub fn when_all(&self, calls: Vec<ActivityCall>) -> JoinAll<ActivityCall> {
        join_all(calls)
    }

    /// Like [`when_all`](Self::when_all), failing with the first failure in
    /// issuance order once every call has an outcome.
    pub async fn try_when_all(
        &self,
        calls: Vec<ActivityCall>,
    ) -> Result<Vec<Value>, ActivityFailure> {
        join_all(calls).await.into_iter().collect()
    }

    pub(crate) fn into_turn(self) -> Turn {
        let mut state = self.lock();
        Turn {
            issued: state.next_seq,
            pending: std::mem::take(&mut state.pending),
            violation: state.violation.take(),
        }
    }
}

/// Future of a single activity call, keyed by its sequence number.
#[derive(Debug)]
#[must_use = "an activity call does nothing useful unless awaited"]
pub struct ActivityCall {
    ctx: WorkflowContext,
    seq: Seq,
}

impl ActivityCall {
    pub fn seq(&self) -> Seq {
        self.seq
    }
}

impl Future for ActivityCall {
    type Output = Result<Value, ActivityFailure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = self.ctx.lock();
        if state.violation.is_some() {
            // The advance is aborted; do not let the body run further.
            return Poll::Pending;
        }
        match state.history.outcome(self.seq) {
            Some(Ok(output)) => Poll::Ready(Ok(output.clone())),
            Some(Err(failure)) => Poll::Ready(Err(failure.clone())),
            None => Poll::Pending,
        }
    }
}
