//! Replay engine: turns a workflow definition plus its recorded history into
//! the next thing the scheduler has to do.
//!
//! Every advance creates the body future from scratch and polls it exactly
//! once with a no-op waker. Calls whose outcomes are recorded resolve
//! immediately; the first unresolved call suspends the body. The result is a
//! pure function of (definition, input, history), so calling `advance` twice
//! over the same history yields the same outcome.

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::task::noop_waker;
use serde_json::Value;

use weft_types::workflow::{ActivityFailure, InstanceId, Seq};

use super::context::WorkflowContext;
use super::history::ExecutionHistory;
use super::registry::{RegistryError, WorkflowDefinition};

/// An activity call the scheduler has to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub seq: Seq,
    pub name: String,
    pub input: Value,
    /// False when the call is already recorded as scheduled but its outcome
    /// was lost (the process stopped mid-batch). Such calls are executed
    /// again without appending a second `ActivityScheduled`.
    pub newly_scheduled: bool,
}

/// Result of one advance.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorOutcome {
    /// The body is waiting on these calls.
    Suspended(Vec<PendingCall>),
    /// The body returned a value.
    Completed(Value),
    /// The body returned an error, or replay diverged from history.
    Failed(WorkflowError),
}

/// Stateless replay driver.
pub struct Orchestrator;

impl Orchestrator {
    /// Replay `definition` over `history` and report what happens next.
    pub fn advance(
        definition: &WorkflowDefinition,
        instance_id: InstanceId,
        input: &Value,
        history: &ExecutionHistory,
    ) -> OrchestratorOutcome {
        let ctx = WorkflowContext::new(instance_id, Arc::new(history.clone()));
        let mut body = definition.start(ctx.clone(), input.clone());

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let poll = body.as_mut().poll(&mut cx);
        drop(body);

        let turn = ctx.into_turn();
        if let Some(violation) = turn.violation {
            return OrchestratorOutcome::Failed(violation.into());
        }
        if turn.issued < history.scheduled_count() {
            let recorded = history
                .scheduled(turn.issued)
                .map(|call| call.name.clone())
                .unwrap_or_default();
            return OrchestratorOutcome::Failed(
                DeterminismViolation::MissingCall {
                    seq: turn.issued,
                    recorded,
                }
                .into(),
            );
        }

        match poll {
            Poll::Ready(Ok(result)) => OrchestratorOutcome::Completed(result),
            Poll::Ready(Err(err)) => OrchestratorOutcome::Failed(err),
            Poll::Pending if turn.pending.is_empty() => {
                OrchestratorOutcome::Failed(WorkflowError::Stalled)
            }
            Poll::Pending => OrchestratorOutcome::Suspended(turn.pending),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Replay produced a different call sequence than the one recorded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeterminismViolation {
    #[error("call {seq} diverged: history recorded '{recorded}', workflow issued '{issued}'")]
    NameMismatch {
        seq: Seq,
        recorded: String,
        issued: String,
    },

    #[error("call {seq} to '{name}' diverged: input differs from recorded history")]
    InputMismatch { seq: Seq, name: String },

    #[error("history records call {seq} to '{recorded}' but the workflow never issued it")]
    MissingCall { seq: Seq, recorded: String },
}

/// Why a workflow instance ended in `Failed`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    /// An activity failure the body chose to propagate.
    #[error(transparent)]
    Activity(#[from] ActivityFailure),

    #[error("determinism violation: {0}")]
    Determinism(#[from] DeterminismViolation),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// An activity output could not be read as the expected type.
    #[error("unexpected activity output: {0}")]
    Output(String),

    /// Application-level failure raised by the body.
    #[error("{0}")]
    Failed(String),

    #[error("workflow is waiting but issued no activity call")]
    Stalled,

    #[error("workflow exceeded {0} advances")]
    StepLimitExceeded(u32),
}

impl WorkflowError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::registry::Registry;
    use serde_json::json;

    fn chain() -> Arc<WorkflowDefinition> {
        let mut registry = Registry::new();
        registry
            .register_workflow("chain", |ctx, input| async move {
                let a = ctx.call_activity("a", input).await?;
                let b = ctx.call_activity("b", a).await?;
                let c = ctx.call_activity("c", b).await?;
                Ok(c)
            })
            .unwrap();
        registry.resolve_workflow("chain").unwrap()
    }

    fn fan_out(n: usize) -> Arc<WorkflowDefinition> {
        let mut registry = Registry::new();
        registry
            .register_workflow("fan", move |ctx, _input| async move {
                let calls = (0..n)
                    .map(|i| ctx.call_activity("work", json!(i)))
                    .collect();
                let results = ctx.try_when_all(calls).await?;
                Ok(Value::Array(results))
            })
            .unwrap();
        registry.resolve_workflow("fan").unwrap()
    }

    fn suspended_seqs(outcome: &OrchestratorOutcome) -> Vec<Seq> {
        match outcome {
            OrchestratorOutcome::Suspended(calls) => calls.iter().map(|c| c.seq).collect(),
            other => panic!("expected Suspended, got {other:?}"),
        }
    }

    #[test]
    fn empty_history_suspends_on_first_call() {
        let def = chain();
        let id = InstanceId::new();
        let outcome = Orchestrator::advance(&def, id, &json!(1), &ExecutionHistory::new());
        assert_eq!(
            outcome,
            OrchestratorOutcome::Suspended(vec![PendingCall {
                seq: 0,
                name: "a".to_string(),
                input: json!(1),
                newly_scheduled: true,
            }])
        );
    }

    #[test]
    fn chain_completes_from_full_history() {
        let def = chain();
        let id = InstanceId::new();
        let mut history = ExecutionHistory::new();
        for (name, input, output) in [("a", 1, 2), ("b", 2, 3), ("c", 3, 4)] {
            let seq = history.schedule(name, json!(input));
            history.record_completion(seq, json!(output)).unwrap();
        }

        let first = Orchestrator::advance(&def, id, &json!(1), &history);
        let second = Orchestrator::advance(&def, id, &json!(1), &history);
        assert_eq!(first, OrchestratorOutcome::Completed(json!(4)));
        assert_eq!(first, second);
    }

    #[test]
    fn replaying_a_prefix_never_changes_recorded_events() {
        let def = chain();
        let id = InstanceId::new();
        let mut history = ExecutionHistory::new();
        history.schedule("a", json!(1));
        history.record_completion(0, json!(2)).unwrap();
        history.schedule("b", json!(2));
        history.record_completion(1, json!(3)).unwrap();

        for n in 0..=history.len() {
            let prefix = history.truncated(n);
            let before = prefix.events().to_vec();
            let outcome = Orchestrator::advance(&def, id, &json!(1), &prefix);
            assert_eq!(prefix.events(), before.as_slice());
            assert!(matches!(outcome, OrchestratorOutcome::Suspended(_)));
        }
    }

    #[test]
    fn scheduled_but_unrecorded_call_is_pending_not_new() {
        let def = chain();
        let mut history = ExecutionHistory::new();
        history.schedule("a", json!(1));

        let outcome = Orchestrator::advance(&def, InstanceId::new(), &json!(1), &history);
        match outcome {
            OrchestratorOutcome::Suspended(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].seq, 0);
                assert!(!calls[0].newly_scheduled);
            }
            other => panic!("expected Suspended, got {other:?}"),
        }
    }

    #[test]
    fn fan_out_issues_whole_batch_in_one_advance() {
        let def = fan_out(3);
        let outcome =
            Orchestrator::advance(&def, InstanceId::new(), &json!(null), &ExecutionHistory::new());
        assert_eq!(suspended_seqs(&outcome), vec![0, 1, 2]);
    }

    #[test]
    fn fan_in_waits_for_every_result_in_any_completion_order() {
        let def = fan_out(3);
        let id = InstanceId::new();
        let mut history = ExecutionHistory::new();
        for i in 0..3 {
            history.schedule("work", json!(i));
        }

        // Completion order 2, 0, then 1.
        history.record_completion(2, json!("r2")).unwrap();
        let outcome = Orchestrator::advance(&def, id, &json!(null), &history);
        assert_eq!(suspended_seqs(&outcome), vec![0, 1]);

        history.record_completion(0, json!("r0")).unwrap();
        let outcome = Orchestrator::advance(&def, id, &json!(null), &history);
        assert_eq!(suspended_seqs(&outcome), vec![1]);

        history.record_completion(1, json!("r1")).unwrap();
        let outcome = Orchestrator::advance(&def, id, &json!(null), &history);
        assert_eq!(
            outcome,
            OrchestratorOutcome::Completed(json!(["r0", "r1", "r2"]))
        );
    }

    #[test]
    fn recorded_failure_propagates_to_body() {
        let def = chain();
        let mut history = ExecutionHistory::new();
        history.schedule("a", json!(1));
        history
            .record_failure(0, ActivityFailure::execution("boom"))
            .unwrap();

        let outcome = Orchestrator::advance(&def, InstanceId::new(), &json!(1), &history);
        assert_eq!(
            outcome,
            OrchestratorOutcome::Failed(WorkflowError::Activity(ActivityFailure::execution(
                "boom"
            )))
        );
    }

    #[test]
    fn divergent_name_is_a_determinism_violation() {
        let def = chain();
        let mut history = ExecutionHistory::new();
        history.schedule("not_a", json!(1));

        let outcome = Orchestrator::advance(&def, InstanceId::new(), &json!(1), &history);
        assert!(matches!(
            outcome,
            OrchestratorOutcome::Failed(WorkflowError::Determinism(
                DeterminismViolation::NameMismatch { seq: 0, .. }
            ))
        ));
    }

    #[test]
    fn divergent_input_is_a_determinism_violation() {
        let def = chain();
        let mut history = ExecutionHistory::new();
        history.schedule("a", json!("different"));

        let outcome = Orchestrator::advance(&def, InstanceId::new(), &json!(1), &history);
        assert!(matches!(
            outcome,
            OrchestratorOutcome::Failed(WorkflowError::Determinism(
                DeterminismViolation::InputMismatch { seq: 0, .. }
            ))
        ));
    }

    #[test]
    fn history_longer_than_issued_calls_is_a_violation() {
        let mut registry = Registry::new();
        registry
            .register_workflow("short", |_ctx, input| async move { Ok(input) })
            .unwrap();
        let def = registry.resolve_workflow("short").unwrap();

        let mut history = ExecutionHistory::new();
        history.schedule("a", json!(1));
        history.record_completion(0, json!(2)).unwrap();

        let outcome = Orchestrator::advance(&def, InstanceId::new(), &json!(1), &history);
        assert!(matches!(
            outcome,
            OrchestratorOutcome::Failed(WorkflowError::Determinism(
                DeterminismViolation::MissingCall { seq: 0, .. }
            ))
        ));
    }

    #[test]
    fn body_waiting_on_nothing_is_stalled() {
        let mut registry = Registry::new();
        registry
            .register_workflow("stuck", |_ctx, _input| async move {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            })
            .unwrap();
        let def = registry.resolve_workflow("stuck").unwrap();
        let outcome =
            Orchestrator::advance(&def, InstanceId::new(), &json!(null), &ExecutionHistory::new());
        assert_eq!(outcome, OrchestratorOutcome::Failed(WorkflowError::Stalled));
    }

    #[test]
    fn context_reports_replay_state() {
        let mut registry = Registry::new();
        registry
            .register_workflow("probe", |ctx, _input| async move {
                let first = ctx.call_activity("a", json!(null));
                let replayed = ctx.is_replaying();
                first.await?;
                let _second = ctx.call_activity("b", json!(null));
                Ok(json!({ "replayed": replayed, "after": ctx.is_replaying() }))
            })
            .unwrap();
        let def = registry.resolve_workflow("probe").unwrap();

        let mut history = ExecutionHistory::new();
        history.schedule("a", json!(null));
        history.record_completion(0, json!(1)).unwrap();

        let outcome = Orchestrator::advance(&def, InstanceId::new(), &json!(null), &history);
        assert_eq!(
            outcome,
            OrchestratorOutcome::Completed(json!({ "replayed": true, "after": false }))
        );
    }
}
