//! Instance scheduler: drives workflow instances to a terminal state.
//!
//! The scheduler repeatedly advances the orchestrator over the instance's
//! history. Each suspension yields a batch of activity calls, which is
//! checkpointed (`ActivityScheduled` appended) before execution, then run
//! concurrently in a `JoinSet` bounded by a semaphore. Every outcome is
//! appended under the seq assigned at scheduling, in completion order, and
//! the orchestrator is advanced again once the whole batch is recorded.
//!
//! # Execution flow
//!
//! 1. Create a `WorkflowInstance` record (or load an existing one to resume).
//! 2. Rebuild the `ExecutionHistory` from the repository.
//! 3. Advance: `Completed` / `Failed` end the instance; `Suspended` yields calls.
//! 4. Persist new `ActivityScheduled` events, execute the batch with timeouts
//!    and retries, persist each outcome as it finishes.
//! 5. Repeat until terminal, cancelled, or the advance cap is reached.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use weft_types::config::EngineConfig;
use weft_types::error::RepositoryError;
use weft_types::event::EngineEvent;
use weft_types::workflow::{
    ActivityFailure, HistoryEvent, InstanceId, Seq, WorkflowInstance, WorkflowStatus,
};

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::history::{ExecutionHistory, HistoryError};
use super::orchestrator::{Orchestrator, OrchestratorOutcome, PendingCall, WorkflowError};
use super::registry::{ActivityDefinition, Registry, RegistryError, WorkflowDefinition};
use super::retry::RetryHandler;

/// How a drive loop ended.
#[derive(Debug)]
enum DriveEnd {
    Completed(Value),
    Failed(String),
    Cancelled,
}

// ---------------------------------------------------------------------------
// InstanceScheduler
// ---------------------------------------------------------------------------

/// Drives workflow instances against a repository.
///
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct InstanceScheduler<R: WorkflowRepository> {
    registry: Arc<Registry>,
    repo: Arc<R>,
    config: EngineConfig,
    event_bus: EventBus,
    /// One drive per instance at a time.
    instance_locks: DashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>,
    /// Cancellation tokens for instances currently being driven.
    cancellation_tokens: DashMap<InstanceId, CancellationToken>,
}

impl<R: WorkflowRepository + 'static> InstanceScheduler<R> {
    pub fn new(registry: Arc<Registry>, repo: Arc<R>, config: EngineConfig) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        Self::with_event_bus(registry, repo, config, event_bus)
    }

    pub fn with_event_bus(
        registry: Arc<Registry>,
        repo: Arc<R>,
        config: EngineConfig,
        event_bus: EventBus,
    ) -> Self {
        Self {
            registry,
            repo,
            config,
            event_bus,
            instance_locks: DashMap::new(),
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Create a `Running` instance without executing anything.
    pub async fn start(
        &self,
        workflow_name: &str,
        input: Value,
    ) -> Result<InstanceId, SchedulerError> {
        self.registry.resolve_workflow(workflow_name)?;

        let instance = WorkflowInstance::new(workflow_name, input);
        self.repo.create_instance(&instance).await?;

        tracing::info!(
            instance_id = %instance.id,
            workflow = workflow_name,
            "workflow instance created"
        );
        self.event_bus.publish(EngineEvent::InstanceStarted {
            instance_id: instance.id,
            workflow_name: workflow_name.to_string(),
        });
        Ok(instance.id)
    }

    /// Start an instance and drive it to a terminal state.
    pub async fn run(
        &self,
        workflow_name: &str,
        input: Value,
    ) -> Result<WorkflowInstance, SchedulerError> {
        let id = self.start(workflow_name, input).await?;
        self.drive(id).await
    }

    /// Drive an existing instance from its recorded history.
    ///
    /// Terminal instances return their recorded outcome untouched.
    pub async fn resume(&self, id: InstanceId) -> Result<WorkflowInstance, SchedulerError> {
        self.drive(id).await
    }

    /// Resume every instance left `Running`, one after another.
    pub async fn recover_all(
        &self,
    ) -> Result<Vec<(InstanceId, Result<WorkflowInstance, SchedulerError>)>, SchedulerError> {
        let running = self.repo.list_running_instances().await?;
        tracing::info!(count = running.len(), "recovering running instances");

        let mut outcomes = Vec::with_capacity(running.len());
        for instance in running {
            let outcome = self.resume(instance.id).await;
            if let Err(ref e) = outcome {
                tracing::error!(instance_id = %instance.id, error = %e, "recovery failed");
            }
            outcomes.push((instance.id, outcome));
        }
        Ok(outcomes)
    }

    /// Cancel a `Running` instance.
    ///
    /// Returns `false` if the instance had already reached a terminal state.
    /// Activities already executing finish and their outcomes are recorded,
    /// but the workflow is not advanced again.
    pub async fn cancel(&self, id: InstanceId) -> Result<bool, SchedulerError> {
        let instance = self
            .repo
            .get_instance(&id)
            .await?
            .ok_or(SchedulerError::InstanceNotFound(id))?;
        if instance.status.is_terminal() {
            return Ok(false);
        }

        match self
            .repo
            .update_instance_status(&id, WorkflowStatus::Cancelled, None, None)
            .await
        {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        if let Some(token) = self.cancellation_tokens.get(&id) {
            token.cancel();
        }

        tracing::info!(instance_id = %id, "workflow instance cancelled");
        self.event_bus
            .publish(EngineEvent::InstanceCancelled { instance_id: id });
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Drive loop
    // -----------------------------------------------------------------------

    async fn drive(&self, id: InstanceId) -> Result<WorkflowInstance, SchedulerError> {
        let lock = self.instance_locks.entry(id).or_default().clone();
        let outcome = {
            let _guard = lock.lock().await;
            self.drive_locked(id).await
        };
        drop(lock);
        self.release_lock(&id);
        outcome
    }

    async fn drive_locked(&self, id: InstanceId) -> Result<WorkflowInstance, SchedulerError> {
        let instance = self
            .repo
            .get_instance(&id)
            .await?
            .ok_or(SchedulerError::InstanceNotFound(id))?;
        if instance.status.is_terminal() {
            tracing::debug!(instance_id = %id, status = %instance.status, "instance already terminal");
            return Ok(instance);
        }

        let definition = match self.registry.resolve_workflow(&instance.workflow_name) {
            Ok(definition) => definition,
            Err(e) => {
                return self
                    .finish(&instance, DriveEnd::Failed(e.to_string()), 0, Instant::now())
                    .await;
            }
        };

        let mut history = ExecutionHistory::from_events(self.repo.load_history(&id).await?)?;
        if !history.is_empty() {
            tracing::info!(
                instance_id = %id,
                workflow = %instance.workflow_name,
                events = history.len(),
                "resuming workflow instance from history"
            );
            self.event_bus.publish(EngineEvent::InstanceResumed {
                instance_id: id,
                workflow_name: instance.workflow_name.clone(),
                replayed_events: history.len(),
            });
        }

        let token = self
            .cancellation_tokens
            .entry(id)
            .or_default()
            .clone();
        let started = Instant::now();
        let result = self
            .drive_loop(&instance, &definition, &mut history, &token)
            .await;
        self.cancellation_tokens.remove(&id);

        let end = match result {
            Ok(_) if token.is_cancelled() => DriveEnd::Cancelled,
            Ok(end) => end,
            Err(e) => {
                tracing::error!(instance_id = %id, error = %e, "drive aborted");
                return Err(e);
            }
        };
        self.finish(&instance, end, history.completed_count(), started)
            .await
    }

    async fn drive_loop(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        history: &mut ExecutionHistory,
        token: &CancellationToken,
    ) -> Result<DriveEnd, SchedulerError> {
        let id = instance.id;

        for advance in 0..self.config.max_advances {
            if token.is_cancelled() {
                return Ok(DriveEnd::Cancelled);
            }
            // A cancel issued by another process is only visible in the store.
            if advance > 0 && self.stopped_elsewhere(&id).await? {
                token.cancel();
                return Ok(DriveEnd::Cancelled);
            }

            let pending = match Orchestrator::advance(definition, id, &instance.input, history) {
                OrchestratorOutcome::Completed(result) => return Ok(DriveEnd::Completed(result)),
                OrchestratorOutcome::Failed(err) => return Ok(DriveEnd::Failed(err.to_string())),
                OrchestratorOutcome::Suspended(pending) => pending,
            };

            let mut batch = Vec::with_capacity(pending.len());
            for call in pending {
                let activity = match self.registry.resolve_activity(&call.name) {
                    Ok(activity) => activity,
                    Err(e) => {
                        tracing::error!(instance_id = %id, seq = call.seq, error = %e, "cannot dispatch activity");
                        return Ok(DriveEnd::Failed(e.to_string()));
                    }
                };
                batch.push((call, activity));
            }

            // Checkpoint the batch before anything executes.
            for (call, _) in batch.iter().filter(|(call, _)| call.newly_scheduled) {
                let seq = history.schedule(call.name.clone(), call.input.clone());
                if seq != call.seq {
                    return Err(HistoryError::OutOfOrder {
                        expected: seq,
                        actual: call.seq,
                    }
                    .into());
                }
                let position = history.len() as u64 - 1;
                self.repo
                    .append_event(&id, position, &history.events()[position as usize])
                    .await?;
            }

            tracing::debug!(
                instance_id = %id,
                advance,
                calls = batch.len(),
                "executing activity batch"
            );
            // A cancel may have landed while the batch was being checkpointed.
            if token.is_cancelled() {
                return Ok(DriveEnd::Cancelled);
            }
            self.event_bus.publish(EngineEvent::BatchScheduled {
                instance_id: id,
                seqs: batch.iter().map(|(call, _)| call.seq).collect(),
            });
            self.execute_batch(id, batch, history).await?;
        }

        Ok(DriveEnd::Failed(
            WorkflowError::StepLimitExceeded(self.config.max_advances).to_string(),
        ))
    }

    async fn stopped_elsewhere(&self, id: &InstanceId) -> Result<bool, SchedulerError> {
        let current = self.repo.get_instance(id).await?;
        Ok(current.is_none_or(|instance| instance.status.is_terminal()))
    }

    /// Run one batch concurrently and record every outcome as it arrives.
    async fn execute_batch(
        &self,
        id: InstanceId,
        batch: Vec<(PendingCall, Arc<ActivityDefinition>)>,
        history: &mut ExecutionHistory,
    ) -> Result<(), SchedulerError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_activities.max(1)));
        let mut join_set = JoinSet::new();

        let mut task_seqs = HashMap::with_capacity(batch.len());

        for (call, activity) in batch {
            let semaphore = Arc::clone(&semaphore);
            let event_bus = self.event_bus.clone();
            let default_timeout = self.config.default_activity_timeout_secs;
            let seq = call.seq;

            let handle = join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                execute_activity(id, &call, &activity, default_timeout, &event_bus).await
            });
            task_seqs.insert(handle.id(), seq);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            let (seq, outcome) = match joined {
                Ok((task_id, outcome)) => (task_seq(&task_seqs, task_id)?, outcome),
                // The task died outside the activity guard; its seq still gets an outcome.
                Err(e) => {
                    let seq = task_seq(&task_seqs, e.id())?;
                    tracing::error!(instance_id = %id, seq, error = %e, "activity task aborted");
                    (seq, Err(ActivityFailure::execution(format!("activity task failed: {e}"))))
                }
            };
            let event = match outcome {
                Ok(output) => HistoryEvent::ActivityCompleted { seq, output },
                Err(failure) => HistoryEvent::ActivityFailed { seq, failure },
            };
            let position = history.append(event.clone())?;
            self.repo.append_event(&id, position, &event).await?;
        }
        Ok(())
    }

    /// Release the per-instance lock entry once no other drive holds it.
    fn release_lock(&self, id: &InstanceId) {
        self.instance_locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Store the terminal status and publish the matching event.
    async fn finish(
        &self,
        instance: &WorkflowInstance,
        end: DriveEnd,
        activities_completed: usize,
        started: Instant,
    ) -> Result<WorkflowInstance, SchedulerError> {
        let id = instance.id;
        let update = match &end {
            DriveEnd::Completed(result) => {
                self.repo
                    .update_instance_status(&id, WorkflowStatus::Completed, Some(result), None)
                    .await
            }
            DriveEnd::Failed(error) => {
                self.repo
                    .update_instance_status(&id, WorkflowStatus::Failed, None, Some(error))
                    .await
            }
            DriveEnd::Cancelled => {
                self.repo
                    .update_instance_status(&id, WorkflowStatus::Cancelled, None, None)
                    .await
            }
        };

        match update {
            Ok(()) => match end {
                DriveEnd::Completed(_) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(instance_id = %id, duration_ms, "workflow instance completed");
                    self.event_bus.publish(EngineEvent::InstanceCompleted {
                        instance_id: id,
                        workflow_name: instance.workflow_name.clone(),
                        duration_ms,
                        activities_completed: activities_completed as u32,
                    });
                }
                DriveEnd::Failed(error) => {
                    tracing::warn!(instance_id = %id, error = %error, "workflow instance failed");
                    self.event_bus.publish(EngineEvent::InstanceFailed {
                        instance_id: id,
                        workflow_name: instance.workflow_name.clone(),
                        error,
                    });
                }
                DriveEnd::Cancelled => {
                    self.event_bus
                        .publish(EngineEvent::InstanceCancelled { instance_id: id });
                }
            },
            // Someone else (a cancel) already moved the instance on.
            Err(RepositoryError::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.repo
            .get_instance(&id)
            .await?
            .ok_or(SchedulerError::InstanceNotFound(id))
    }
}

// ---------------------------------------------------------------------------
// Activity execution
// ---------------------------------------------------------------------------

/// Execute one activity call, applying its timeout and retry policy.
async fn execute_activity(
    instance_id: InstanceId,
    call: &PendingCall,
    activity: &ActivityDefinition,
    default_timeout_secs: u64,
    event_bus: &EventBus,
) -> Result<Value, ActivityFailure> {
    let options = activity.options();
    let timeout_secs = options.timeout_secs.unwrap_or(default_timeout_secs);
    let mut attempt = 1;

    loop {
        event_bus.publish(EngineEvent::ActivityStarted {
            instance_id,
            seq: call.seq,
            name: call.name.clone(),
            attempt,
        });
        let started = Instant::now();

        let failure = match run_attempt(activity, call.input.clone(), timeout_secs).await {
            Ok(output) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(
                    instance_id = %instance_id,
                    seq = call.seq,
                    activity = %call.name,
                    duration_ms,
                    "activity completed"
                );
                event_bus.publish(EngineEvent::ActivityCompleted {
                    instance_id,
                    seq: call.seq,
                    name: call.name.clone(),
                    duration_ms,
                });
                return Ok(output);
            }
            Err(failure) => failure.with_attempts(attempt),
        };

        let policy = options
            .retry
            .as_ref()
            .filter(|policy| RetryHandler::should_retry(policy, attempt, &failure));

        tracing::warn!(
            instance_id = %instance_id,
            seq = call.seq,
            activity = %call.name,
            attempt,
            will_retry = policy.is_some(),
            error = %failure.message,
            "activity attempt failed"
        );
        event_bus.publish(EngineEvent::ActivityFailed {
            instance_id,
            seq: call.seq,
            name: call.name.clone(),
            error: failure.message.clone(),
            will_retry: policy.is_some(),
        });

        match policy {
            Some(policy) => {
                tokio::time::sleep(RetryHandler::backoff_delay(policy, attempt)).await;
                attempt += 1;
            }
            None => return Err(failure),
        }
    }
}

/// One attempt under a timeout. A panicking handler counts as a failure,
/// whether it panics while building its future or while it runs.
async fn run_attempt(
    activity: &ActivityDefinition,
    input: Value,
    timeout_secs: u64,
) -> Result<Value, ActivityFailure> {
    let guarded = AssertUnwindSafe(async move { activity.invoke(input).await }).catch_unwind();
    match tokio::time::timeout(Duration::from_secs(timeout_secs), guarded).await {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(err))) => Err(err.into_failure()),
        Ok(Err(_panic)) => Err(ActivityFailure::execution("activity panicked")),
        Err(_elapsed) => Err(ActivityFailure::timeout(timeout_secs)),
    }
}

fn task_seq(
    task_seqs: &HashMap<tokio::task::Id, Seq>,
    task_id: tokio::task::Id,
) -> Result<Seq, SchedulerError> {
    task_seqs
        .get(&task_id)
        .copied()
        .ok_or_else(|| SchedulerError::Join(format!("no activity recorded for task {task_id}")))
}

// ---------------------------------------------------------------------------
// SchedulerError
// ---------------------------------------------------------------------------

/// Errors that stop the scheduler from driving an instance.
///
/// Workflow and activity failures are not here: they end the instance as
/// `Failed` and are reported through `WorkflowInstance::error`.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("corrupt history: {0}")]
    History(#[from] HistoryError),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("task join error: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};

    use serde_json::json;
    use weft_types::workflow::{ActivityOptions, FailureKind, HistoryRecord, RetryPolicy};

    use crate::repository::memory::MemoryWorkflowRepository;
    use crate::workflow::registry::ActivityError;

    type Counters = Arc<DashMap<&'static str, u32>>;

    fn bump(counters: &Counters, name: &'static str) {
        *counters.entry(name).or_insert(0) += 1;
    }

    fn count(counters: &Counters, name: &'static str) -> u32 {
        counters.get(name).map(|c| *c).unwrap_or(0)
    }

    /// `chain`: a -> b -> c, each activity appends its own name to a string.
    fn chain_registry(counters: &Counters) -> Registry {
        let mut registry = Registry::new();
        for name in ["a", "b", "c"] {
            let counters = Arc::clone(counters);
            registry
                .register_activity(name, move |input| {
                    let counters = Arc::clone(&counters);
                    async move {
                        bump(&counters, name);
                        let prefix = input.as_str().unwrap_or_default().to_string();
                        Ok(json!(format!("{prefix}{name}")))
                    }
                })
                .unwrap();
        }
        registry
            .register_workflow("chain", |ctx, input| async move {
                let a = ctx.call_activity("a", input).await?;
                let b = ctx.call_activity("b", a).await?;
                let c = ctx.call_activity("c", b).await?;
                Ok(c)
            })
            .unwrap();
        registry
    }

    fn scheduler(registry: Registry) -> InstanceScheduler<MemoryWorkflowRepository> {
        InstanceScheduler::new(
            Arc::new(registry),
            Arc::new(MemoryWorkflowRepository::new()),
            EngineConfig::default(),
        )
    }

    fn scheduled(seq: u64, name: &str, input: Value) -> HistoryEvent {
        HistoryEvent::ActivityScheduled {
            seq,
            name: name.to_string(),
            input,
        }
    }

    #[tokio::test]
    async fn chain_runs_to_completion() {
        let counters = Counters::default();
        let scheduler = scheduler(chain_registry(&counters));

        let instance = scheduler.run("chain", json!(">")).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(instance.result, Some(json!(">abc")));
        assert!(instance.error.is_none());

        let history = scheduler.repository().load_history(&instance.id).await.unwrap();
        assert_eq!(history.len(), 6);
        assert_eq!(count(&counters, "a"), 1);
    }

    #[tokio::test]
    async fn chain_survives_restart_after_first_step() {
        let counters = Counters::default();
        let repo = Arc::new(MemoryWorkflowRepository::new());

        // First process: created the instance and finished step A, then died.
        let instance = WorkflowInstance::new("chain", json!(">"));
        repo.create_instance(&instance).await.unwrap();
        repo.append_event(&instance.id, 0, &scheduled(0, "a", json!(">")))
            .await
            .unwrap();
        repo.append_event(
            &instance.id,
            1,
            &HistoryEvent::ActivityCompleted {
                seq: 0,
                output: json!(">a"),
            },
        )
        .await
        .unwrap();

        // Second process: fresh registry and scheduler over the same store.
        let scheduler = InstanceScheduler::new(
            Arc::new(chain_registry(&counters)),
            Arc::clone(&repo),
            EngineConfig::default(),
        );
        let resumed = scheduler.resume(instance.id).await.unwrap();

        assert_eq!(resumed.status, WorkflowStatus::Completed);
        assert_eq!(resumed.result, Some(json!(">abc")));
        assert_eq!(count(&counters, "a"), 0);
        assert_eq!(count(&counters, "b"), 1);
        assert_eq!(count(&counters, "c"), 1);
    }

    #[tokio::test]
    async fn scheduled_call_with_lost_outcome_is_executed_again_once() {
        let counters = Counters::default();
        let repo = Arc::new(MemoryWorkflowRepository::new());
        let instance = WorkflowInstance::new("chain", json!(">"));
        repo.create_instance(&instance).await.unwrap();
        repo.append_event(&instance.id, 0, &scheduled(0, "a", json!(">")))
            .await
            .unwrap();

        let scheduler = InstanceScheduler::new(
            Arc::new(chain_registry(&counters)),
            Arc::clone(&repo),
            EngineConfig::default(),
        );
        let resumed = scheduler.resume(instance.id).await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Completed);
        assert_eq!(count(&counters, "a"), 1);

        let history = repo.load_history(&instance.id).await.unwrap();
        let scheduled_a = history
            .iter()
            .filter(|e| matches!(e, HistoryEvent::ActivityScheduled { seq: 0, .. }))
            .count();
        assert_eq!(scheduled_a, 1);
    }

    #[tokio::test]
    async fn fan_out_results_keep_issuance_order() {
        let mut registry = Registry::new();
        registry
            .register_activity("slow_echo", |input| async move {
                // Later items finish first.
                let i = input.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis((5 - i) * 10)).await;
                Ok(input)
            })
            .unwrap();
        registry
            .register_workflow("fan", |ctx, _input| async move {
                let calls = (0..5u64)
                    .map(|i| ctx.call_activity("slow_echo", json!(i)))
                    .collect();
                Ok(Value::Array(ctx.try_when_all(calls).await?))
            })
            .unwrap();
        let scheduler = scheduler(registry);

        let instance = scheduler.run("fan", Value::Null).await.unwrap();
        assert_eq!(instance.result, Some(json!([0, 1, 2, 3, 4])));

        let history = scheduler.repository().load_history(&instance.id).await.unwrap();
        let completion_order: Vec<u64> = history
            .iter()
            .filter(|e| e.is_outcome())
            .map(|e| e.seq())
            .collect();
        assert_eq!(completion_order.len(), 5);
        assert_ne!(completion_order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn batch_respects_concurrency_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            registry
                .register_activity("work", move |input| {
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(input)
                    }
                })
                .unwrap();
        }
        registry
            .register_workflow("fan", |ctx, _input| async move {
                let calls = (0..6).map(|i| ctx.call_activity("work", json!(i))).collect();
                ctx.try_when_all(calls).await?;
                Ok(Value::Null)
            })
            .unwrap();

        let config = EngineConfig {
            max_concurrent_activities: 2,
            ..EngineConfig::default()
        };
        let scheduler = InstanceScheduler::new(
            Arc::new(registry),
            Arc::new(MemoryWorkflowRepository::new()),
            config,
        );
        let instance = scheduler.run("fan", Value::Null).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn propagated_activity_failure_fails_instance_verbatim() {
        let mut registry = Registry::new();
        registry
            .register_activity("flaky", |_input| async move {
                Err(ActivityError::failed("LLM returned empty response"))
            })
            .unwrap();
        registry
            .register_workflow("wf", |ctx, input| async move {
                Ok(ctx.call_activity("flaky", input).await?)
            })
            .unwrap();
        let scheduler = scheduler(registry);

        let instance = scheduler.run("wf", Value::Null).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert!(instance.result.is_none());
        let expected = ActivityFailure::execution("LLM returned empty response").to_string();
        assert_eq!(instance.error.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn retry_policy_retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        {
            let attempts = Arc::clone(&attempts);
            registry
                .register_activity_with(
                    "flaky",
                    ActivityOptions::default().with_retry(RetryPolicy::immediate(3)),
                    move |_input| {
                        let attempts = Arc::clone(&attempts);
                        async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                                Err(ActivityError::failed("transient"))
                            } else {
                                Ok(json!("ok"))
                            }
                        }
                    },
                )
                .unwrap();
        }
        registry
            .register_workflow("wf", |ctx, input| async move {
                Ok(ctx.call_activity("flaky", input).await?)
            })
            .unwrap();
        let scheduler = scheduler(registry);

        let instance = scheduler.run("wf", Value::Null).await.unwrap();
        assert_eq!(instance.result, Some(json!("ok")));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let history = scheduler.repository().load_history(&instance.id).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_record_attempt_count() {
        let mut registry = Registry::new();
        registry
            .register_activity_with(
                "broken",
                ActivityOptions::default().with_retry(RetryPolicy::immediate(2)),
                |_input| async move { Err(ActivityError::failed("still broken")) },
            )
            .unwrap();
        registry
            .register_workflow("wf", |ctx, input| async move {
                match ctx.call_activity("broken", input).await {
                    Ok(v) => Ok(v),
                    Err(failure) => Ok(json!({ "attempts": failure.attempts })),
                }
            })
            .unwrap();
        let scheduler = scheduler(registry);

        let instance = scheduler.run("wf", Value::Null).await.unwrap();
        assert_eq!(instance.result, Some(json!({ "attempts": 2 })));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_recorded_as_failure_the_workflow_can_branch_on() {
        let mut registry = Registry::new();
        registry
            .register_activity_with(
                "slow",
                ActivityOptions::default().with_timeout_secs(1),
                |_input| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(json!("too late"))
                },
            )
            .unwrap();
        registry
            .register_workflow("wf", |ctx, input| async move {
                match ctx.call_activity("slow", input).await {
                    Ok(v) => Ok(v),
                    Err(failure) if failure.is_timeout() => Ok(json!("fallback")),
                    Err(failure) => Err(failure.into()),
                }
            })
            .unwrap();
        let scheduler = scheduler(registry);

        let instance = scheduler.run("wf", Value::Null).await.unwrap();
        assert_eq!(instance.result, Some(json!("fallback")));

        let history = scheduler.repository().load_history(&instance.id).await.unwrap();
        assert!(matches!(
            &history[1],
            HistoryEvent::ActivityFailed { failure, .. } if failure.kind == FailureKind::Timeout
        ));
    }

    #[tokio::test]
    async fn panicking_activity_is_recorded_as_failure() {
        let mut registry = Registry::new();
        registry
            .register_activity("explode", |_input| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            })
            .unwrap();
        registry
            .register_workflow("wf", |ctx, input| async move {
                Ok(ctx.call_activity("explode", input).await?)
            })
            .unwrap();
        let scheduler = scheduler(registry);

        let instance = scheduler.run("wf", Value::Null).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert!(instance.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn handler_panicking_before_its_future_is_recorded_and_siblings_finish() {
        let mut registry = Registry::new();
        registry
            .register_activity("eager_panic", |input: Value| {
                let key = input["k"].as_str().expect("k must be a string").to_string();
                async move { Ok(json!(key)) }
            })
            .unwrap();
        registry
            .register_activity("steady", |_input| async move { Ok(json!("steady")) })
            .unwrap();
        registry
            .register_workflow("wf", |ctx, _input| async move {
                let results = ctx
                    .when_all(vec![
                        ctx.call_activity("eager_panic", json!({ "k": 1 })),
                        ctx.call_activity("steady", Value::Null),
                    ])
                    .await;
                Ok(json!({
                    "first_failed": results[0].is_err(),
                    "second": results[1].clone().ok(),
                }))
            })
            .unwrap();
        let scheduler = scheduler(registry);

        let instance = scheduler.run("wf", Value::Null).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(
            instance.result,
            Some(json!({ "first_failed": true, "second": "steady" }))
        );

        let history = scheduler.repository().load_history(&instance.id).await.unwrap();
        assert!(history.iter().any(|event| matches!(
            event,
            HistoryEvent::ActivityFailed { seq: 0, failure } if failure.message.contains("panicked")
        )));
        assert!(scheduler.repository().list_running_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn instance_locks_are_released_after_each_drive() {
        let mut registry = Registry::new();
        registry
            .register_activity("noop", |input| async move { Ok(input) })
            .unwrap();
        registry
            .register_workflow("wf", |ctx, input| async move {
                Ok(ctx.call_activity("noop", input).await?)
            })
            .unwrap();
        let scheduler = scheduler(registry);

        for i in 0..20 {
            let instance = scheduler.run("wf", json!(i)).await.unwrap();
            assert_eq!(instance.status, WorkflowStatus::Completed);
        }
        let id = scheduler.start("wf", json!("later")).await.unwrap();
        scheduler.resume(id).await.unwrap();
        scheduler.resume(id).await.unwrap();

        assert!(scheduler.instance_locks.is_empty());
        assert!(scheduler.cancellation_tokens.is_empty());
    }

    #[tokio::test]
    async fn concurrent_drives_of_one_instance_release_the_lock_entry() {
        let mut registry = Registry::new();
        registry
            .register_activity("slow", |input| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(input)
            })
            .unwrap();
        registry
            .register_workflow("wf", |ctx, input| async move {
                Ok(ctx.call_activity("slow", input).await?)
            })
            .unwrap();
        let scheduler = Arc::new(scheduler(registry));
        let id = scheduler.start("wf", json!("x")).await.unwrap();

        let (first, second) = tokio::join!(scheduler.resume(id), scheduler.resume(id));
        assert_eq!(first.unwrap().status, WorkflowStatus::Completed);
        assert_eq!(second.unwrap().status, WorkflowStatus::Completed);
        assert_eq!(scheduler.repository().load_history(&id).await.unwrap().len(), 2);
        assert!(scheduler.instance_locks.is_empty());
    }

    #[tokio::test]
    async fn unknown_activity_fails_instance() {
        let mut registry = Registry::new();
        registry
            .register_workflow("wf", |ctx, input| async move {
                Ok(ctx.call_activity("missing", input).await?)
            })
            .unwrap();
        let scheduler = scheduler(registry);

        let instance = scheduler.run("wf", Value::Null).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(
            instance.error.as_deref(),
            Some("unknown activity: 'missing'")
        );
        // Nothing was scheduled for a call that could never run.
        let history = scheduler.repository().load_history(&instance.id).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected_before_creating_instance() {
        let scheduler = scheduler(Registry::new());
        let err = scheduler.run("nope", Value::Null).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Registry(RegistryError::UnknownWorkflow(_))
        ));
        let all = scheduler.repository().list_instances(None, 10).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn divergent_history_fails_with_determinism_violation() {
        let counters = Counters::default();
        let repo = Arc::new(MemoryWorkflowRepository::new());
        let instance = WorkflowInstance::new("chain", json!(">"));
        repo.create_instance(&instance).await.unwrap();
        repo.append_event(&instance.id, 0, &scheduled(0, "renamed", json!(">")))
            .await
            .unwrap();

        let scheduler = InstanceScheduler::new(
            Arc::new(chain_registry(&counters)),
            Arc::clone(&repo),
            EngineConfig::default(),
        );
        let resumed = scheduler.resume(instance.id).await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Failed);
        assert!(resumed.error.unwrap().contains("determinism violation"));
        assert_eq!(count(&counters, "a"), 0);
    }

    #[tokio::test]
    async fn terminal_instance_is_not_re_executed() {
        let counters = Counters::default();
        let scheduler = scheduler(chain_registry(&counters));
        let done = scheduler.run("chain", json!(">")).await.unwrap();

        let again = scheduler.resume(done.id).await.unwrap();
        assert_eq!(again.status, WorkflowStatus::Completed);
        assert_eq!(again.result, done.result);
        assert_eq!(count(&counters, "a"), 1);
    }

    #[tokio::test]
    async fn cancelled_instance_is_never_advanced() {
        let counters = Counters::default();
        let scheduler = scheduler(chain_registry(&counters));
        let id = scheduler.start("chain", json!(">")).await.unwrap();

        assert!(scheduler.cancel(id).await.unwrap());
        assert!(!scheduler.cancel(id).await.unwrap());

        let instance = scheduler.resume(id).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Cancelled);
        assert_eq!(count(&counters, "a"), 0);
    }

    #[tokio::test]
    async fn cancel_during_batch_records_outcome_but_stops() {
        let mut registry = Registry::new();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let started_tx = Arc::new(std::sync::Mutex::new(Some(started_tx)));
        registry
            .register_activity("slow", move |input| {
                let started_tx = Arc::clone(&started_tx);
                async move {
                    if let Some(tx) = started_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(input)
                }
            })
            .unwrap();
        registry
            .register_workflow("wf", |ctx, input| async move {
                let first = ctx.call_activity("slow", input).await?;
                let second = ctx.call_activity("slow", first).await?;
                Ok(second)
            })
            .unwrap();
        let scheduler = Arc::new(scheduler(registry));

        let id = scheduler.start("wf", json!(1)).await.unwrap();
        let driver = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.resume(id).await })
        };
        started_rx.await.unwrap();
        assert!(scheduler.cancel(id).await.unwrap());

        let instance = driver.await.unwrap().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Cancelled);

        // First call's outcome recorded; second call never scheduled.
        let history = scheduler.repository().load_history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].is_outcome());
    }

    /// Cancels the instance through its scheduler right after `seq` is
    /// checkpointed, before the batch holding it starts.
    struct CancelOnSchedule {
        inner: MemoryWorkflowRepository,
        seq: Seq,
        scheduler: OnceLock<Weak<InstanceScheduler<CancelOnSchedule>>>,
    }

    impl WorkflowRepository for CancelOnSchedule {
        async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
            self.inner.create_instance(instance).await
        }

        async fn get_instance(
            &self,
            id: &InstanceId,
        ) -> Result<Option<WorkflowInstance>, RepositoryError> {
            self.inner.get_instance(id).await
        }

        async fn update_instance_status(
            &self,
            id: &InstanceId,
            status: WorkflowStatus,
            result: Option<&Value>,
            error: Option<&str>,
        ) -> Result<(), RepositoryError> {
            self.inner.update_instance_status(id, status, result, error).await
        }

        async fn list_instances(
            &self,
            status: Option<WorkflowStatus>,
            limit: u32,
        ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
            self.inner.list_instances(status, limit).await
        }

        async fn list_running_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
            self.inner.list_running_instances().await
        }

        async fn append_event(
            &self,
            id: &InstanceId,
            position: u64,
            event: &HistoryEvent,
        ) -> Result<(), RepositoryError> {
            self.inner.append_event(id, position, event).await?;
            let hit = matches!(event, HistoryEvent::ActivityScheduled { seq, .. } if *seq == self.seq);
            if hit {
                if let Some(scheduler) = self.scheduler.get().and_then(Weak::upgrade) {
                    scheduler
                        .cancel(*id)
                        .await
                        .map_err(|e| RepositoryError::Query(e.to_string()))?;
                }
            }
            Ok(())
        }

        async fn load_history(&self, id: &InstanceId) -> Result<Vec<HistoryEvent>, RepositoryError> {
            self.inner.load_history(id).await
        }

        async fn load_history_records(
            &self,
            id: &InstanceId,
        ) -> Result<Vec<HistoryRecord>, RepositoryError> {
            self.inner.load_history_records(id).await
        }
    }

    #[tokio::test]
    async fn cancel_after_checkpoint_keeps_batch_from_starting() {
        let executions = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new();
        {
            let executions = Arc::clone(&executions);
            registry
                .register_activity("counted", move |input| {
                    let executions = Arc::clone(&executions);
                    async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        Ok(input)
                    }
                })
                .unwrap();
        }
        registry
            .register_workflow("wf", |ctx, input| async move {
                let first = ctx.call_activity("counted", input).await?;
                Ok(ctx.call_activity("counted", first).await?)
            })
            .unwrap();

        let repo = Arc::new(CancelOnSchedule {
            inner: MemoryWorkflowRepository::new(),
            seq: 1,
            scheduler: OnceLock::new(),
        });
        let scheduler = Arc::new(InstanceScheduler::new(
            Arc::new(registry),
            Arc::clone(&repo),
            EngineConfig::default(),
        ));
        repo.scheduler.set(Arc::downgrade(&scheduler)).ok();

        let instance = scheduler.run("wf", json!(1)).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Cancelled);
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        let history = scheduler.repository().load_history(&instance.id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(matches!(
            history[2],
            HistoryEvent::ActivityScheduled { seq: 1, .. }
        ));
    }

    #[tokio::test]
    async fn cancel_through_another_scheduler_stops_drive() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let started_tx = Arc::new(std::sync::Mutex::new(Some(started_tx)));
        let mut registry = Registry::new();
        registry
            .register_activity("slow", move |input| {
                let started_tx = Arc::clone(&started_tx);
                async move {
                    if let Some(tx) = started_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(input)
                }
            })
            .unwrap();
        registry
            .register_workflow("wf", |ctx, input| async move {
                let first = ctx.call_activity("slow", input).await?;
                let second = ctx.call_activity("slow", first).await?;
                Ok(second)
            })
            .unwrap();
        let registry = Arc::new(registry);
        let repo = Arc::new(MemoryWorkflowRepository::new());
        let driver_side = Arc::new(InstanceScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&repo),
            EngineConfig::default(),
        ));
        let other_side = InstanceScheduler::new(registry, repo, EngineConfig::default());

        let id = driver_side.start("wf", json!(1)).await.unwrap();
        let driver = {
            let scheduler = Arc::clone(&driver_side);
            tokio::spawn(async move { scheduler.resume(id).await })
        };
        started_rx.await.unwrap();
        assert!(other_side.cancel(id).await.unwrap());

        let instance = driver.await.unwrap().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Cancelled);
        let history = driver_side.repository().load_history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn endless_workflow_hits_advance_cap() {
        let mut registry = Registry::new();
        registry
            .register_activity("tick", |input| async move { Ok(input) })
            .unwrap();
        registry
            .register_workflow("forever", |ctx, _input| async move {
                loop {
                    ctx.call_activity("tick", Value::Null).await?;
                }
            })
            .unwrap();
        let config = EngineConfig {
            max_advances: 5,
            ..EngineConfig::default()
        };
        let scheduler = InstanceScheduler::new(
            Arc::new(registry),
            Arc::new(MemoryWorkflowRepository::new()),
            config,
        );

        let instance = scheduler.run("forever", Value::Null).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(
            instance.error.as_deref(),
            Some("workflow exceeded 5 advances")
        );
    }

    #[tokio::test]
    async fn recover_all_resumes_every_running_instance() {
        let counters = Counters::default();
        let scheduler = scheduler(chain_registry(&counters));
        let first = scheduler.start("chain", json!("1")).await.unwrap();
        let second = scheduler.start("chain", json!("2")).await.unwrap();

        let outcomes = scheduler.recover_all().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        for (id, outcome) in outcomes {
            assert!(id == first || id == second);
            assert_eq!(outcome.unwrap().status, WorkflowStatus::Completed);
        }
        assert!(scheduler.repository().list_running_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_events_are_published_in_order() {
        let counters = Counters::default();
        let scheduler = scheduler(chain_registry(&counters));
        let mut rx = scheduler.event_bus().subscribe();

        let instance = scheduler.run("chain", json!(">")).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(EngineEvent::InstanceStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(EngineEvent::InstanceCompleted { activities_completed: 3, .. })
        ));
        assert!(events.iter().all(|e| e.instance_id() == instance.id));
        let batches = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::BatchScheduled { .. }))
            .count();
        assert_eq!(batches, 3);
    }
}
