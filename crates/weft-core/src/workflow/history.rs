//! In-memory view of an instance's append-only execution history.
//!
//! `ExecutionHistory` validates every append: scheduled calls must carry the
//! next sequence number, and each outcome must resolve a call that was
//! scheduled and not yet resolved. The orchestrator reads it during replay;
//! the scheduler writes it (and mirrors every append to the repository).

use std::collections::HashMap;

use serde_json::Value;

use weft_types::workflow::{ActivityFailure, HistoryEvent, Seq};

/// A call recorded by an `ActivityScheduled` event.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCall {
    pub seq: Seq,
    pub name: String,
    pub input: Value,
}

/// Validated, ordered event history of one workflow instance.
#[derive(Debug, Clone, Default)]
pub struct ExecutionHistory {
    events: Vec<HistoryEvent>,
    /// Indexed by seq; seqs are contiguous from 0.
    scheduled: Vec<ScheduledCall>,
    /// seq -> index into `events` of the resolving event.
    outcomes: HashMap<Seq, usize>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history from persisted events, validating their order.
    pub fn from_events(
        events: impl IntoIterator<Item = HistoryEvent>,
    ) -> Result<Self, HistoryError> {
        let mut history = Self::new();
        for event in events {
            history.append(event)?;
        }
        Ok(history)
    }

    /// Append an event after validating it. Returns its 0-based position.
    pub fn append(&mut self, event: HistoryEvent) -> Result<u64, HistoryError> {
        match &event {
            HistoryEvent::ActivityScheduled { seq, name, input } => {
                let expected = self.next_seq();
                if *seq != expected {
                    return Err(HistoryError::OutOfOrder {
                        expected,
                        actual: *seq,
                    });
                }
                self.scheduled.push(ScheduledCall {
                    seq: *seq,
                    name: name.clone(),
                    input: input.clone(),
                });
            }
            HistoryEvent::ActivityCompleted { seq, .. }
            | HistoryEvent::ActivityFailed { seq, .. } => {
                if *seq >= self.next_seq() {
                    return Err(HistoryError::UnknownSequence(*seq));
                }
                if self.outcomes.contains_key(seq) {
                    return Err(HistoryError::AlreadyResolved(*seq));
                }
                self.outcomes.insert(*seq, self.events.len());
            }
        }
        self.events.push(event);
        Ok(self.events.len() as u64 - 1)
    }

    /// Append `ActivityScheduled` with the next sequence number.
    pub fn schedule(&mut self, name: impl Into<String>, input: Value) -> Seq {
        let seq = self.next_seq();
        let name = name.into();
        self.scheduled.push(ScheduledCall {
            seq,
            name: name.clone(),
            input: input.clone(),
        });
        self.events
            .push(HistoryEvent::ActivityScheduled { seq, name, input });
        seq
    }

    pub fn record_completion(&mut self, seq: Seq, output: Value) -> Result<u64, HistoryError> {
        self.append(HistoryEvent::ActivityCompleted { seq, output })
    }

    pub fn record_failure(
        &mut self,
        seq: Seq,
        failure: ActivityFailure,
    ) -> Result<u64, HistoryError> {
        self.append(HistoryEvent::ActivityFailed { seq, failure })
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    /// The first `n` events (clamped to the history length).
    pub fn events_up_to(&self, n: usize) -> &[HistoryEvent] {
        &self.events[..n.min(self.events.len())]
    }

    /// A new history holding only the first `n` events.
    ///
    /// Any prefix of a valid history is itself valid.
    pub fn truncated(&self, n: usize) -> Self {
        let mut prefix = Self::new();
        for event in self.events_up_to(n) {
            // Prefix of an already-validated sequence; cannot fail.
            let _ = prefix.append(event.clone());
        }
        prefix
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Sequence number the next scheduled call will receive.
    pub fn next_seq(&self) -> Seq {
        self.scheduled.len() as Seq
    }

    pub fn scheduled_count(&self) -> u64 {
        self.scheduled.len() as u64
    }

    pub fn scheduled(&self, seq: Seq) -> Option<&ScheduledCall> {
        self.scheduled.get(usize::try_from(seq).ok()?)
    }

    /// Recorded outcome of `seq`, if it has been resolved.
    pub fn outcome(&self, seq: Seq) -> Option<Result<&Value, &ActivityFailure>> {
        let index = *self.outcomes.get(&seq)?;
        match &self.events[index] {
            HistoryEvent::ActivityCompleted { output, .. } => Some(Ok(output)),
            HistoryEvent::ActivityFailed { failure, .. } => Some(Err(failure)),
            HistoryEvent::ActivityScheduled { .. } => None,
        }
    }

    /// Scheduled calls without a recorded outcome, in seq order.
    pub fn unresolved(&self) -> Vec<&ScheduledCall> {
        self.scheduled
            .iter()
            .filter(|call| !self.outcomes.contains_key(&call.seq))
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, HistoryEvent::ActivityCompleted { .. }))
            .count()
    }
}

/// History ordering violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("history out of order: expected seq {expected}, got {actual}")]
    OutOfOrder { expected: Seq, actual: Seq },

    #[error("outcome references unscheduled seq {0}")]
    UnknownSequence(Seq),

    #[error("seq {0} already has a recorded outcome")]
    AlreadyResolved(Seq),
}
