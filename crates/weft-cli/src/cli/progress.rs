//! Live progress lines rendered from the scheduler's event bus.

use std::future::Future;

use console::style;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use weft_core::event::EventBus;
use weft_types::event::EngineEvent;

/// Drive `work` to completion, printing lifecycle events as they arrive.
///
/// With `enabled == false` the future is simply awaited.
pub async fn with_progress<F: Future>(bus: &EventBus, enabled: bool, work: F) -> F::Output {
    if !enabled {
        return work.await;
    }

    let mut rx = bus.subscribe();
    tokio::pin!(work);
    let output = loop {
        tokio::select! {
            output = &mut work => break output,
            event = rx.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("  {}", style(format!("... {skipped} events skipped")).dim());
                }
                // `bus` is borrowed for the whole call, so its sender outlives us.
                Err(RecvError::Closed) => {}
            },
        }
    };

    // Events published just before the work finished.
    loop {
        match rx.try_recv() {
            Ok(event) => print_event(&event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    output
}

fn print_event(event: &EngineEvent) {
    if let Some(line) = describe(event) {
        eprintln!("  {line}");
    }
}

/// One-line description of an event; `None` for events not worth a line.
pub fn describe(event: &EngineEvent) -> Option<String> {
    let line = match event {
        EngineEvent::InstanceStarted { workflow_name, instance_id } => format!(
            "{} {} {}",
            style("*").green().bold(),
            style(workflow_name).cyan(),
            style(instance_id).dim()
        ),
        EngineEvent::InstanceResumed { replayed_events, .. } => format!(
            "{} replaying {replayed_events} recorded event(s)",
            style("↻").cyan()
        ),
        EngineEvent::BatchScheduled { .. } => return None,
        EngineEvent::ActivityStarted { seq, name, attempt, .. } => {
            if *attempt > 1 {
                format!("{} #{seq} {name} (attempt {attempt})", style("▸").dim())
            } else {
                format!("{} #{seq} {name}", style("▸").dim())
            }
        }
        EngineEvent::ActivityCompleted { seq, name, duration_ms, .. } => format!(
            "{} #{seq} {name} {}",
            style("✓").green(),
            style(format!("{duration_ms}ms")).dim()
        ),
        EngineEvent::ActivityFailed { seq, name, error, will_retry, .. } => format!(
            "{} #{seq} {name}: {}{}",
            style("✗").red(),
            error,
            if *will_retry { " (retrying)" } else { "" }
        ),
        EngineEvent::InstanceCompleted { duration_ms, activities_completed, .. } => format!(
            "{} completed: {activities_completed} activities in {duration_ms}ms",
            style("✓").green().bold()
        ),
        EngineEvent::InstanceFailed { error, .. } => {
            format!("{} failed: {}", style("✗").red().bold(), style(error).red())
        }
        EngineEvent::InstanceCancelled { .. } => {
            format!("{} cancelled", style("■").yellow())
        }
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::workflow::InstanceId;

    #[test]
    fn batch_events_are_silent() {
        let event = EngineEvent::BatchScheduled {
            instance_id: InstanceId::new(),
            seqs: vec![0, 1],
        };
        assert!(describe(&event).is_none());
    }

    #[test]
    fn retry_is_mentioned() {
        let event = EngineEvent::ActivityFailed {
            instance_id: InstanceId::new(),
            seq: 2,
            name: "evaluate_recipe".to_string(),
            error: "timeout".to_string(),
            will_retry: true,
        };
        let line = describe(&event).unwrap();
        assert!(line.contains("evaluate_recipe"));
        assert!(line.contains("retrying"));
    }

    #[tokio::test]
    async fn disabled_progress_just_awaits() {
        let bus = EventBus::new(4);
        let value = with_progress(&bus, false, async { 7 }).await;
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn enabled_progress_returns_work_output() {
        let bus = EventBus::new(4);
        let publisher = bus.clone();
        let value = with_progress(&bus, true, async move {
            publisher.publish(EngineEvent::InstanceCancelled {
                instance_id: InstanceId::new(),
            });
            "done"
        })
        .await;
        assert_eq!(value, "done");
    }
}
