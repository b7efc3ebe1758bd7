//! Lifecycle events and best-effort sinks.
//!
//! Publishing never blocks orchestration: sinks either complete immediately
//! or drop the event and report an error, which is logged and counted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Discrete orchestration milestones
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    TaskStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    PlanUpdated,
    TaskCompleted,
    TaskFailed,
}

impl fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleEventKind::TaskStarted => "task_started",
            LifecycleEventKind::StepStarted => "step_started",
            LifecycleEventKind::StepCompleted => "step_completed",
            LifecycleEventKind::StepFailed => "step_failed",
            LifecycleEventKind::PlanUpdated => "plan_updated",
            LifecycleEventKind::TaskCompleted => "task_completed",
            LifecycleEventKind::TaskFailed => "task_failed",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl LifecycleEvent {
    pub fn new(kind: LifecycleEventKind, task_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryError {
    #[error("Event sink {0} is full, event dropped")]
    Full(String),
    #[error("Event sink {0} is closed")]
    Closed(String),
}

/// Push transport for lifecycle events. `publish` must return promptly.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &LifecycleEvent) -> Result<(), TelemetryError>;

    fn name(&self) -> &str;
}

/// Writes events to the tracing log
#[derive(Debug, Default, Clone)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn publish(&self, event: &LifecycleEvent) -> Result<(), TelemetryError> {
        match event.kind {
            LifecycleEventKind::TaskStarted
            | LifecycleEventKind::TaskCompleted
            | LifecycleEventKind::PlanUpdated => {
                info!(task_id = %event.task_id, event = %event.kind, payload = %event.payload, "Lifecycle event");
            }
            LifecycleEventKind::StepFailed | LifecycleEventKind::TaskFailed => {
                warn!(task_id = %event.task_id, event = %event.kind, payload = %event.payload, "Lifecycle event");
            }
            LifecycleEventKind::StepStarted | LifecycleEventKind::StepCompleted => {
                debug!(task_id = %event.task_id, event = %event.kind, payload = %event.payload, "Lifecycle event");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Bounded queue to a single consumer; drops events when full
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<LifecycleEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: &LifecycleEvent) -> Result<(), TelemetryError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TelemetryError::Full(self.name().to_string()),
            mpsc::error::TrySendError::Closed(_) => TelemetryError::Closed(self.name().to_string()),
        })
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Fan-out to any number of live subscribers
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: &LifecycleEvent) -> Result<(), TelemetryError> {
        // Having no subscribers is not an error
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "broadcast"
    }
}

/// Fans events out to every registered sink
#[derive(Clone, Default)]
pub struct Telemetry {
    sinks: Vec<Arc<dyn EventSink>>,
    dropped: Arc<AtomicU64>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Telemetry with only the tracing sink
    pub fn logging() -> Self {
        Self::new().with_sink(Arc::new(LoggingEventSink))
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn emit(&self, kind: LifecycleEventKind, task_id: &str, payload: Value) {
        let event = LifecycleEvent::new(kind, task_id, payload);
        for sink in &self.sinks {
            if let Err(e) = sink.publish(&event) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(task_id, sink = sink.name(), "Event sink error: {}", e);
            }
        }
    }

    /// Events that at least one sink failed to accept
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelEventSink::new(8);
        let telemetry = Telemetry::new().with_sink(Arc::new(sink));

        telemetry.emit(LifecycleEventKind::TaskStarted, "t1", json!({}));
        telemetry.emit(LifecycleEventKind::TaskCompleted, "t1", json!({"ok": true}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, LifecycleEventKind::TaskStarted);
        assert_eq!(second.kind, LifecycleEventKind::TaskCompleted);
        assert_eq!(second.payload["ok"], true);
        assert_eq!(second.task_id, "t1");
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (sink, _rx) = ChannelEventSink::new(1);
        let telemetry = Telemetry::new().with_sink(Arc::new(sink));

        telemetry.emit(LifecycleEventKind::StepStarted, "t1", json!({}));
        telemetry.emit(LifecycleEventKind::StepStarted, "t1", json!({}));
        telemetry.emit(LifecycleEventKind::StepStarted, "t1", json!({}));
        assert_eq!(telemetry.dropped(), 2);
    }

    #[test]
    fn test_broadcast_without_subscribers_is_ok() {
        let sink = BroadcastEventSink::default();
        let event = LifecycleEvent::new(LifecycleEventKind::PlanUpdated, "t1", json!(null));
        assert!(sink.publish(&event).is_ok());
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(LifecycleEventKind::StepFailed.to_string(), "step_failed");
        let json = serde_json::to_value(LifecycleEventKind::PlanUpdated).unwrap();
        assert_eq!(json, "plan_updated");
    }
}
