//! Operation events for diagnostics subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::types::{Intent, OperationId, RemoteId, Trigger};

/// Lifecycle step of a supervised operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationEventKind {
    /// Took the remote's slot; may still be waiting for a limiter permit.
    Admitted,
    /// Holds a permit and is running.
    Started,
    /// Finished and its result was applied.
    Completed,
    /// Replaced by a newer operation on the same remote.
    Superseded,
    /// Rejected because the remote was busy.
    Skipped,
    /// Cancelled by the user.
    Cancelled,
    /// Killed by the watchdog.
    TimedOut,
    /// Finished after losing its slot; result discarded.
    Dropped,
}

/// One step in the life of a supervised operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationEvent {
    /// What happened.
    pub kind: OperationEventKind,
    /// Remote the operation targets.
    pub remote_id: RemoteId,
    /// `None` for skipped submissions, which never get an id.
    pub operation_id: Option<OperationId>,
    /// Intent of the operation.
    pub intent: Intent,
    /// Who submitted it.
    pub trigger: Trigger,
    /// Time since admission.
    pub elapsed: Duration,
    /// Time spent waiting for a limiter permit, once known.
    pub queue_wait: Option<Duration>,
    /// Free-form context such as an error message.
    pub detail: Option<String>,
    /// Wall-clock time of the event.
    pub timestamp: DateTime<Utc>,
}

impl OperationEvent {
    /// Event with zero elapsed time and no detail.
    pub fn new(
        kind: OperationEventKind,
        remote_id: RemoteId,
        operation_id: Option<OperationId>,
        intent: Intent,
        trigger: Trigger,
    ) -> Self {
        Self {
            kind,
            remote_id,
            operation_id,
            intent,
            trigger,
            elapsed: Duration::ZERO,
            queue_wait: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    /// Set the time since admission.
    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Set the limiter wait.
    pub fn queue_wait(mut self, queue_wait: Option<Duration>) -> Self {
        self.queue_wait = queue_wait;
        self
    }

    /// Attach free-form context.
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Fan-out of operation events to diagnostics subscribers. Every event is also
/// logged.
pub struct EventBus {
    sender: broadcast::Sender<OperationEvent>,
}

impl EventBus {
    /// Bus whose subscribers may lag up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Log `event` and broadcast it.
    pub fn publish(&self, event: OperationEvent) {
        let operation_id = event.operation_id.map(|id| id.to_string()).unwrap_or_default();
        let elapsed_ms = event.elapsed.as_millis() as u64;
        let queue_wait_ms = event.queue_wait.map(|d| d.as_millis() as u64);
        let detail = event.detail.as_deref().unwrap_or("");
        match event.kind {
            OperationEventKind::TimedOut => tracing::warn!(
                kind = ?event.kind, remote_id = %event.remote_id, operation_id = %operation_id,
                intent = %event.intent, trigger = %event.trigger, elapsed_ms, queue_wait_ms = ?queue_wait_ms,
                detail, "operation timed out"
            ),
            OperationEventKind::Skipped | OperationEventKind::Dropped => tracing::debug!(
                kind = ?event.kind, remote_id = %event.remote_id, operation_id = %operation_id,
                intent = %event.intent, trigger = %event.trigger, elapsed_ms, detail, "operation event"
            ),
            _ => tracing::info!(
                kind = ?event.kind, remote_id = %event.remote_id, operation_id = %operation_id,
                intent = %event.intent, trigger = %event.trigger, elapsed_ms, queue_wait_ms = ?queue_wait_ms,
                detail, "operation event"
            ),
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let remote = RemoteId::from_uuid(Uuid::new_v4());
        bus.publish(
            OperationEvent::new(
                OperationEventKind::Started,
                remote,
                Some(OperationId::new(3)),
                Intent::Connect,
                Trigger::Manual,
            )
            .queue_wait(Some(Duration::from_millis(40))),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, OperationEventKind::Started);
        assert_eq!(event.operation_id, Some(OperationId::new(3)));
        assert_eq!(event.queue_wait, Some(Duration::from_millis(40)));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        let remote = RemoteId::from_uuid(Uuid::new_v4());
        bus.publish(OperationEvent::new(
            OperationEventKind::Skipped,
            remote,
            None,
            Intent::Refresh,
            Trigger::Recovery,
        ));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_serializes_with_snake_case_kind() {
        let remote = RemoteId::from_uuid(Uuid::new_v4());
        let event = OperationEvent::new(
            OperationEventKind::TimedOut,
            remote,
            Some(OperationId::new(1)),
            Intent::Disconnect,
            Trigger::Termination,
        )
        .detail("disconnect timed out after 10000ms");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "timed_out");
        assert_eq!(json["intent"], "disconnect");
        assert_eq!(json["trigger"], "termination");
        assert_eq!(json["operation_id"], 1);
    }
}
