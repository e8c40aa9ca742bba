//! Event types for the VPA event system
//!
//! Provides shared event definitions and the EventBus used for SSE
//! broadcasting. Events are serialized with a `type` tag so web clients can
//! dispatch on the event kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Analysis lifecycle events
///
/// Broadcast by the dispatch coordinator as sessions move through the
/// state machine. All events carry the session key so clients can filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnalysisEvent {
    /// First event for an unknown session created a pending record
    SessionCreated {
        owner_id: String,
        session_id: String,
        model_name: String,
        expected_views: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A view's inference completed and was recorded
    ViewCompleted {
        owner_id: String,
        session_id: String,
        view: String,
        progress: u8,
        timestamp: DateTime<Utc>,
    },

    /// A view's inference hit a retryable failure; a retry is scheduled
    ViewRetrying {
        owner_id: String,
        session_id: String,
        view: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// All expected views arrived; combined result is available
    SessionCompleted {
        owner_id: String,
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A required view exhausted its retries or hit a fatal error
    SessionFailed {
        owner_id: String,
        session_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Session was cancelled by the deletion collaborator
    SessionCancelled {
        owner_id: String,
        session_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl AnalysisEvent {
    /// Event type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            AnalysisEvent::SessionCreated { .. } => "SessionCreated",
            AnalysisEvent::ViewCompleted { .. } => "ViewCompleted",
            AnalysisEvent::ViewRetrying { .. } => "ViewRetrying",
            AnalysisEvent::SessionCompleted { .. } => "SessionCompleted",
            AnalysisEvent::SessionFailed { .. } => "SessionFailed",
            AnalysisEvent::SessionCancelled { .. } => "SessionCancelled",
        }
    }
}

/// Broadcast bus for analysis events
///
/// Wraps `tokio::sync::broadcast`: multi-producer, multi-consumer, with
/// bounded lag. Slow subscribers miss events rather than blocking emitters.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AnalysisEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<AnalysisEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the no-subscribers case
    ///
    /// Orchestration must not fail because nobody is watching the SSE
    /// stream, so send errors are dropped.
    pub fn emit_lossy(&self, event: AnalysisEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> AnalysisEvent {
        AnalysisEvent::ViewCompleted {
            owner_id: "u1".to_string(),
            session_id: "s1".to_string(),
            view: "front".to_string(),
            progress: 25,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["type"], "ViewCompleted");
        assert_eq!(json["view"], "front");
        assert_eq!(json["progress"], 25);
    }

    #[test]
    fn event_type_matches_tag() {
        let event = sample_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
    }

    #[tokio::test]
    async fn bus_delivers_to_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit_lossy(sample_event());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "ViewCompleted");
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        bus.emit_lossy(sample_event());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
