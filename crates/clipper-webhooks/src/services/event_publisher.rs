//! In-process event publishing over a tokio broadcast channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{WebhookEnvelope, WebhookEventType};

/// A domain event that may fan out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl WebhookEvent {
    /// New event with a fresh id, stamped now.
    #[must_use]
    pub fn new(event_type: WebhookEventType, data: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.as_str().to_string(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Body delivered to subscribers.
    #[must_use]
    pub fn envelope(&self) -> WebhookEnvelope {
        WebhookEnvelope {
            event: self.event_type.clone(),
            event_id: self.event_id,
            timestamp: self.timestamp,
            data: self.data.clone(),
        }
    }
}

/// Publisher that sends webhook events to a broadcast channel.
#[derive(Clone)]
pub struct EventPublisher {
    sender: tokio::sync::broadcast::Sender<WebhookEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, tokio::sync::broadcast::Receiver<WebhookEvent>) {
        let (sender, receiver) = tokio::sync::broadcast::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Publish an event. Fire-and-forget; a missing receiver is only logged.
    pub fn publish(&self, event: WebhookEvent) {
        if let Err(e) = self.sender.send(event) {
            tracing::warn!(
                target: "webhook_delivery",
                event_id = %e.0.event_id,
                event_type = %e.0.event_type,
                "No active webhook worker to receive event"
            );
        }
    }

    /// Get a new receiver for the broadcast channel.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WebhookEvent> {
        self.sender.subscribe()
    }
}
