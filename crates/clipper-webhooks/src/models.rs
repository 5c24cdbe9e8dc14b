//! Event types and the value types returned by the services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clipper_db::{WebhookDeadLetter, WebhookDelivery};

/// Events a subscription may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "clip.submitted")]
    ClipSubmitted,
    #[serde(rename = "clip.approved")]
    ClipApproved,
    #[serde(rename = "clip.rejected")]
    ClipRejected,
}

impl WebhookEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClipSubmitted => "clip.submitted",
            Self::ClipApproved => "clip.approved",
            Self::ClipRejected => "clip.rejected",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::all().iter().copied().find(|et| et.as_str() == s)
    }

    #[must_use]
    pub fn all() -> &'static [Self] {
        &[Self::ClipSubmitted, Self::ClipApproved, Self::ClipRejected]
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body POSTed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Result of one `process_due` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub claimed: usize,
    pub delivered: usize,
    /// Failed attempts that left the delivery pending.
    pub retried: usize,
    /// Failed attempts that exhausted the delivery.
    pub exhausted: usize,
}

/// Engine health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub active_subscriptions: i64,
    pub pending_deliveries: i64,
    pub recent_delivered: i64,
    pub recent_failed: i64,
    pub recent_pending: i64,
    pub window_secs: u64,
}

/// One page of a subscription's deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPage {
    pub items: Vec<WebhookDelivery>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub has_more: bool,
}

/// One page of dead-letter entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterPage {
    pub items: Vec<WebhookDeadLetter>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub has_more: bool,
}

/// Outcome of a dead-letter replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayResult {
    pub entry: WebhookDeadLetter,
    pub successful: bool,
    pub http_status_code: Option<i32>,
    pub error_message: Option<String>,
}

/// Clamp page/limit pairs to sane bounds and return `(page, limit, offset)`.
pub(crate) fn page_bounds(page: i64, limit: i64) -> (i64, i64, i64) {
    let limit = limit.clamp(1, 100);
    let page = page.max(1);
    (page, limit, (page - 1) * limit)
}
