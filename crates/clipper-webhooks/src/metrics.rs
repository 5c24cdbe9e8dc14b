//! Delivery metrics for observability.
//!
//! Counts attempt outcomes, retries per attempt number, dead-letter moves by
//! reason, consecutive failures per subscription, attempt latency and replay
//! outcomes. Services share one instance through [`SharedDeliveryMetrics`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use uuid::Uuid;

/// Metrics handle shared between the delivery and dead-letter services.
pub type SharedDeliveryMetrics = Arc<RwLock<DeliveryMetrics>>;

/// Why an exhausted delivery ended up in the dead-letter archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeadLetterReason {
    /// The last attempt got no HTTP response.
    NetworkError,
    /// The last attempt got a 4xx.
    ClientError,
    /// The last attempt got a 5xx.
    ServerError,
    /// The last attempt got some other non-2xx status.
    HttpError,
}

impl DeadLetterReason {
    /// Classify by the last recorded status code.
    #[must_use]
    pub fn from_status(http_status_code: Option<i32>) -> Self {
        match http_status_code {
            None => Self::NetworkError,
            Some(code) if (400..500).contains(&code) => Self::ClientError,
            Some(code) if code >= 500 => Self::ServerError,
            Some(_) => Self::HttpError,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "max_retries_network_error",
            Self::ClientError => "max_retries_client_error",
            Self::ServerError => "max_retries_server_error",
            Self::HttpError => "max_retries_http_error",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics exposed by the delivery engine.
#[derive(Debug, Clone, Default)]
pub struct DeliveryMetrics {
    /// Attempts answered with a 2xx.
    pub delivered_count: u64,
    /// Failed attempts that left the row pending for another try.
    pub retry_count: u64,
    /// Failed attempts that used up the row's budget.
    pub exhausted_count: u64,
    /// Recorded attempts keyed by attempt number.
    pub attempts_by_number: BTreeMap<i32, u64>,
    /// Retries scheduled keyed by the attempt number that failed.
    pub retries_by_attempt: BTreeMap<i32, u64>,
    /// Deliveries archived keyed by reason.
    pub dead_letter_moves: BTreeMap<DeadLetterReason, u64>,
    /// Failures since the last success, per subscription.
    pub consecutive_failures: HashMap<Uuid, u32>,
    /// Replays answered with a 2xx.
    pub replay_success_count: u64,
    /// Replays that failed.
    pub replay_failure_count: u64,
    /// Slowest HTTP attempt seen, in milliseconds.
    pub max_attempt_duration_ms: u64,
    /// Sum of all HTTP attempt durations in milliseconds (for average calculation).
    total_attempt_duration_ms: u64,
    timed_attempts: u64,
    /// When the last failed attempt was recorded.
    pub last_failure_time: Option<Instant>,
}

impl DeliveryMetrics {
    /// Creates new metrics with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handle for sharing between services.
    #[must_use]
    pub fn shared() -> SharedDeliveryMetrics {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Records a 2xx attempt and clears the subscription's failure streak.
    pub fn record_delivered(&mut self, subscription_id: Uuid, attempt_number: i32) {
        self.delivered_count += 1;
        *self.attempts_by_number.entry(attempt_number).or_default() += 1;
        self.consecutive_failures.remove(&subscription_id);
    }

    /// Records a failed attempt. `exhausted` is true when no retry follows.
    pub fn record_failed(&mut self, subscription_id: Uuid, attempt_number: i32, exhausted: bool) {
        *self.attempts_by_number.entry(attempt_number).or_default() += 1;
        if exhausted {
            self.exhausted_count += 1;
        } else {
            self.retry_count += 1;
            *self.retries_by_attempt.entry(attempt_number).or_default() += 1;
        }
        *self.consecutive_failures.entry(subscription_id).or_default() += 1;
        self.last_failure_time = Some(Instant::now());
    }

    /// Records how long one HTTP attempt took.
    pub fn record_attempt_duration(&mut self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.total_attempt_duration_ms = self.total_attempt_duration_ms.saturating_add(ms);
        self.timed_attempts += 1;
        self.max_attempt_duration_ms = self.max_attempt_duration_ms.max(ms);
    }

    /// Records a delivery moved into the archive.
    pub fn record_dead_letter(&mut self, reason: DeadLetterReason) {
        *self.dead_letter_moves.entry(reason).or_default() += 1;
    }

    /// Records a replay outcome.
    pub fn record_replay(&mut self, successful: bool) {
        if successful {
            self.replay_success_count += 1;
        } else {
            self.replay_failure_count += 1;
        }
    }

    /// Returns the average HTTP attempt duration in milliseconds.
    #[must_use]
    pub fn average_attempt_duration_ms(&self) -> f64 {
        if self.timed_attempts == 0 {
            0.0
        } else {
            self.total_attempt_duration_ms as f64 / self.timed_attempts as f64
        }
    }

    /// Share of attempts with this number that were scheduled for retry.
    #[must_use]
    pub fn retry_rate(&self, attempt_number: i32) -> f64 {
        let attempts = self
            .attempts_by_number
            .get(&attempt_number)
            .copied()
            .unwrap_or(0);
        if attempts == 0 {
            return 0.0;
        }
        let retries = self
            .retries_by_attempt
            .get(&attempt_number)
            .copied()
            .unwrap_or(0);
        retries as f64 / attempts as f64
    }

    /// Failures since the last success for one subscription.
    #[must_use]
    pub fn consecutive_failures_for(&self, subscription_id: Uuid) -> u32 {
        self.consecutive_failures
            .get(&subscription_id)
            .copied()
            .unwrap_or(0)
    }

    /// Archived deliveries for one reason.
    #[must_use]
    pub fn dead_letters_for(&self, reason: DeadLetterReason) -> u64 {
        self.dead_letter_moves.get(&reason).copied().unwrap_or(0)
    }

    /// Resets all metrics to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
