//! Error types for the webhook engine.

use clipper_db::DbError;
use uuid::Uuid;

/// Webhook engine error variants.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Subscription not found")]
    SubscriptionNotFound,

    #[error("Delivery not found")]
    DeliveryNotFound,

    #[error("Dead letter entry not found")]
    DeadLetterNotFound,

    #[error("Delivery {0} is held by an in-flight claim")]
    DeliveryLocked(Uuid),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("SSRF protection: {0}")]
    SsrfDetected(String),

    #[error("Subscription is inactive")]
    SubscriptionInactive,

    #[error("Replay failed: {0}")]
    ReplayFailed(String),

    #[error("Invalid configuration for {var}: {reason}")]
    Config { var: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    /// Whether the error reports a missing subscription, delivery or archive entry.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WebhookError::SubscriptionNotFound
                | WebhookError::DeliveryNotFound
                | WebhookError::DeadLetterNotFound
        )
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            WebhookError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            WebhookError::Db(e) => e.is_connection_error(),
            WebhookError::DeliveryLocked(_) => true,
            _ => false,
        }
    }
}

/// Why a single HTTP attempt produced no response.
///
/// These are recorded on the delivery as transient failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryAttemptError {
    #[error("Request timeout ({0}s)")]
    Timeout(u64),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request error: {0}")]
    Request(String),
}
