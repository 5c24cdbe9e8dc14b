//! Webhook delivery model.
//!
//! One row per (subscription, event) notification. The row carries the
//! attempt count, the outcome of the latest attempt and the earliest time
//! the next attempt may run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

/// Default number of attempts before a delivery is exhausted.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting for its next attempt.
    Pending,
    /// Accepted by the endpoint.
    Delivered,
    /// Retries exhausted.
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(format!("Unknown delivery status: {s}")),
        }
    }
}

impl DeliveryStatus {
    /// No further transition is defined from this status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

/// A delivery ledger row.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    /// May dangle once the subscription is deleted.
    pub subscription_id: Uuid,
    pub event_type: String,
    pub event_id: Uuid,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub http_status_code: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// Whether a worker may claim this row at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending
            && self.attempt_count < self.max_attempts
            && self.next_attempt_at.is_some_and(|at| at <= now)
    }
}

/// Input for queueing a delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWebhookDelivery {
    pub subscription_id: Uuid,
    pub event_type: String,
    pub event_id: Uuid,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
}

/// Column values written by a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailureUpdate {
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub http_status_code: Option<i32>,
    pub error_message: String,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Delivered / failed / pending counts over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct DeliveryCounts {
    pub delivered: i64,
    pub failed: i64,
    pub pending: i64,
}

impl WebhookDelivery {
    /// Insert a `pending` delivery with no attempts.
    pub async fn create<'e, E>(executor: E, input: CreateWebhookDelivery) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            INSERT INTO webhook_deliveries (
                id, subscription_id, event_type, event_id, payload,
                status, attempt_count, max_attempts, next_attempt_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7)
            RETURNING *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(input.subscription_id)
        .bind(input.event_type)
        .bind(input.event_id)
        .bind(input.payload)
        .bind(input.max_attempts)
        .bind(input.next_attempt_at)
        .fetch_one(executor)
        .await
    }

    /// Find a delivery by ID.
    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as("SELECT * FROM webhook_deliveries WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Take a row lock on a delivery for the rest of the transaction.
    pub async fn lock_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as("SELECT * FROM webhook_deliveries WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Lock up to `limit` due deliveries, skipping rows another transaction holds.
    ///
    /// Must run inside a transaction; the locks last until it ends.
    pub async fn lock_due<'e, E>(
        executor: E,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            SELECT * FROM webhook_deliveries
            WHERE status = 'pending'
                AND next_attempt_at <= $1
                AND attempt_count < max_attempts
            ORDER BY next_attempt_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(executor)
        .await
    }

    /// Lock exhausted deliveries that have no dead-letter entry yet.
    pub async fn lock_unarchived_failed<'e, E>(
        executor: E,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            SELECT d.* FROM webhook_deliveries d
            WHERE d.status = 'failed'
                AND NOT EXISTS (
                    SELECT 1 FROM webhook_dead_letters l WHERE l.delivery_id = d.id
                )
            ORDER BY d.updated_at ASC
            LIMIT $1
            FOR UPDATE OF d SKIP LOCKED
            ",
        )
        .bind(limit)
        .fetch_all(executor)
        .await
    }

    /// Mark delivered and count the attempt.
    pub async fn apply_success<'e, E>(
        executor: E,
        id: Uuid,
        http_status_code: i32,
        response_body: Option<&str>,
        delivered_at: DateTime<Utc>,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            UPDATE webhook_deliveries
            SET status = 'delivered',
                http_status_code = $2,
                response_body = $3,
                delivered_at = $4,
                attempt_count = attempt_count + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(http_status_code)
        .bind(response_body)
        .bind(delivered_at)
        .fetch_one(executor)
        .await
    }

    /// Write every column a failed attempt touches in one statement.
    pub async fn apply_failure<'e, E>(
        executor: E,
        id: Uuid,
        update: &DeliveryFailureUpdate,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            UPDATE webhook_deliveries
            SET status = $2,
                http_status_code = $3,
                error_message = $4,
                attempt_count = $5,
                next_attempt_at = $6,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(update.status.to_string())
        .bind(update.http_status_code)
        .bind(&update.error_message)
        .bind(update.attempt_count)
        .bind(update.next_attempt_at)
        .fetch_one(executor)
        .await
    }

    /// Deliveries for a subscription, newest first.
    pub async fn list_by_subscription<'e, E>(
        executor: E,
        subscription_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            SELECT * FROM webhook_deliveries
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(subscription_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await
    }

    /// Count deliveries for a subscription.
    pub async fn count_by_subscription<'e, E>(
        executor: E,
        subscription_id: Uuid,
    ) -> Result<i64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_scalar("SELECT COUNT(*) FROM webhook_deliveries WHERE subscription_id = $1")
            .bind(subscription_id)
            .fetch_one(executor)
            .await
    }

    /// Count deliveries still waiting for an attempt.
    pub async fn count_pending<'e, E>(executor: E) -> Result<i64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_scalar("SELECT COUNT(*) FROM webhook_deliveries WHERE status = 'pending'")
            .fetch_one(executor)
            .await
    }

    /// Status counts for rows touched since `since`.
    pub async fn counts_since<'e, E>(
        executor: E,
        since: DateTime<Utc>,
    ) -> Result<DeliveryCounts, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            SELECT
                COUNT(*) FILTER (WHERE status = 'delivered') AS delivered,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending
            FROM webhook_deliveries
            WHERE updated_at >= $1
            ",
        )
        .bind(since)
        .fetch_one(executor)
        .await
    }
}
