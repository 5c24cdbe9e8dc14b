//! Dead-letter archive model.
//!
//! Append-only copies of deliveries that exhausted their retries. Entries
//! are never mutated except to record a replay, and never feed back into
//! the delivery ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

use super::webhook_delivery::WebhookDelivery;

/// Reason stored when the archived delivery carried no error message.
pub const DEFAULT_FAILURE_REASON: &str = "Unknown error";

/// An archived delivery.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WebhookDeadLetter {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub delivery_id: Uuid,
    pub event_type: String,
    pub event_id: Uuid,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub http_status_code: Option<i32>,
    pub response_body: Option<String>,
    pub attempt_count: i32,
    pub original_created_at: DateTime<Utc>,
    pub moved_to_dlq_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
    pub replay_successful: Option<bool>,
}

/// Snapshot of a delivery to archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWebhookDeadLetter {
    pub subscription_id: Uuid,
    pub delivery_id: Uuid,
    pub event_type: String,
    pub event_id: Uuid,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub http_status_code: Option<i32>,
    pub response_body: Option<String>,
    pub attempt_count: i32,
    pub original_created_at: DateTime<Utc>,
}

impl CreateWebhookDeadLetter {
    /// Copy the archivable fields of a delivery.
    #[must_use]
    pub fn from_delivery(delivery: &WebhookDelivery) -> Self {
        Self {
            subscription_id: delivery.subscription_id,
            delivery_id: delivery.id,
            event_type: delivery.event_type.clone(),
            event_id: delivery.event_id,
            payload: delivery.payload.clone(),
            error_message: delivery
                .error_message
                .clone()
                .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string()),
            http_status_code: delivery.http_status_code,
            response_body: delivery.response_body.clone(),
            attempt_count: delivery.attempt_count,
            original_created_at: delivery.created_at,
        }
    }
}

impl WebhookDeadLetter {
    /// Append an archive entry.
    pub async fn create<'e, E>(
        executor: E,
        input: CreateWebhookDeadLetter,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            INSERT INTO webhook_dead_letters (
                id, subscription_id, delivery_id, event_type, event_id, payload,
                error_message, http_status_code, response_body, attempt_count,
                original_created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(input.subscription_id)
        .bind(input.delivery_id)
        .bind(input.event_type)
        .bind(input.event_id)
        .bind(input.payload)
        .bind(input.error_message)
        .bind(input.http_status_code)
        .bind(input.response_body)
        .bind(input.attempt_count)
        .bind(input.original_created_at)
        .fetch_one(executor)
        .await
    }

    /// Find an entry by ID.
    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as("SELECT * FROM webhook_dead_letters WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Entries ordered by archive time, newest first.
    pub async fn list<'e, E>(executor: E, limit: i64, offset: i64) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            SELECT * FROM webhook_dead_letters
            ORDER BY moved_to_dlq_at DESC
            LIMIT $1 OFFSET $2
            ",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await
    }

    /// Count all entries.
    pub async fn count_all<'e, E>(executor: E) -> Result<i64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_scalar("SELECT COUNT(*) FROM webhook_dead_letters")
            .fetch_one(executor)
            .await
    }

    /// Record the outcome of a replay. A later replay overwrites an earlier one.
    pub async fn record_replay<'e, E>(
        executor: E,
        id: Uuid,
        replayed_at: DateTime<Utc>,
        successful: bool,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            UPDATE webhook_dead_letters
            SET replayed_at = $2, replay_successful = $3
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(replayed_at)
        .bind(successful)
        .fetch_optional(executor)
        .await
    }

    /// Remove an entry.
    pub async fn delete<'e, E>(executor: E, id: Uuid) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query("DELETE FROM webhook_dead_letters WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Take the transaction-scoped lock that serializes archive sweeps.
    ///
    /// Returns `false` when another sweep holds it.
    pub async fn try_lock_sweep<'e, E>(executor: E) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtext('webhook_dead_letter_sweep'))")
            .fetch_one(executor)
            .await
    }
}
