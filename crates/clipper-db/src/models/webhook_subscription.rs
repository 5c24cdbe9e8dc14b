//! Webhook subscription model.
//!
//! A third-party endpoint registered by a user, the event types it wants,
//! and the secret used to sign payloads sent to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

/// A registered webhook endpoint.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub url: String,
    /// Signing secret. Never serialized into responses.
    #[serde(skip_serializing, default)]
    pub secret: String,
    pub events: Vec<String>,
    pub is_active: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_delivery_at: Option<DateTime<Utc>>,
}

impl WebhookSubscription {
    /// Whether this subscription wants events of the given type.
    #[must_use]
    pub fn is_subscribed_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWebhookSubscription {
    pub user_id: Uuid,
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
    pub description: Option<String>,
}

/// Partial update. `None` leaves the column unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateWebhookSubscription {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub is_active: Option<bool>,
    pub description: Option<String>,
}

impl UpdateWebhookSubscription {
    /// True when no field would change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.events.is_none()
            && self.is_active.is_none()
            && self.description.is_none()
    }
}

impl WebhookSubscription {
    /// Insert a new active subscription.
    pub async fn create<'e, E>(
        executor: E,
        input: CreateWebhookSubscription,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            INSERT INTO webhook_subscriptions (id, user_id, url, secret, events, is_active, description)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6)
            RETURNING *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(input.user_id)
        .bind(input.url)
        .bind(input.secret)
        .bind(input.events)
        .bind(input.description)
        .fetch_one(executor)
        .await
    }

    /// Find a subscription by ID.
    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as("SELECT * FROM webhook_subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// List a user's subscriptions, newest first.
    pub async fn list_by_user<'e, E>(executor: E, user_id: Uuid) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            SELECT * FROM webhook_subscriptions
            WHERE user_id = $1
            ORDER BY created_at DESC
            ",
        )
        .bind(user_id)
        .fetch_all(executor)
        .await
    }

    /// Active subscriptions that want `event_type`, oldest first.
    ///
    /// This order is the fan-out order for new deliveries.
    pub async fn find_active_by_event_type<'e, E>(
        executor: E,
        event_type: &str,
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            SELECT * FROM webhook_subscriptions
            WHERE is_active = TRUE AND $1 = ANY(events)
            ORDER BY created_at ASC
            ",
        )
        .bind(event_type)
        .fetch_all(executor)
        .await
    }

    /// Apply a partial update. Returns `None` if the subscription does not exist.
    pub async fn update<'e, E>(
        executor: E,
        id: Uuid,
        input: UpdateWebhookSubscription,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            UPDATE webhook_subscriptions
            SET url = COALESCE($2, url),
                events = COALESCE($3, events),
                is_active = COALESCE($4, is_active),
                description = COALESCE($5, description),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(input.url)
        .bind(input.events)
        .bind(input.is_active)
        .bind(input.description)
        .fetch_optional(executor)
        .await
    }

    /// Hard delete. Deliveries referencing the subscription are left in place.
    pub async fn delete<'e, E>(executor: E, id: Uuid) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Replace the signing secret.
    pub async fn update_secret<'e, E>(
        executor: E,
        id: Uuid,
        secret: &str,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r"
            UPDATE webhook_subscriptions
            SET secret = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(secret)
        .fetch_optional(executor)
        .await
    }

    /// Stamp the time of the most recent successful delivery.
    pub async fn update_last_delivery<'e, E>(
        executor: E,
        id: Uuid,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result =
            sqlx::query("UPDATE webhook_subscriptions SET last_delivery_at = $2 WHERE id = $1")
                .bind(id)
                .bind(delivered_at)
                .execute(executor)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count active subscriptions.
    pub async fn count_active<'e, E>(executor: E) -> Result<i64, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_scalar("SELECT COUNT(*) FROM webhook_subscriptions WHERE is_active = TRUE")
            .fetch_one(executor)
            .await
    }
}
