//! PostgreSQL backend.
//!
//! A claim is an open transaction holding `FOR UPDATE SKIP LOCKED` row
//! locks. Outcomes for claimed rows must be written through the claim; a
//! pool-level write to a claimed row would wait for the claim to finish.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use clipper_db::{
    CreateWebhookDeadLetter, CreateWebhookDelivery, CreateWebhookSubscription, DbPool,
    DeliveryCounts, DeliveryFailureUpdate, UpdateWebhookSubscription, WebhookDeadLetter,
    WebhookDelivery, WebhookSubscription,
};

use super::{
    ensure_archivable, ensure_attempt_budget, is_ignored_terminal_write, AttemptFailure, AttemptSuccess, ClaimScheduler,
    DeadLetterArchive, DeliveryClaim, DeliveryLedger, SubscriptionStore,
};
use crate::error::WebhookError;
use crate::policy::FailureTransition;

/// Store backed by a `PgPool`.
#[derive(Debug, Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
}

impl PgWebhookStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn from_db_pool(pool: &DbPool) -> Self {
        Self::new(pool.inner().clone())
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Lock the row, then mark it delivered unless it is already terminal.
async fn write_success(
    conn: &mut PgConnection,
    id: Uuid,
    outcome: &AttemptSuccess,
) -> Result<WebhookDelivery, WebhookError> {
    let current = WebhookDelivery::lock_by_id(&mut *conn, id)
        .await?
        .ok_or(WebhookError::DeliveryNotFound)?;
    if is_ignored_terminal_write(&current, "success") {
        return Ok(current);
    }

    let updated = WebhookDelivery::apply_success(
        &mut *conn,
        id,
        outcome.http_status_code,
        outcome.response_body.as_deref(),
        Utc::now(),
    )
    .await?;
    Ok(updated)
}

/// Lock the row, evaluate the transition against its persisted attempt
/// count, and write every affected column at once.
async fn write_failure(
    conn: &mut PgConnection,
    id: Uuid,
    outcome: &AttemptFailure,
) -> Result<WebhookDelivery, WebhookError> {
    let current = WebhookDelivery::lock_by_id(&mut *conn, id)
        .await?
        .ok_or(WebhookError::DeliveryNotFound)?;
    if is_ignored_terminal_write(&current, "failure") {
        return Ok(current);
    }

    let transition = FailureTransition::evaluate(current.attempt_count, current.max_attempts);
    let next_attempt_at = if transition.is_exhausted() {
        outcome.next_attempt_at
    } else {
        Some(outcome.next_attempt_at.unwrap_or_else(Utc::now))
    };

    let updated = WebhookDelivery::apply_failure(
        &mut *conn,
        id,
        &DeliveryFailureUpdate {
            status: transition.status,
            attempt_count: transition.attempt_count,
            http_status_code: outcome.http_status_code,
            error_message: outcome.error_message.clone(),
            next_attempt_at,
        },
    )
    .await?;
    Ok(updated)
}

#[async_trait]
impl SubscriptionStore for PgWebhookStore {
    async fn create_subscription(
        &self,
        input: CreateWebhookSubscription,
    ) -> Result<WebhookSubscription, WebhookError> {
        Ok(WebhookSubscription::create(&self.pool, input).await?)
    }

    async fn find_subscription(
        &self,
        id: Uuid,
    ) -> Result<Option<WebhookSubscription>, WebhookError> {
        Ok(WebhookSubscription::find_by_id(&self.pool, id).await?)
    }

    async fn list_subscriptions_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>, WebhookError> {
        Ok(WebhookSubscription::list_by_user(&self.pool, user_id).await?)
    }

    async fn list_active_by_event_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, WebhookError> {
        Ok(WebhookSubscription::find_active_by_event_type(&self.pool, event_type).await?)
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        input: UpdateWebhookSubscription,
    ) -> Result<Option<WebhookSubscription>, WebhookError> {
        Ok(WebhookSubscription::update(&self.pool, id, input).await?)
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<bool, WebhookError> {
        Ok(WebhookSubscription::delete(&self.pool, id).await?)
    }

    async fn rotate_secret(
        &self,
        id: Uuid,
        secret: &str,
    ) -> Result<Option<WebhookSubscription>, WebhookError> {
        Ok(WebhookSubscription::update_secret(&self.pool, id, secret).await?)
    }

    async fn record_last_delivery(
        &self,
        id: Uuid,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, WebhookError> {
        Ok(WebhookSubscription::update_last_delivery(&self.pool, id, delivered_at).await?)
    }

    async fn count_active_subscriptions(&self) -> Result<i64, WebhookError> {
        Ok(WebhookSubscription::count_active(&self.pool).await?)
    }
}

#[async_trait]
impl DeliveryLedger for PgWebhookStore {
    async fn create_delivery(
        &self,
        input: CreateWebhookDelivery,
    ) -> Result<WebhookDelivery, WebhookError> {
        ensure_attempt_budget(&input)?;
        Ok(WebhookDelivery::create(&self.pool, input).await?)
    }

    async fn find_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>, WebhookError> {
        Ok(WebhookDelivery::find_by_id(&self.pool, id).await?)
    }

    async fn list_deliveries_by_subscription(
        &self,
        subscription_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        Ok(
            WebhookDelivery::list_by_subscription(&self.pool, subscription_id, limit, offset)
                .await?,
        )
    }

    async fn count_deliveries_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<i64, WebhookError> {
        Ok(WebhookDelivery::count_by_subscription(&self.pool, subscription_id).await?)
    }

    async fn count_pending_deliveries(&self) -> Result<i64, WebhookError> {
        Ok(WebhookDelivery::count_pending(&self.pool).await?)
    }

    async fn recent_delivery_counts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<DeliveryCounts, WebhookError> {
        Ok(WebhookDelivery::counts_since(&self.pool, since).await?)
    }

    async fn record_success(
        &self,
        id: Uuid,
        outcome: &AttemptSuccess,
    ) -> Result<WebhookDelivery, WebhookError> {
        let mut tx = self.pool.begin().await?;
        let delivery = write_success(&mut *tx, id, outcome).await?;
        tx.commit().await?;
        Ok(delivery)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        outcome: &AttemptFailure,
    ) -> Result<WebhookDelivery, WebhookError> {
        let mut tx = self.pool.begin().await?;
        let delivery = write_failure(&mut *tx, id, outcome).await?;
        tx.commit().await?;
        Ok(delivery)
    }
}

/// Claim backed by an open transaction.
pub struct PgDeliveryClaim {
    tx: Transaction<'static, Postgres>,
    deliveries: Vec<WebhookDelivery>,
    ids: HashSet<Uuid>,
}

impl PgDeliveryClaim {
    fn ensure_claimed(&self, id: Uuid) -> Result<(), WebhookError> {
        if self.ids.contains(&id) {
            Ok(())
        } else {
            Err(WebhookError::InvalidState(format!(
                "Delivery {id} is not part of this claim"
            )))
        }
    }
}

#[async_trait]
impl DeliveryClaim for PgDeliveryClaim {
    fn deliveries(&self) -> &[WebhookDelivery] {
        &self.deliveries
    }

    async fn record_success(
        &mut self,
        id: Uuid,
        outcome: &AttemptSuccess,
    ) -> Result<WebhookDelivery, WebhookError> {
        self.ensure_claimed(id)?;
        write_success(&mut *self.tx, id, outcome).await
    }

    async fn record_failure(
        &mut self,
        id: Uuid,
        outcome: &AttemptFailure,
    ) -> Result<WebhookDelivery, WebhookError> {
        self.ensure_claimed(id)?;
        write_failure(&mut *self.tx, id, outcome).await
    }

    async fn commit(self) -> Result<(), WebhookError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn release(self) -> Result<(), WebhookError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl ClaimScheduler for PgWebhookStore {
    type Claim = PgDeliveryClaim;

    async fn claim_due(&self, limit: i64) -> Result<PgDeliveryClaim, WebhookError> {
        let mut tx = self.pool.begin().await?;
        let deliveries = WebhookDelivery::lock_due(&mut *tx, Utc::now(), limit.max(0)).await?;
        let ids = deliveries.iter().map(|d| d.id).collect();

        Ok(PgDeliveryClaim {
            tx,
            deliveries,
            ids,
        })
    }
}

#[async_trait]
impl DeadLetterArchive for PgWebhookStore {
    async fn migrate_to_dead_letter(
        &self,
        delivery: &WebhookDelivery,
    ) -> Result<WebhookDeadLetter, WebhookError> {
        ensure_archivable(delivery)?;
        let entry = WebhookDeadLetter::create(
            &self.pool,
            CreateWebhookDeadLetter::from_delivery(delivery),
        )
        .await?;
        Ok(entry)
    }

    async fn migrate_exhausted(&self, limit: i64) -> Result<Vec<WebhookDeadLetter>, WebhookError> {
        let mut tx = self.pool.begin().await?;

        if !WebhookDeadLetter::try_lock_sweep(&mut *tx).await? {
            tracing::debug!(target: "dlq", "Another dead-letter sweep is running");
            return Ok(Vec::new());
        }

        let failed = WebhookDelivery::lock_unarchived_failed(&mut *tx, limit.max(0)).await?;
        let mut archived = Vec::with_capacity(failed.len());
        for delivery in &failed {
            let entry = WebhookDeadLetter::create(
                &mut *tx,
                CreateWebhookDeadLetter::from_delivery(delivery),
            )
            .await?;
            archived.push(entry);
        }

        tx.commit().await?;
        Ok(archived)
    }

    async fn list_dead_letters(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDeadLetter>, WebhookError> {
        Ok(WebhookDeadLetter::list(&self.pool, limit, offset).await?)
    }

    async fn find_dead_letter(&self, id: Uuid) -> Result<Option<WebhookDeadLetter>, WebhookError> {
        Ok(WebhookDeadLetter::find_by_id(&self.pool, id).await?)
    }

    async fn count_dead_letters(&self) -> Result<i64, WebhookError> {
        Ok(WebhookDeadLetter::count_all(&self.pool).await?)
    }

    async fn record_replay(
        &self,
        id: Uuid,
        successful: bool,
    ) -> Result<Option<WebhookDeadLetter>, WebhookError> {
        Ok(WebhookDeadLetter::record_replay(&self.pool, id, Utc::now(), successful).await?)
    }

    async fn delete_dead_letter(&self, id: Uuid) -> Result<bool, WebhookError> {
        Ok(WebhookDeadLetter::delete(&self.pool, id).await?)
    }
}
