//! Storage seams for subscriptions, the delivery ledger, claims and the
//! dead-letter archive.
//!
//! Two backends implement every trait: [`PgWebhookStore`] for production and
//! [`InMemoryWebhookStore`] for tests and single-process embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use clipper_db::{
    CreateWebhookDelivery, CreateWebhookSubscription, DeliveryCounts, UpdateWebhookSubscription,
    WebhookDeadLetter, WebhookDelivery, WebhookSubscription,
};

use crate::error::WebhookError;

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryDeliveryClaim, InMemoryWebhookStore};
pub use postgres::{PgDeliveryClaim, PgWebhookStore};

/// A 2xx answer from the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSuccess {
    pub http_status_code: i32,
    pub response_body: Option<String>,
}

/// A failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Absent when no response was received.
    pub http_status_code: Option<i32>,
    pub error_message: String,
    /// Earliest next attempt. `None` on a row that stays pending means now.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create_subscription(
        &self,
        input: CreateWebhookSubscription,
    ) -> Result<WebhookSubscription, WebhookError>;

    async fn find_subscription(&self, id: Uuid)
        -> Result<Option<WebhookSubscription>, WebhookError>;

    /// Newest first.
    async fn list_subscriptions_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>, WebhookError>;

    /// Active subscriptions wanting `event_type`, oldest first.
    async fn list_active_by_event_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, WebhookError>;

    async fn update_subscription(
        &self,
        id: Uuid,
        input: UpdateWebhookSubscription,
    ) -> Result<Option<WebhookSubscription>, WebhookError>;

    async fn delete_subscription(&self, id: Uuid) -> Result<bool, WebhookError>;

    async fn rotate_secret(
        &self,
        id: Uuid,
        secret: &str,
    ) -> Result<Option<WebhookSubscription>, WebhookError>;

    async fn record_last_delivery(
        &self,
        id: Uuid,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, WebhookError>;

    async fn count_active_subscriptions(&self) -> Result<i64, WebhookError>;
}

#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn create_delivery(
        &self,
        input: CreateWebhookDelivery,
    ) -> Result<WebhookDelivery, WebhookError>;

    async fn find_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>, WebhookError>;

    /// Newest first.
    async fn list_deliveries_by_subscription(
        &self,
        subscription_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, WebhookError>;

    async fn count_deliveries_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<i64, WebhookError>;

    async fn count_pending_deliveries(&self) -> Result<i64, WebhookError>;

    /// Status counts over rows updated at or after `since`.
    async fn recent_delivery_counts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<DeliveryCounts, WebhookError>;

    /// Terminal: marks the row delivered.
    async fn record_success(
        &self,
        id: Uuid,
        outcome: &AttemptSuccess,
    ) -> Result<WebhookDelivery, WebhookError>;

    /// Counts the attempt and either reschedules or exhausts the row.
    async fn record_failure(
        &self,
        id: Uuid,
        outcome: &AttemptFailure,
    ) -> Result<WebhookDelivery, WebhookError>;
}

/// Exclusive ownership of a batch of due deliveries.
///
/// Outcomes written through the claim become visible on [`commit`]. Dropping
/// the claim instead releases every row unchanged.
///
/// [`commit`]: DeliveryClaim::commit
#[async_trait]
pub trait DeliveryClaim: Send {
    fn deliveries(&self) -> &[WebhookDelivery];

    async fn record_success(
        &mut self,
        id: Uuid,
        outcome: &AttemptSuccess,
    ) -> Result<WebhookDelivery, WebhookError>;

    async fn record_failure(
        &mut self,
        id: Uuid,
        outcome: &AttemptFailure,
    ) -> Result<WebhookDelivery, WebhookError>;

    async fn commit(self) -> Result<(), WebhookError>;

    /// Release without applying anything.
    async fn release(self) -> Result<(), WebhookError>;
}

#[async_trait]
pub trait ClaimScheduler: Send + Sync {
    type Claim: DeliveryClaim + 'static;

    /// Lock up to `limit` due deliveries, oldest `next_attempt_at` first.
    /// Rows held by another claim are skipped, never waited on.
    async fn claim_due(&self, limit: i64) -> Result<Self::Claim, WebhookError>;
}

#[async_trait]
pub trait DeadLetterArchive: Send + Sync {
    /// Archive a failed delivery. The ledger row is left untouched.
    async fn migrate_to_dead_letter(
        &self,
        delivery: &WebhookDelivery,
    ) -> Result<WebhookDeadLetter, WebhookError>;

    /// Archive up to `limit` failed deliveries that have no entry yet.
    async fn migrate_exhausted(&self, limit: i64) -> Result<Vec<WebhookDeadLetter>, WebhookError>;

    /// Newest archived first.
    async fn list_dead_letters(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDeadLetter>, WebhookError>;

    async fn find_dead_letter(&self, id: Uuid) -> Result<Option<WebhookDeadLetter>, WebhookError>;

    async fn count_dead_letters(&self) -> Result<i64, WebhookError>;

    /// Overwrites any earlier replay outcome.
    async fn record_replay(
        &self,
        id: Uuid,
        successful: bool,
    ) -> Result<Option<WebhookDeadLetter>, WebhookError>;

    async fn delete_dead_letter(&self, id: Uuid) -> Result<bool, WebhookError>;
}

/// Every seam in one bound.
pub trait WebhookStore:
    SubscriptionStore + DeliveryLedger + ClaimScheduler + DeadLetterArchive + Clone + 'static
{
}

impl<T> WebhookStore for T where
    T: SubscriptionStore + DeliveryLedger + ClaimScheduler + DeadLetterArchive + Clone + 'static
{
}

/// Log and report an outcome write against a terminal row.
pub(crate) fn is_ignored_terminal_write(delivery: &WebhookDelivery, outcome: &str) -> bool {
    if delivery.status.is_terminal() {
        tracing::warn!(
            target: "webhook_delivery",
            delivery_id = %delivery.id,
            status = %delivery.status,
            outcome,
            "Ignoring outcome for delivery that is no longer pending"
        );
        return true;
    }
    false
}

/// Reject a delivery that could never be attempted.
pub(crate) fn ensure_attempt_budget(input: &CreateWebhookDelivery) -> Result<(), WebhookError> {
    if input.max_attempts < 1 {
        return Err(WebhookError::Validation(format!(
            "max_attempts must be at least 1, got {}",
            input.max_attempts
        )));
    }
    Ok(())
}

/// Reject archiving anything but a failed delivery.
pub(crate) fn ensure_archivable(delivery: &WebhookDelivery) -> Result<(), WebhookError> {
    if delivery.status == clipper_db::DeliveryStatus::Failed {
        Ok(())
    } else {
        Err(WebhookError::InvalidState(format!(
            "Delivery {} is {}, only failed deliveries can be archived",
            delivery.id, delivery.status
        )))
    }
}
