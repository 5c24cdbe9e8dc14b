//! Dead letter queue service for exhausted deliveries.
//!
//! Moves failed deliveries into the archive, lists and inspects entries, and
//! replays an entry once on operator request. A replay records its outcome on
//! the entry only; the delivery ledger is never touched.

use std::sync::Arc;

use uuid::Uuid;

use clipper_db::WebhookDeadLetter;

use crate::client::{DeliveryClient, OutboundRequest};
use crate::error::WebhookError;
use crate::metrics::{DeadLetterReason, DeliveryMetrics, SharedDeliveryMetrics};
use crate::models::{page_bounds, DeadLetterPage, ReplayResult};
use crate::store::WebhookStore;

/// Default number of deliveries archived per sweep.
pub const DEFAULT_SWEEP_LIMIT: i64 = 100;

/// Service for managing dead letter entries.
#[derive(Clone)]
pub struct DlqService<S> {
    store: S,
    client: Arc<dyn DeliveryClient>,
    metrics: SharedDeliveryMetrics,
}

impl<S: WebhookStore> DlqService<S> {
    #[must_use]
    pub fn new(store: S, client: Arc<dyn DeliveryClient>) -> Self {
        Self {
            store,
            client,
            metrics: DeliveryMetrics::shared(),
        }
    }

    /// Record into an existing metrics handle instead of a private one.
    #[must_use]
    pub fn with_metrics(mut self, metrics: SharedDeliveryMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Snapshot of the metrics this service records into.
    #[must_use]
    pub fn metrics(&self) -> DeliveryMetrics {
        self.metrics.read().clone()
    }

    /// Archive up to `limit` failed deliveries not yet in the archive.
    pub async fn sweep(&self, limit: i64) -> Result<Vec<WebhookDeadLetter>, WebhookError> {
        let archived = self.store.migrate_exhausted(limit).await?;

        let mut metrics = self.metrics.write();
        for entry in &archived {
            let reason = DeadLetterReason::from_status(entry.http_status_code);
            metrics.record_dead_letter(reason);
            tracing::info!(
                target: "dlq",
                dlq_id = %entry.id,
                delivery_id = %entry.delivery_id,
                subscription_id = %entry.subscription_id,
                event_id = %entry.event_id,
                attempt_count = entry.attempt_count,
                reason = %reason,
                "Webhook moved to dead letter queue"
            );
        }
        drop(metrics);

        Ok(archived)
    }

    /// Entries newest first.
    pub async fn list(&self, page: i64, limit: i64) -> Result<DeadLetterPage, WebhookError> {
        let (page, limit, offset) = page_bounds(page, limit);
        let items = self.store.list_dead_letters(limit, offset).await?;
        let total = self.store.count_dead_letters().await?;

        Ok(DeadLetterPage {
            items,
            total,
            page,
            limit,
            has_more: (offset + limit) < total,
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<WebhookDeadLetter, WebhookError> {
        self.store
            .find_dead_letter(id)
            .await?
            .ok_or(WebhookError::DeadLetterNotFound)
    }

    /// Attempt the archived payload once more and record the outcome.
    ///
    /// The subscription must still exist and be active. An unsuccessful
    /// attempt is reported in the result, not as an error.
    pub async fn replay(&self, id: Uuid) -> Result<ReplayResult, WebhookError> {
        let entry = self.get(id).await?;

        let subscription = self
            .store
            .find_subscription(entry.subscription_id)
            .await?
            .ok_or(WebhookError::SubscriptionNotFound)?;
        if !subscription.is_active {
            return Err(WebhookError::SubscriptionInactive);
        }

        let request = OutboundRequest {
            delivery_id: entry.delivery_id,
            url: subscription.url,
            secret: subscription.secret,
            event_type: entry.event_type.clone(),
            payload: entry.payload.clone(),
            replay: true,
        };

        let (successful, http_status_code, error_message) =
            match self.client.deliver(&request).await {
                Ok(response) if response.is_success() => {
                    (true, Some(i32::from(response.status_code)), None)
                }
                Ok(response) => (
                    false,
                    Some(i32::from(response.status_code)),
                    Some(response.failure_message()),
                ),
                Err(e) => (false, None, Some(e.to_string())),
            };
        self.metrics.write().record_replay(successful);

        // The attempt already went out; a lost outcome must not look like
        // a replay that never happened.
        let entry = match self.store.record_replay(id, successful).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Err(WebhookError::DeadLetterNotFound),
            Err(e) => {
                return Err(WebhookError::ReplayFailed(format!(
                    "attempt sent (successful: {successful}) but outcome not recorded: {e}"
                )))
            }
        };

        tracing::info!(
            target: "dlq",
            dlq_id = %id,
            delivery_id = %entry.delivery_id,
            subscription_id = %entry.subscription_id,
            successful,
            http_status_code,
            "Dead letter entry replayed"
        );

        Ok(ReplayResult {
            entry,
            successful,
            http_status_code,
            error_message,
        })
    }

    /// Permanently remove an entry.
    pub async fn delete(&self, id: Uuid) -> Result<(), WebhookError> {
        if !self.store.delete_dead_letter(id).await? {
            return Err(WebhookError::DeadLetterNotFound);
        }

        tracing::info!(target: "dlq", dlq_id = %id, "Dead letter entry deleted");
        Ok(())
    }
}
