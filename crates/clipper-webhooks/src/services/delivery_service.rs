//! Webhook delivery execution service.
//!
//! Fans events out to matching subscriptions as ledger rows, then works the
//! ledger: claims due rows, attempts each one through the `DeliveryClient`,
//! and records the outcome through the claim before releasing it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use uuid::Uuid;

use clipper_db::{
    CreateWebhookDelivery, DeliveryStatus, WebhookDelivery, WebhookSubscription,
    DEFAULT_MAX_ATTEMPTS,
};

use crate::client::{DeliveryClient, OutboundRequest};
use crate::config::WebhookConfig;
use crate::error::WebhookError;
use crate::metrics::{DeliveryMetrics, SharedDeliveryMetrics};
use crate::models::{page_bounds, DeliveryPage, DeliveryStats, ProcessStats};
use crate::policy::{BackoffPolicy, FailureTransition};
use crate::services::event_publisher::WebhookEvent;
use crate::store::{AttemptFailure, AttemptSuccess, DeliveryClaim, WebhookStore};

/// Default number of attempts in flight within one batch.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default window for [`DeliveryService::stats`].
pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(3600);

enum AttemptOutcome {
    Success(AttemptSuccess),
    Failure(AttemptFailure),
}

/// Service for webhook delivery operations.
#[derive(Clone)]
pub struct DeliveryService<S> {
    store: S,
    client: Arc<dyn DeliveryClient>,
    max_attempts: i32,
    backoff: BackoffPolicy,
    concurrency: usize,
    stats_window: Duration,
    metrics: SharedDeliveryMetrics,
}

impl<S: WebhookStore> DeliveryService<S> {
    #[must_use]
    pub fn new(store: S, client: Arc<dyn DeliveryClient>) -> Self {
        Self {
            store,
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
            stats_window: DEFAULT_STATS_WINDOW,
            metrics: DeliveryMetrics::shared(),
        }
    }

    /// Apply attempt budget, backoff, concurrency and stats window from config.
    #[must_use]
    pub fn with_config(self, config: &WebhookConfig) -> Self {
        self.with_max_attempts(config.max_attempts)
            .with_backoff(BackoffPolicy::new(config.backoff_base, config.backoff_max))
            .with_concurrency(config.delivery_concurrency)
            .with_stats_window(config.stats_window)
    }

    /// Set the attempt budget for newly created deliveries.
    #[must_use]
    pub fn with_max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_stats_window(mut self, window: Duration) -> Self {
        self.stats_window = window;
        self
    }

    /// Record into an existing metrics handle instead of a private one.
    #[must_use]
    pub fn with_metrics(mut self, metrics: SharedDeliveryMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Snapshot of the delivery metrics.
    #[must_use]
    pub fn metrics(&self) -> DeliveryMetrics {
        self.metrics.read().clone()
    }

    /// Queue one pending delivery per active subscription wanting `event_type`.
    ///
    /// Rows are created in subscription order. A row that fails to insert is
    /// logged and skipped.
    pub async fn create_deliveries_for_event(
        &self,
        event_type: &str,
        event_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        let subscriptions = self.store.list_active_by_event_type(event_type).await?;

        if subscriptions.is_empty() {
            tracing::debug!(
                target: "webhook_delivery",
                event_id = %event_id,
                event_type = %event_type,
                "No active subscriptions match event type"
            );
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(subscriptions.len());
        for sub in &subscriptions {
            match self
                .store
                .create_delivery(CreateWebhookDelivery {
                    subscription_id: sub.id,
                    event_type: event_type.to_string(),
                    event_id,
                    payload: payload.clone(),
                    max_attempts: self.max_attempts,
                    next_attempt_at: now,
                })
                .await
            {
                Ok(delivery) => created.push(delivery),
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        subscription_id = %sub.id,
                        event_id = %event_id,
                        error = %e,
                        "Failed to create delivery record"
                    );
                }
            }
        }

        tracing::info!(
            target: "webhook_delivery",
            event_id = %event_id,
            event_type = %event_type,
            subscription_count = subscriptions.len(),
            created = created.len(),
            "Queued event for matching subscriptions"
        );

        Ok(created)
    }

    /// Queue a published event using its JSON envelope as the payload.
    pub async fn enqueue_event(
        &self,
        event: &WebhookEvent,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        let payload = serde_json::to_value(event.envelope())
            .map_err(|e| WebhookError::Internal(format!("Failed to serialize envelope: {e}")))?;
        self.create_deliveries_for_event(&event.event_type, event.event_id, payload)
            .await
    }

    /// Claim up to `limit` due deliveries, attempt them and record outcomes.
    ///
    /// Subscriptions for the whole batch are loaded before any attempt. If
    /// that lookup fails the claim is released, no row is touched and the
    /// error is returned. Attempts run in groups of at most `concurrency`.
    /// Outcomes are written through the claim and become visible together on
    /// commit. If recording fails the claim is dropped and every row in it
    /// becomes claimable again.
    pub async fn process_due(&self, limit: i64) -> Result<ProcessStats, WebhookError> {
        let mut claim = self.store.claim_due(limit).await?;
        let claimed = claim.deliveries().to_vec();

        if claimed.is_empty() {
            tracing::debug!(target: "webhook_delivery", "No deliveries due");
            claim.commit().await?;
            return Ok(ProcessStats::default());
        }

        let subscriptions = match self.load_subscriptions(&claimed).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    claimed = claimed.len(),
                    error = %e,
                    "Failed to load subscriptions, releasing claimed deliveries"
                );
                if let Err(release_err) = claim.release().await {
                    tracing::warn!(
                        target: "webhook_delivery",
                        error = %release_err,
                        "Failed to release claim"
                    );
                }
                return Err(e);
            }
        };

        let mut stats = ProcessStats {
            claimed: claimed.len(),
            ..ProcessStats::default()
        };

        let mut outcomes = Vec::with_capacity(claimed.len());
        for chunk in claimed.chunks(self.concurrency) {
            outcomes.extend(
                join_all(
                    chunk
                        .iter()
                        .map(|d| self.attempt(d, subscriptions.get(&d.subscription_id))),
                )
                .await,
            );
        }

        let mut recorded = Vec::with_capacity(claimed.len());
        for (delivery, outcome) in claimed.iter().zip(outcomes) {
            match outcome {
                AttemptOutcome::Success(success) => {
                    let row = claim.record_success(delivery.id, &success).await?;
                    stats.delivered += 1;
                    recorded.push(row);
                }
                AttemptOutcome::Failure(failure) => {
                    let row = claim.record_failure(delivery.id, &failure).await?;
                    if row.status == DeliveryStatus::Failed {
                        stats.exhausted += 1;
                        tracing::warn!(
                            target: "webhook_delivery",
                            delivery_id = %row.id,
                            subscription_id = %row.subscription_id,
                            attempt_count = row.attempt_count,
                            "Delivery exhausted its retries"
                        );
                    } else {
                        stats.retried += 1;
                    }
                    recorded.push(row);
                }
            }
        }

        claim.commit().await?;

        {
            let mut metrics = self.metrics.write();
            for row in &recorded {
                match row.status {
                    DeliveryStatus::Delivered => {
                        metrics.record_delivered(row.subscription_id, row.attempt_count);
                    }
                    status => metrics.record_failed(
                        row.subscription_id,
                        row.attempt_count,
                        status == DeliveryStatus::Failed,
                    ),
                }
            }
        }

        for row in &recorded {
            let Some(at) = row.delivered_at else { continue };
            if let Err(e) = self.store.record_last_delivery(row.subscription_id, at).await {
                tracing::error!(
                    target: "webhook_delivery",
                    subscription_id = %row.subscription_id,
                    error = %e,
                    "Failed to record last delivery time"
                );
            }
        }

        tracing::info!(
            target: "webhook_delivery",
            claimed = stats.claimed,
            delivered = stats.delivered,
            retried = stats.retried,
            exhausted = stats.exhausted,
            "Processed due deliveries"
        );

        Ok(stats)
    }

    /// Subscriptions referenced by `deliveries`, keyed by id. Deleted ones are absent.
    async fn load_subscriptions(
        &self,
        deliveries: &[WebhookDelivery],
    ) -> Result<HashMap<Uuid, WebhookSubscription>, WebhookError> {
        let mut ids: Vec<Uuid> = deliveries.iter().map(|d| d.subscription_id).collect();
        ids.sort_unstable();
        ids.dedup();

        let mut subscriptions = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(sub) = self.store.find_subscription(id).await? {
                subscriptions.insert(id, sub);
            }
        }
        Ok(subscriptions)
    }

    /// One HTTP attempt. Never touches the ledger.
    async fn attempt(
        &self,
        delivery: &WebhookDelivery,
        subscription: Option<&WebhookSubscription>,
    ) -> AttemptOutcome {
        // Deactivation stops new fan-out only; queued rows still go out.
        let Some(subscription) = subscription else {
            return self.failure(delivery, None, "Subscription not found".to_string());
        };

        let request = OutboundRequest {
            delivery_id: delivery.id,
            url: subscription.url.clone(),
            secret: subscription.secret.clone(),
            event_type: delivery.event_type.clone(),
            payload: delivery.payload.clone(),
            replay: false,
        };

        let started = Instant::now();
        let result = self.client.deliver(&request).await;
        let elapsed = started.elapsed();
        self.metrics.write().record_attempt_duration(elapsed);

        match result {
            Ok(response) if response.is_success() => {
                tracing::info!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    subscription_id = %delivery.subscription_id,
                    event_id = %delivery.event_id,
                    event_type = %delivery.event_type,
                    response_code = response.status_code,
                    attempt_number = delivery.attempt_count + 1,
                    duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "Webhook delivery succeeded"
                );
                AttemptOutcome::Success(AttemptSuccess {
                    http_status_code: i32::from(response.status_code),
                    response_body: response.body,
                })
            }
            Ok(response) => self.failure(
                delivery,
                Some(i32::from(response.status_code)),
                response.failure_message(),
            ),
            Err(e) => self.failure(delivery, None, e.to_string()),
        }
    }

    fn failure(
        &self,
        delivery: &WebhookDelivery,
        http_status_code: Option<i32>,
        error_message: String,
    ) -> AttemptOutcome {
        let transition = FailureTransition::evaluate(delivery.attempt_count, delivery.max_attempts);
        let next_attempt_at = (!transition.is_exhausted())
            .then(|| self.backoff.next_attempt_at(transition.attempt_count, Utc::now()));

        tracing::warn!(
            target: "webhook_delivery",
            delivery_id = %delivery.id,
            subscription_id = %delivery.subscription_id,
            event_id = %delivery.event_id,
            event_type = %delivery.event_type,
            error = %error_message,
            attempt_number = transition.attempt_count,
            has_next_retry = next_attempt_at.is_some(),
            "Webhook delivery failed"
        );

        AttemptOutcome::Failure(AttemptFailure {
            http_status_code,
            error_message,
            next_attempt_at,
        })
    }

    /// Deliveries for a subscription, newest first.
    pub async fn list_for_subscription(
        &self,
        subscription_id: Uuid,
        page: i64,
        limit: i64,
    ) -> Result<DeliveryPage, WebhookError> {
        let (page, limit, offset) = page_bounds(page, limit);
        let items = self
            .store
            .list_deliveries_by_subscription(subscription_id, limit, offset)
            .await?;
        let total = self
            .store
            .count_deliveries_by_subscription(subscription_id)
            .await?;

        Ok(DeliveryPage {
            items,
            total,
            page,
            limit,
            has_more: (offset + limit) < total,
        })
    }

    pub async fn get_delivery(&self, id: Uuid) -> Result<WebhookDelivery, WebhookError> {
        self.store
            .find_delivery(id)
            .await?
            .ok_or(WebhookError::DeliveryNotFound)
    }

    /// Health snapshot over the configured window.
    pub async fn stats(&self) -> Result<DeliveryStats, WebhookError> {
        self.stats_for(self.stats_window).await
    }

    /// Health snapshot over an explicit window.
    pub async fn stats_for(&self, window: Duration) -> Result<DeliveryStats, WebhookError> {
        let window_chrono = chrono::Duration::from_std(window)
            .map_err(|e| WebhookError::Validation(format!("Invalid stats window: {e}")))?;
        let since = Utc::now() - window_chrono;

        let active_subscriptions = self.store.count_active_subscriptions().await?;
        let pending_deliveries = self.store.count_pending_deliveries().await?;
        let recent = self.store.recent_delivery_counts(since).await?;

        Ok(DeliveryStats {
            active_subscriptions,
            pending_deliveries,
            recent_delivered: recent.delivered,
            recent_failed: recent.failed,
            recent_pending: recent.pending,
            window_secs: window.as_secs(),
        })
    }
}
