//! Background worker driving the delivery engine.
//!
//! One loop turns published events into ledger rows, drains due deliveries
//! on every poll tick and sweeps exhausted deliveries into the dead letter
//! archive. Several workers may run against the same database; claims keep
//! their batches disjoint.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::DeliveryClient;
use crate::config::WebhookConfig;
use crate::metrics::{DeliveryMetrics, SharedDeliveryMetrics};
use crate::services::delivery_service::DeliveryService;
use crate::services::dlq_service::DlqService;
use crate::services::event_publisher::WebhookEvent;
use crate::store::WebhookStore;

/// Worker that consumes events and processes the delivery ledger.
pub struct WebhookWorker<S> {
    delivery: DeliveryService<S>,
    dlq: DlqService<S>,
    receiver: broadcast::Receiver<WebhookEvent>,
    config: WebhookConfig,
    metrics: SharedDeliveryMetrics,
    cancel: CancellationToken,
}

impl<S: WebhookStore> WebhookWorker<S> {
    /// Create a worker over `store` fed by `receiver`.
    pub fn new(
        store: S,
        client: Arc<dyn DeliveryClient>,
        receiver: broadcast::Receiver<WebhookEvent>,
        config: WebhookConfig,
    ) -> Self {
        let metrics = DeliveryMetrics::shared();
        Self {
            delivery: DeliveryService::new(store.clone(), client.clone())
                .with_config(&config)
                .with_metrics(metrics.clone()),
            dlq: DlqService::new(store, client).with_metrics(metrics.clone()),
            receiver,
            config,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    /// Metrics handle shared by the loop's delivery and dead letter services.
    #[must_use]
    pub fn metrics(&self) -> SharedDeliveryMetrics {
        self.metrics.clone()
    }

    /// Token that stops the loop when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the loop on a tokio task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until the cancellation token fires.
    ///
    /// Ticks are polled ahead of the event channel, so a busy channel never
    /// holds off ledger processing.
    /// An in-progress batch finishes before the loop checks the token again.
    pub async fn run(mut self) {
        tracing::info!(
            target: "webhook_delivery",
            poll_interval_secs = self.config.poll_interval.as_secs(),
            dlq_sweep_interval_secs = self.config.dlq_sweep_interval.as_secs(),
            batch_size = self.config.retry_batch_size,
            "Starting webhook worker"
        );

        let mut poll_interval = interval(self.config.poll_interval);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_interval = interval(self.config.dlq_sweep_interval);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    tracing::info!(target: "webhook_delivery", "Worker shutdown requested");
                    break;
                }
                _ = poll_interval.tick() => {
                    self.drain_due().await;
                }
                _ = sweep_interval.tick() => {
                    self.sweep_dead_letters().await;
                }
                received = self.receiver.recv(), if events_open => {
                    match received {
                        Ok(event) => self.handle_event(&event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                target: "webhook_delivery",
                                skipped,
                                "Worker lagged behind event channel, events dropped"
                            );
                        }
                        Err(RecvError::Closed) => {
                            tracing::info!(
                                target: "webhook_delivery",
                                "Event channel closed, continuing with ledger processing only"
                            );
                            events_open = false;
                        }
                    }
                }
            }
        }

        tracing::info!(target: "webhook_delivery", "Webhook worker stopped");
    }

    async fn handle_event(&self, event: &WebhookEvent) {
        if let Err(e) = self.delivery.enqueue_event(event).await {
            tracing::error!(
                target: "webhook_delivery",
                event_id = %event.event_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to queue deliveries for event"
            );
        }
    }

    /// Process batches until one comes back short.
    async fn drain_due(&self) {
        let batch_size = self.config.retry_batch_size;

        loop {
            match self.delivery.process_due(batch_size).await {
                Ok(stats) => {
                    let full = i64::try_from(stats.claimed).unwrap_or(i64::MAX) >= batch_size;
                    if !full || self.cancel.is_cancelled() {
                        return;
                    }
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(
                            target: "webhook_delivery",
                            error = %e,
                            "Transient error processing due deliveries"
                        );
                    } else {
                        tracing::error!(
                            target: "webhook_delivery",
                            error = %e,
                            "Failed to process due deliveries"
                        );
                    }
                    return;
                }
            }
        }
    }

    async fn sweep_dead_letters(&self) {
        match self.dlq.sweep(self.config.retry_batch_size).await {
            Ok(archived) if !archived.is_empty() => {
                tracing::info!(target: "dlq", count = archived.len(), "Dead letter sweep archived deliveries");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(target: "dlq", error = %e, "Dead letter sweep failed");
            }
        }
    }
}
