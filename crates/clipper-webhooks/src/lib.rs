//! Outbound webhook delivery for clip moderation events.
//!
//! Manages endpoint subscriptions, fans events out into a delivery ledger,
//! delivers with HMAC-SHA256 signing and exponential backoff retries, and
//! archives exhausted deliveries into a dead letter queue for replay.

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod models;
pub mod policy;
pub mod services;
pub mod store;
pub mod validation;
pub mod worker;

pub use client::{DeliveryClient, DeliveryResponse, HttpDeliveryClient, OutboundRequest};
pub use config::WebhookConfig;
pub use error::{DeliveryAttemptError, WebhookError};
pub use metrics::{DeadLetterReason, DeliveryMetrics, SharedDeliveryMetrics};
pub use models::WebhookEventType;
pub use policy::{BackoffPolicy, FailureTransition};
pub use services::delivery_service::DeliveryService;
pub use services::dlq_service::DlqService;
pub use services::event_publisher::{EventPublisher, WebhookEvent};
pub use services::subscription_service::{CreateSubscriptionRequest, SubscriptionService};
pub use store::{InMemoryWebhookStore, PgWebhookStore, WebhookStore};
pub use worker::WebhookWorker;
