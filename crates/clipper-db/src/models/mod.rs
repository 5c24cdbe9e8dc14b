//! Database entity models for clipper-db.
//!
//! Each model owns the SQL for its table. Functions are generic over
//! `PgExecutor` so callers can run them on the pool or inside a transaction.

pub mod webhook_dead_letter;
pub mod webhook_delivery;
pub mod webhook_subscription;

pub use webhook_dead_letter::{CreateWebhookDeadLetter, WebhookDeadLetter, DEFAULT_FAILURE_REASON};
pub use webhook_delivery::{
    CreateWebhookDelivery, DeliveryCounts, DeliveryFailureUpdate, DeliveryStatus,
    WebhookDelivery, DEFAULT_MAX_ATTEMPTS,
};
pub use webhook_subscription::{
    CreateWebhookSubscription, UpdateWebhookSubscription, WebhookSubscription,
};
