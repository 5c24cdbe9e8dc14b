//! Business logic services for the webhook engine.

pub mod delivery_service;
pub mod dlq_service;
pub mod event_publisher;
pub mod subscription_service;
