//! PostgreSQL persistence for outbound webhook delivery.
//!
//! Tables for subscriptions, the delivery ledger and the dead-letter
//! archive, plus the pool wrapper and embedded migrations.

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;

pub use error::DbError;
pub use migrations::run_migrations;
pub use models::*;
pub use pool::DbPool;
