//! Engine configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::WebhookError;

/// Tunables for delivery, retries and the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    /// Attempts before a delivery is marked failed.
    pub max_attempts: i32,
    /// Rows claimed per `process_due` call.
    pub retry_batch_size: i64,
    pub poll_interval: Duration,
    pub dlq_sweep_interval: Duration,
    pub http_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Attempts in flight at once within a batch.
    pub delivery_concurrency: usize,
    /// Window for `DeliveryService::stats`.
    pub stats_window: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_batch_size: 100,
            poll_interval: Duration::from_secs(60),
            dlq_sweep_interval: Duration::from_secs(300),
            http_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(3600),
            delivery_concurrency: 8,
            stats_window: Duration::from_secs(3600),
        }
    }
}

impl WebhookConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (defaults in parentheses):
    /// - `WEBHOOK_MAX_ATTEMPTS` (5)
    /// - `WEBHOOK_RETRY_BATCH_SIZE` (100)
    /// - `WEBHOOK_POLL_INTERVAL_SECS` (60)
    /// - `WEBHOOK_DLQ_SWEEP_INTERVAL_SECS` (300)
    /// - `WEBHOOK_HTTP_TIMEOUT_SECS` (10)
    /// - `WEBHOOK_BACKOFF_BASE_SECS` (30)
    /// - `WEBHOOK_BACKOFF_MAX_SECS` (3600)
    /// - `WEBHOOK_DELIVERY_CONCURRENCY` (8)
    /// - `WEBHOOK_STATS_WINDOW_SECS` (3600)
    pub fn from_env() -> Result<Self, WebhookError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WebhookError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_attempts: i32 = parse_var(&lookup, "WEBHOOK_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts < 1 {
            return Err(WebhookError::Config {
                var: "WEBHOOK_MAX_ATTEMPTS".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let retry_batch_size: i64 =
            parse_var(&lookup, "WEBHOOK_RETRY_BATCH_SIZE", defaults.retry_batch_size)?;
        if retry_batch_size < 1 {
            return Err(WebhookError::Config {
                var: "WEBHOOK_RETRY_BATCH_SIZE".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let delivery_concurrency: usize = parse_var(
            &lookup,
            "WEBHOOK_DELIVERY_CONCURRENCY",
            defaults.delivery_concurrency,
        )?;
        if delivery_concurrency == 0 {
            return Err(WebhookError::Config {
                var: "WEBHOOK_DELIVERY_CONCURRENCY".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let backoff_base = secs_var(&lookup, "WEBHOOK_BACKOFF_BASE_SECS", defaults.backoff_base)?;
        let backoff_max = secs_var(&lookup, "WEBHOOK_BACKOFF_MAX_SECS", defaults.backoff_max)?;
        if backoff_max < backoff_base {
            return Err(WebhookError::Config {
                var: "WEBHOOK_BACKOFF_MAX_SECS".to_string(),
                reason: "must not be smaller than WEBHOOK_BACKOFF_BASE_SECS".to_string(),
            });
        }

        Ok(Self {
            max_attempts,
            retry_batch_size,
            poll_interval: secs_var(&lookup, "WEBHOOK_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            dlq_sweep_interval: secs_var(
                &lookup,
                "WEBHOOK_DLQ_SWEEP_INTERVAL_SECS",
                defaults.dlq_sweep_interval,
            )?,
            http_timeout: secs_var(&lookup, "WEBHOOK_HTTP_TIMEOUT_SECS", defaults.http_timeout)?,
            backoff_base,
            backoff_max,
            delivery_concurrency,
            stats_window: secs_var(&lookup, "WEBHOOK_STATS_WINDOW_SECS", defaults.stats_window)?,
        })
    }
}

fn parse_var<F, T>(lookup: &F, var: &str, default: T) -> Result<T, WebhookError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| WebhookError::Config {
            var: var.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_var<F>(lookup: &F, var: &str, default: Duration) -> Result<Duration, WebhookError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_var(lookup, var, default.as_secs())?;
    if secs == 0 {
        return Err(WebhookError::Config {
            var: var.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
