//! Common test utilities for clipper-webhooks integration tests.
//!
//! Provides mock endpoint responders, signature checks and fixtures backed
//! by the in-memory store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use wiremock::{Request, Respond, ResponseTemplate};

use clipper_db::{
    CreateWebhookDelivery, CreateWebhookSubscription, DeliveryStatus, WebhookDelivery,
};
use clipper_webhooks::store::{DeliveryLedger, SubscriptionStore};
use clipper_webhooks::{BackoffPolicy, HttpDeliveryClient, InMemoryWebhookStore};

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

pub const USER_1: Uuid = Uuid::from_bytes([
    0xaa, 0xaa, 0x11, 0x11, 0xaa, 0xaa, 0x11, 0x11, 0xaa, 0xaa, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11,
]);

pub const SECRET_1: &str = "whsec_test_secret_key_12345";

static INIT: Once = Once::new();

/// Initialize logging for tests (once), only when `RUST_LOG` is set.
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

/// Backoff with no jitter and a one-second base.
pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)).without_jitter()
}

/// Real HTTP client with a short timeout.
pub fn http_client(timeout: Duration) -> Arc<HttpDeliveryClient> {
    Arc::new(HttpDeliveryClient::new(timeout).expect("client builds"))
}

/// Active subscription for `events` pointing at `url`.
pub async fn subscribe(store: &InMemoryWebhookStore, url: &str, events: &[&str]) -> Uuid {
    store
        .create_subscription(CreateWebhookSubscription {
            user_id: USER_1,
            url: url.to_string(),
            secret: SECRET_1.to_string(),
            events: events.iter().map(|e| (*e).to_string()).collect(),
            description: None,
        })
        .await
        .expect("subscription created")
        .id
}

/// Pending delivery with the given schedule.
pub async fn queue_delivery(
    store: &InMemoryWebhookStore,
    subscription_id: Uuid,
    max_attempts: i32,
    next_attempt_at: DateTime<Utc>,
) -> WebhookDelivery {
    store
        .create_delivery(CreateWebhookDelivery {
            subscription_id,
            event_type: "clip.submitted".to_string(),
            event_id: Uuid::new_v4(),
            payload: serde_json::json!({"clip_id": Uuid::new_v4()}),
            max_attempts,
            next_attempt_at,
        })
        .await
        .expect("delivery created")
}

/// Make a stored delivery due right now, skipping any backoff.
pub async fn make_due(store: &InMemoryWebhookStore, id: Uuid) {
    let mut row = store
        .find_delivery(id)
        .await
        .expect("lookup")
        .expect("delivery exists");
    row.next_attempt_at = Some(Utc::now() - chrono::Duration::seconds(1));
    store.put_delivery(row);
}

/// Failed delivery that has used its whole budget.
pub async fn exhausted_delivery(
    store: &InMemoryWebhookStore,
    subscription_id: Uuid,
    error_message: Option<&str>,
) -> WebhookDelivery {
    let mut row = queue_delivery(store, subscription_id, 5, Utc::now()).await;
    row.status = DeliveryStatus::Failed;
    row.attempt_count = 5;
    row.http_status_code = Some(503);
    row.error_message = error_message.map(str::to_string);
    row.next_attempt_at = None;
    store.put_delivery(row.clone());
    row
}

// ---------------------------------------------------------------------------
// CapturedRequest - for inspecting webhook requests
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    /// Parse the body as JSON.
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// CaptureResponder - captures requests and returns a fixed status
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
}

impl CaptureResponder {
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for CaptureResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let captured = CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
        };
        self.requests.lock().unwrap().push(captured);
        ResponseTemplate::new(self.response_code).set_body_string("received")
    }
}

// ---------------------------------------------------------------------------
// FailingResponder - fails N times then succeeds
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
}

impl FailingResponder {
    /// Fail `n` times with 500, then return 200.
    pub fn fail_times(n: u32) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code: 500,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(200)
        }
    }
}

// ---------------------------------------------------------------------------
// DelayedResponder - adds response delay
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DelayedResponder {
    delay_ms: u64,
}

impl DelayedResponder {
    pub fn new(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Respond for DelayedResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(200).set_delay(Duration::from_millis(self.delay_ms))
    }
}

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

/// Independent HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn compute_test_signature(secret: &str, timestamp: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");

    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);

    hex::encode(mac.finalize().into_bytes())
}

/// Check the signature header on a captured request.
pub fn verify_captured_signature(request: &CapturedRequest, secret: &str) -> bool {
    let Some(signature_header) = request.header("x-webhook-signature") else {
        return false;
    };
    let Some(timestamp) = request.header("x-webhook-timestamp") else {
        return false;
    };

    let expected = format!(
        "sha256={}",
        compute_test_signature(secret, timestamp, &request.body)
    );
    signature_header == expected
}
