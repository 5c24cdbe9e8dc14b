//! HTTP delivery of signed webhook payloads.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use uuid::Uuid;

use crate::crypto;
use crate::error::{DeliveryAttemptError, WebhookError};

pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_DELIVERY_ID: &str = "X-Webhook-Delivery-ID";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";
pub const HEADER_REPLAY: &str = "X-Webhook-Replay";

pub const USER_AGENT: &str = "Clipper-Webhooks/1.0";

/// Response bodies are read up to this many bytes; the rest is never read.
pub const MAX_RESPONSE_BODY_BYTES: usize = 10 * 1024;

/// Everything needed to make one delivery attempt.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub delivery_id: Uuid,
    pub url: String,
    pub secret: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub replay: bool,
}

/// What the endpoint answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status_code: u16,
    pub body: Option<String>,
}

impl DeliveryResponse {
    /// 2xx counts as delivered; everything else is retried.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Error text for a non-2xx answer, `HTTP <code>: <body>` when a body came back.
    #[must_use]
    pub fn failure_message(&self) -> String {
        match self.body.as_deref() {
            Some(body) if !body.is_empty() => format!("HTTP {}: {}", self.status_code, body),
            _ => format!("HTTP {}", self.status_code),
        }
    }
}

/// Performs a single attempt. Implementations never retry.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn deliver(
        &self,
        request: &OutboundRequest,
    ) -> Result<DeliveryResponse, DeliveryAttemptError>;
}

/// `reqwest`-backed client that signs each request.
#[derive(Clone)]
pub struct HttpDeliveryClient {
    http_client: Client,
    timeout: Duration,
}

impl HttpDeliveryClient {
    /// Build a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Internal` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, WebhookError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            timeout,
        })
    }

    fn build_headers(
        request: &OutboundRequest,
        timestamp: &str,
        body: &[u8],
    ) -> Result<HeaderMap, DeliveryAttemptError> {
        let signature = crypto::signature_header(&request.secret, timestamp, body);
        let delivery_id = request.delivery_id.to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in [
            (HEADER_EVENT, request.event_type.as_str()),
            (HEADER_DELIVERY_ID, delivery_id.as_str()),
            (HEADER_TIMESTAMP, timestamp),
            (HEADER_SIGNATURE, signature.as_str()),
        ] {
            let value = HeaderValue::from_str(value).map_err(|e| {
                DeliveryAttemptError::Request(format!("Invalid {name} header: {e}"))
            })?;
            headers.insert(name, value);
        }
        if request.replay {
            headers.insert(HEADER_REPLAY, HeaderValue::from_static("true"));
        }
        Ok(headers)
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn deliver(
        &self,
        request: &OutboundRequest,
    ) -> Result<DeliveryResponse, DeliveryAttemptError> {
        let body = serde_json::to_vec(&request.payload).map_err(|e| {
            DeliveryAttemptError::Request(format!("Failed to serialize payload: {e}"))
        })?;
        let timestamp = Utc::now().timestamp().to_string();
        let headers = Self::build_headers(request, &timestamp, &body)?;

        let response = self
            .http_client
            .post(&request.url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryAttemptError::Timeout(self.timeout.as_secs())
                } else if e.is_connect() {
                    DeliveryAttemptError::Connect(e.to_string())
                } else {
                    DeliveryAttemptError::Request(e.to_string())
                }
            })?;

        let status_code = response.status().as_u16();
        let body = match read_capped_body(response).await {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => Some(truncate_body(&bytes)),
            Err(e) => {
                tracing::debug!(
                    target: "webhook_delivery",
                    delivery_id = %request.delivery_id,
                    error = %e,
                    "Failed to read response body"
                );
                None
            }
        };

        Ok(DeliveryResponse { status_code, body })
    }
}

/// Read at most `MAX_RESPONSE_BODY_BYTES` of the body, then drop the connection.
async fn read_capped_body(mut response: reqwest::Response) -> Result<Vec<u8>, reqwest::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let remaining = MAX_RESPONSE_BODY_BYTES - buf.len();
        if chunk.len() >= remaining {
            buf.extend_from_slice(&chunk[..remaining]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Lossy UTF-8 of at most `MAX_RESPONSE_BODY_BYTES`, cut on a char boundary.
fn truncate_body(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_RESPONSE_BODY_BYTES)]);
    let mut end = text.len().min(MAX_RESPONSE_BODY_BYTES);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
