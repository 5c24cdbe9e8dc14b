//! End-to-end delivery against a mock endpoint.
//!
//! Events fan out into the in-memory ledger and go over real HTTP to a
//! wiremock server.

mod common;

use std::time::Duration;

use chrono::Utc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clipper_db::DeliveryStatus;
use clipper_webhooks::client::MAX_RESPONSE_BODY_BYTES;
use clipper_webhooks::store::{DeliveryLedger, SubscriptionStore};
use clipper_webhooks::{
    CreateSubscriptionRequest, DeliveryClient, DeliveryService, InMemoryWebhookStore,
    OutboundRequest, SubscriptionService, WebhookError, WebhookEvent, WebhookEventType,
};
use common::*;

async fn mount(server: &MockServer, responder: impl wiremock::Respond + 'static) {
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(responder)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_delivery_is_signed_and_tagged() {
    init_test_logging();
    let server = MockServer::start().await;
    let capture = CaptureResponder::new();
    mount(&server, capture.clone()).await;

    let store = InMemoryWebhookStore::new();
    subscribe(&store, &format!("{}/webhook", server.uri()), &["clip.submitted"]).await;
    let svc = DeliveryService::new(store.clone(), http_client(Duration::from_secs(5)));

    let event = WebhookEvent::new(
        WebhookEventType::ClipSubmitted,
        serde_json::json!({"clip_id": "c-42", "title": "Ace"}),
    );
    let created = svc.enqueue_event(&event).await.unwrap();
    assert_eq!(created.len(), 1);

    let stats = svc.process_due(10).await.unwrap();
    assert_eq!(stats.delivered, 1);

    let requests = capture.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    assert!(verify_captured_signature(request, SECRET_1));
    assert!(!verify_captured_signature(request, "wrong-secret"));
    assert_eq!(request.header("x-webhook-event"), Some("clip.submitted"));
    assert_eq!(
        request.header("x-webhook-delivery-id"),
        Some(created[0].id.to_string().as_str())
    );
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.header("user-agent"), Some("Clipper-Webhooks/1.0"));
    assert!(request.header("x-webhook-replay").is_none());

    let body: serde_json::Value = request.body_json().unwrap();
    assert_eq!(body["event"], "clip.submitted");
    assert_eq!(body["event_id"], event.event_id.to_string());
    assert_eq!(body["data"]["clip_id"], "c-42");

    let row = store.find_delivery(created[0].id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Delivered);
    assert_eq!(row.http_status_code, Some(200));
    assert_eq!(row.response_body.as_deref(), Some("received"));
    assert!(row.delivered_at.is_some());
}

#[tokio::test]
async fn test_server_error_schedules_retry_with_backoff() {
    init_test_logging();
    let server = MockServer::start().await;
    mount(&server, CaptureResponder::with_status(500)).await;

    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, &format!("{}/webhook", server.uri()), &["clip.submitted"]).await;
    let delivery = queue_delivery(&store, sub, 5, Utc::now()).await;
    let svc = DeliveryService::new(store.clone(), http_client(Duration::from_secs(5)))
        .with_backoff(fast_backoff());

    let before = Utc::now();
    let stats = svc.process_due(10).await.unwrap();
    assert_eq!(stats.retried, 1);

    let row = store.find_delivery(delivery.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Pending);
    assert_eq!(row.attempt_count, 1);
    assert_eq!(row.http_status_code, Some(500));
    assert_eq!(row.error_message.as_deref(), Some("HTTP 500: received"));
    let next = row.next_attempt_at.unwrap();
    assert!(next >= before + chrono::Duration::seconds(1));
    assert!(next <= Utc::now() + chrono::Duration::seconds(2));
}

#[tokio::test]
async fn test_timeout_is_recorded_without_status_code() {
    init_test_logging();
    let server = MockServer::start().await;
    mount(&server, DelayedResponder::new(3_000)).await;

    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, &format!("{}/webhook", server.uri()), &["clip.submitted"]).await;
    let delivery = queue_delivery(&store, sub, 5, Utc::now()).await;
    let svc = DeliveryService::new(store.clone(), http_client(Duration::from_secs(1)));

    let stats = svc.process_due(10).await.unwrap();
    assert_eq!(stats.retried, 1);

    let row = store.find_delivery(delivery.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Pending);
    assert!(row.http_status_code.is_none());
    assert_eq!(row.error_message.as_deref(), Some("Request timeout (1s)"));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_a_failed_attempt() {
    init_test_logging();
    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, "http://127.0.0.1:9/webhook", &["clip.submitted"]).await;
    let delivery = queue_delivery(&store, sub, 5, Utc::now()).await;
    let svc = DeliveryService::new(store.clone(), http_client(Duration::from_secs(2)));

    svc.process_due(10).await.unwrap();

    let row = store.find_delivery(delivery.id).await.unwrap().unwrap();
    assert_eq!(row.attempt_count, 1);
    assert!(row.http_status_code.is_none());
    assert!(row.error_message.is_some());
}

#[tokio::test]
async fn test_eventual_success_after_failures() {
    init_test_logging();
    let server = MockServer::start().await;
    let failing = FailingResponder::fail_times(2);
    mount(&server, failing.clone()).await;

    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, &format!("{}/webhook", server.uri()), &["clip.submitted"]).await;
    let delivery = queue_delivery(&store, sub, 5, Utc::now()).await;
    let svc = DeliveryService::new(store.clone(), http_client(Duration::from_secs(5)))
        .with_backoff(fast_backoff());

    for _ in 0..3 {
        svc.process_due(10).await.unwrap();
        make_due(&store, delivery.id).await;
    }

    assert_eq!(failing.attempt_count(), 3);
    let row = store.find_delivery(delivery.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Delivered);
    assert_eq!(row.attempt_count, 3);

    // Delivered rows are never attempted again.
    svc.process_due(10).await.unwrap();
    assert_eq!(failing.attempt_count(), 3);
}

#[tokio::test]
async fn test_deactivation_stops_fan_out_but_not_queued_deliveries() {
    init_test_logging();
    let server = MockServer::start().await;
    let capture = CaptureResponder::new();
    mount(&server, capture.clone()).await;

    let store = InMemoryWebhookStore::new();
    let subs = SubscriptionService::new(store.clone());
    let sub = subscribe(&store, &format!("{}/webhook", server.uri()), &["clip.approved"]).await;
    let svc = DeliveryService::new(store.clone(), http_client(Duration::from_secs(5)));

    let queued = svc
        .enqueue_event(&WebhookEvent::new(
            WebhookEventType::ClipApproved,
            serde_json::json!({"clip_id": "before"}),
        ))
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);

    subs.deactivate(USER_1, sub).await.unwrap();

    let after = svc
        .enqueue_event(&WebhookEvent::new(
            WebhookEventType::ClipApproved,
            serde_json::json!({"clip_id": "after"}),
        ))
        .await
        .unwrap();
    assert!(after.is_empty());

    let stats = svc.process_due(10).await.unwrap();
    assert_eq!(stats.delivered, 1);
    assert_eq!(capture.request_count(), 1);
    assert!(verify_captured_signature(&capture.requests()[0], SECRET_1));
}

#[tokio::test]
async fn test_rotated_secret_signs_later_deliveries() {
    init_test_logging();
    let server = MockServer::start().await;
    let capture = CaptureResponder::new();
    mount(&server, capture.clone()).await;

    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, &format!("{}/webhook", server.uri()), &["clip.rejected"]).await;
    store.rotate_secret(sub, "rotated-secret").await.unwrap();
    queue_delivery(&store, sub, 5, Utc::now()).await;

    let svc = DeliveryService::new(store, http_client(Duration::from_secs(5)));
    svc.process_due(10).await.unwrap();

    let request = &capture.requests()[0];
    assert!(verify_captured_signature(request, "rotated-secret"));
    assert!(!verify_captured_signature(request, SECRET_1));
}

#[tokio::test]
async fn test_concurrent_attempts_within_one_batch() {
    init_test_logging();
    let server = MockServer::start().await;
    mount(&server, DelayedResponder::new(300)).await;

    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, &format!("{}/webhook", server.uri()), &["clip.submitted"]).await;
    for _ in 0..8 {
        queue_delivery(&store, sub, 5, Utc::now()).await;
    }
    let svc = DeliveryService::new(store.clone(), http_client(Duration::from_secs(5)))
        .with_concurrency(8);

    let started = std::time::Instant::now();
    let stats = svc.process_due(10).await.unwrap();
    assert_eq!(stats.delivered, 8);
    assert!(started.elapsed() < Duration::from_millis(8 * 300));
    assert!(store.locked_ids().is_empty());

    let page = svc.list_for_subscription(sub, 1, 5).await.unwrap();
    assert_eq!(page.total, 8);
    assert_eq!(page.items.len(), 5);
    assert!(page.has_more);
}

#[tokio::test]
async fn test_error_body_is_recorded_and_capped() {
    init_test_logging();
    let server = MockServer::start().await;
    let huge = "x".repeat(MAX_RESPONSE_BODY_BYTES * 64);
    mount(&server, ResponseTemplate::new(502).set_body_string(huge)).await;

    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, &format!("{}/webhook", server.uri()), &["clip.submitted"]).await;
    let delivery = queue_delivery(&store, sub, 5, Utc::now()).await;
    let svc = DeliveryService::new(store.clone(), http_client(Duration::from_secs(5)));

    svc.process_due(10).await.unwrap();

    let row = store.find_delivery(delivery.id).await.unwrap().unwrap();
    assert_eq!(row.http_status_code, Some(502));
    let message = row.error_message.unwrap();
    assert!(message.starts_with("HTTP 502: xxx"));
    assert_eq!(message.len(), "HTTP 502: ".len() + MAX_RESPONSE_BODY_BYTES);
}

#[tokio::test]
async fn test_client_reads_at_most_the_body_cap() {
    init_test_logging();
    let server = MockServer::start().await;
    mount(
        &server,
        ResponseTemplate::new(200).set_body_string("y".repeat(1024 * 1024)),
    )
    .await;

    let client = http_client(Duration::from_secs(5));
    let response = client
        .deliver(&OutboundRequest {
            delivery_id: uuid::Uuid::new_v4(),
            url: format!("{}/webhook", server.uri()),
            secret: SECRET_1.to_string(),
            event_type: "clip.submitted".to_string(),
            payload: serde_json::json!({"clip_id": "c-1"}),
            replay: false,
        })
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(response.body.map(|b| b.len()), Some(MAX_RESPONSE_BODY_BYTES));
}

#[tokio::test]
async fn test_subscriptions_cannot_target_internal_hosts() {
    let server = MockServer::start().await;
    let subs = SubscriptionService::new(InMemoryWebhookStore::new());

    let err = subs
        .create(
            USER_1,
            CreateSubscriptionRequest {
                url: format!("{}/webhook", server.uri()),
                events: vec!["clip.approved".to_string()],
                description: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::SsrfDetected(_)));

    let sub = subs
        .create(
            USER_1,
            CreateSubscriptionRequest {
                url: "https://hooks.example.com/clipper".to_string(),
                events: vec!["clip.approved".to_string()],
                description: None,
            },
        )
        .await
        .unwrap();
    let err = subs
        .update(
            USER_1,
            sub.id,
            clipper_db::UpdateWebhookSubscription {
                url: Some("http://169.254.169.254/latest/meta-data".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::SsrfDetected(_)));
    assert_eq!(
        subs.get(USER_1, sub.id).await.unwrap().url,
        "https://hooks.example.com/clipper"
    );
}
