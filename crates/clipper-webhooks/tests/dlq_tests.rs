//! Dead letter sweep, listing and replay.

mod common;

use std::time::Duration;

use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

use clipper_db::{DeliveryStatus, UpdateWebhookSubscription};
use clipper_webhooks::store::{DeadLetterArchive, DeliveryLedger, SubscriptionStore};
use clipper_webhooks::{DeadLetterReason, DlqService, InMemoryWebhookStore, WebhookError};
use common::*;

async fn mock_endpoint(status: u16) -> (MockServer, CaptureResponder) {
    let server = MockServer::start().await;
    let capture = CaptureResponder::with_status(status);
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(capture.clone())
        .mount(&server)
        .await;
    (server, capture)
}

fn dlq(store: &InMemoryWebhookStore) -> DlqService<InMemoryWebhookStore> {
    DlqService::new(store.clone(), http_client(Duration::from_secs(5)))
}

#[tokio::test]
async fn test_sweep_archives_failed_deliveries_once() {
    init_test_logging();
    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, "https://example.com/hook", &["clip.submitted"]).await;
    let failed = exhausted_delivery(&store, sub, Some("HTTP 503")).await;
    queue_delivery(&store, sub, 5, chrono::Utc::now()).await;

    let svc = dlq(&store);
    let archived = svc.sweep(100).await.unwrap();
    assert_eq!(archived.len(), 1);

    let entry = &archived[0];
    assert_eq!(entry.delivery_id, failed.id);
    assert_eq!(entry.subscription_id, sub);
    assert_eq!(entry.event_id, failed.event_id);
    assert_eq!(entry.payload, failed.payload);
    assert_eq!(entry.error_message, "HTTP 503");
    assert_eq!(entry.http_status_code, Some(503));
    assert_eq!(entry.attempt_count, 5);
    assert_eq!(entry.original_created_at, failed.created_at);
    assert!(entry.replayed_at.is_none());

    // The ledger row is left as it was.
    let row = store.find_delivery(failed.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Failed);

    assert!(svc.sweep(100).await.unwrap().is_empty());
    assert_eq!(store.count_dead_letters().await.unwrap(), 1);

    let metrics = svc.metrics();
    assert_eq!(metrics.dead_letters_for(DeadLetterReason::ServerError), 1);
    assert_eq!(metrics.dead_letter_moves.values().sum::<u64>(), 1);
}

#[tokio::test]
async fn test_missing_error_message_gets_default() {
    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, "https://example.com/hook", &["clip.submitted"]).await;
    exhausted_delivery(&store, sub, None).await;

    let svc = dlq(&store);
    let archived = svc.sweep(100).await.unwrap();
    assert_eq!(archived[0].error_message, "Unknown error");
    // The fixture's last attempt answered 503.
    assert_eq!(svc.metrics().dead_letters_for(DeadLetterReason::ServerError), 1);
}

#[tokio::test]
async fn test_only_failed_deliveries_can_be_archived() {
    let store = InMemoryWebhookStore::new();
    let pending = queue_delivery(&store, Uuid::new_v4(), 5, chrono::Utc::now()).await;

    let err = store.migrate_to_dead_letter(&pending).await.unwrap_err();
    assert!(matches!(err, WebhookError::InvalidState(_)));
}

#[tokio::test]
async fn test_list_is_paginated_newest_first() {
    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, "https://example.com/hook", &["clip.submitted"]).await;
    let svc = dlq(&store);
    let mut archived = Vec::new();
    for _ in 0..3 {
        let failed = exhausted_delivery(&store, sub, Some("HTTP 500")).await;
        archived.push(store.migrate_to_dead_letter(&failed).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let page = svc.list(1, 2).await.unwrap();
    assert_eq!(page.total, 3);
    assert!(page.has_more);
    assert_eq!(page.items[0].id, archived[2].id);
    assert_eq!(page.items[1].id, archived[1].id);

    let page = svc.list(2, 2).await.unwrap();
    assert!(!page.has_more);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, archived[0].id);
}

#[tokio::test]
async fn test_replay_sends_marked_request_and_records_outcome() {
    init_test_logging();
    let (server, capture) = mock_endpoint(200).await;
    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, &format!("{}/webhook", server.uri()), &["clip.submitted"]).await;
    let failed = exhausted_delivery(&store, sub, Some("HTTP 503")).await;
    let entry = store.migrate_to_dead_letter(&failed).await.unwrap();

    let result = dlq(&store).replay(entry.id).await.unwrap();
    assert!(result.successful);
    assert_eq!(result.http_status_code, Some(200));
    assert!(result.error_message.is_none());
    assert_eq!(result.entry.replay_successful, Some(true));
    assert!(result.entry.replayed_at.is_some());

    let request = &capture.requests()[0];
    assert_eq!(request.header("x-webhook-replay"), Some("true"));
    assert_eq!(
        request.header("x-webhook-delivery-id"),
        Some(failed.id.to_string().as_str())
    );
    assert!(verify_captured_signature(request, SECRET_1));
    let body: serde_json::Value = request.body_json().unwrap();
    assert_eq!(body, failed.payload);

    // Replay never touches the ledger.
    let row = store.find_delivery(failed.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Failed);
    assert_eq!(row.attempt_count, 5);
}

#[tokio::test]
async fn test_replay_outcome_is_overwritten() {
    init_test_logging();
    let (ok_server, _) = mock_endpoint(200).await;
    let (bad_server, _) = mock_endpoint(500).await;
    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, &format!("{}/webhook", ok_server.uri()), &["clip.submitted"]).await;
    let failed = exhausted_delivery(&store, sub, Some("HTTP 503")).await;
    let entry = store.migrate_to_dead_letter(&failed).await.unwrap();
    let svc = dlq(&store);

    let first = svc.replay(entry.id).await.unwrap();
    assert_eq!(first.entry.replay_successful, Some(true));

    store
        .update_subscription(
            sub,
            UpdateWebhookSubscription {
                url: Some(format!("{}/webhook", bad_server.uri())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let second = svc.replay(entry.id).await.unwrap();
    assert!(!second.successful);
    assert_eq!(second.http_status_code, Some(500));
    assert_eq!(second.error_message.as_deref(), Some("HTTP 500: received"));
    assert_eq!(second.entry.replay_successful, Some(false));
    assert!(second.entry.replayed_at >= first.entry.replayed_at);

    let stored = svc.get(entry.id).await.unwrap();
    assert_eq!(stored.replay_successful, Some(false));

    let metrics = svc.metrics();
    assert_eq!(metrics.replay_success_count, 1);
    assert_eq!(metrics.replay_failure_count, 1);
}

#[tokio::test]
async fn test_replay_requires_active_subscription() {
    let (server, capture) = mock_endpoint(200).await;
    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, &format!("{}/webhook", server.uri()), &["clip.submitted"]).await;
    let failed = exhausted_delivery(&store, sub, Some("HTTP 503")).await;
    let entry = store.migrate_to_dead_letter(&failed).await.unwrap();
    let svc = dlq(&store);

    store
        .update_subscription(
            sub,
            UpdateWebhookSubscription {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = svc.replay(entry.id).await.unwrap_err();
    assert!(matches!(err, WebhookError::SubscriptionInactive));

    store.delete_subscription(sub).await.unwrap();
    let err = svc.replay(entry.id).await.unwrap_err();
    assert!(matches!(err, WebhookError::SubscriptionNotFound));

    assert_eq!(capture.request_count(), 0);
    let stored = svc.get(entry.id).await.unwrap();
    assert!(stored.replayed_at.is_none());
}

#[tokio::test]
async fn test_delete_entry() {
    let store = InMemoryWebhookStore::new();
    let sub = subscribe(&store, "https://example.com/hook", &["clip.submitted"]).await;
    let failed = exhausted_delivery(&store, sub, None).await;
    let entry = store.migrate_to_dead_letter(&failed).await.unwrap();
    let svc = dlq(&store);

    svc.delete(entry.id).await.unwrap();
    assert!(matches!(
        svc.get(entry.id).await.unwrap_err(),
        WebhookError::DeadLetterNotFound
    ));
    assert!(matches!(
        svc.delete(entry.id).await.unwrap_err(),
        WebhookError::DeadLetterNotFound
    ));
    assert!(matches!(
        svc.replay(entry.id).await.unwrap_err(),
        WebhookError::DeadLetterNotFound
    ));
}
