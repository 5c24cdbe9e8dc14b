//! Webhook subscription management.
//!
//! Validates URLs and event types, generates and rotates signing secrets,
//! and scopes every operation to the owning user.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clipper_db::{CreateWebhookSubscription, UpdateWebhookSubscription, WebhookSubscription};

use crate::crypto;
use crate::error::WebhookError;
use crate::store::SubscriptionStore;
use crate::validation;

/// Input for registering an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub url: String,
    pub events: Vec<String>,
    pub description: Option<String>,
}

/// Service for webhook subscription operations.
#[derive(Clone)]
pub struct SubscriptionService<S> {
    store: S,
}

impl<S: SubscriptionStore> SubscriptionService<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Register a new endpoint with a freshly generated secret.
    ///
    /// The returned subscription carries the secret; it is the only time the
    /// caller sees it besides [`rotate_secret`](Self::rotate_secret).
    pub async fn create(
        &self,
        user_id: Uuid,
        request: CreateSubscriptionRequest,
    ) -> Result<WebhookSubscription, WebhookError> {
        validation::validate_webhook_url(&request.url)?;
        validation::validate_event_types(&request.events)?;
        validation::validate_description(request.description.as_deref())?;

        let sub = self
            .store
            .create_subscription(CreateWebhookSubscription {
                user_id,
                url: request.url,
                secret: crypto::generate_secret(),
                events: validation::normalize_event_types(request.events),
                description: request.description,
            })
            .await?;

        tracing::info!(
            target: "webhook_subscription",
            subscription_id = %sub.id,
            user_id = %user_id,
            events = ?sub.events,
            "Webhook subscription created"
        );

        Ok(sub)
    }

    /// Get a subscription owned by `user_id`.
    pub async fn get(&self, user_id: Uuid, id: Uuid) -> Result<WebhookSubscription, WebhookError> {
        self.owned(user_id, id).await
    }

    /// All of a user's subscriptions, newest first.
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>, WebhookError> {
        self.store.list_subscriptions_by_user(user_id).await
    }

    /// Apply a partial update. Absent fields keep their current value, so an
    /// update with no fields returns the subscription unchanged.
    pub async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        mut request: UpdateWebhookSubscription,
    ) -> Result<WebhookSubscription, WebhookError> {
        if request.is_empty() {
            return self.owned(user_id, id).await;
        }
        if let Some(ref url) = request.url {
            validation::validate_webhook_url(url)?;
        }
        if let Some(events) = request.events.take() {
            validation::validate_event_types(&events)?;
            request.events = Some(validation::normalize_event_types(events));
        }
        validation::validate_description(request.description.as_deref())?;

        self.owned(user_id, id).await?;

        let sub = self
            .store
            .update_subscription(id, request)
            .await?
            .ok_or(WebhookError::SubscriptionNotFound)?;

        tracing::info!(
            target: "webhook_subscription",
            subscription_id = %id,
            user_id = %user_id,
            is_active = sub.is_active,
            "Webhook subscription updated"
        );

        Ok(sub)
    }

    /// Hard delete. Existing deliveries stay in the ledger.
    pub async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<(), WebhookError> {
        self.owned(user_id, id).await?;

        if !self.store.delete_subscription(id).await? {
            return Err(WebhookError::SubscriptionNotFound);
        }

        tracing::info!(
            target: "webhook_subscription",
            subscription_id = %id,
            user_id = %user_id,
            "Webhook subscription deleted"
        );
        Ok(())
    }

    /// Replace the signing secret and return the new one.
    pub async fn rotate_secret(&self, user_id: Uuid, id: Uuid) -> Result<String, WebhookError> {
        self.owned(user_id, id).await?;

        let secret = crypto::generate_secret();
        self.store
            .rotate_secret(id, &secret)
            .await?
            .ok_or(WebhookError::SubscriptionNotFound)?;

        tracing::info!(
            target: "webhook_subscription",
            subscription_id = %id,
            user_id = %user_id,
            "Webhook secret rotated"
        );
        Ok(secret)
    }

    /// Stop fanning new events out to this subscription. Already queued
    /// deliveries still run.
    pub async fn deactivate(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<WebhookSubscription, WebhookError> {
        self.update(
            user_id,
            id,
            UpdateWebhookSubscription {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    async fn owned(&self, user_id: Uuid, id: Uuid) -> Result<WebhookSubscription, WebhookError> {
        match self.store.find_subscription(id).await? {
            Some(sub) if sub.user_id == user_id => Ok(sub),
            _ => Err(WebhookError::SubscriptionNotFound),
        }
    }
}
