//! In-process backend.
//!
//! Rows live behind one `parking_lot::Mutex`. A claim marks its rows as
//! locked so later claims skip them, stages its writes privately and
//! applies them on commit. Dropping a claim releases the locks and discards
//! the staged writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use clipper_db::{
    CreateWebhookDeadLetter, CreateWebhookDelivery, CreateWebhookSubscription, DeliveryCounts,
    DeliveryStatus, UpdateWebhookSubscription, WebhookDeadLetter, WebhookDelivery,
    WebhookSubscription,
};

use super::{
    ensure_archivable, ensure_attempt_budget, is_ignored_terminal_write, AttemptFailure, AttemptSuccess, ClaimScheduler,
    DeadLetterArchive, DeliveryClaim, DeliveryLedger, SubscriptionStore,
};
use crate::error::WebhookError;
use crate::policy::FailureTransition;

#[derive(Debug, Default)]
struct MemoryState {
    // Vecs keep insertion order, which breaks created_at ties.
    subscriptions: Vec<WebhookSubscription>,
    deliveries: Vec<WebhookDelivery>,
    dead_letters: Vec<WebhookDeadLetter>,
    locked: HashSet<Uuid>,
}

impl MemoryState {
    fn delivery_mut(&mut self, id: Uuid) -> Option<&mut WebhookDelivery> {
        self.deliveries.iter_mut().find(|d| d.id == id)
    }

    fn subscription_mut(&mut self, id: Uuid) -> Option<&mut WebhookSubscription> {
        self.subscriptions.iter_mut().find(|s| s.id == id)
    }

    fn dead_letter_mut(&mut self, id: Uuid) -> Option<&mut WebhookDeadLetter> {
        self.dead_letters.iter_mut().find(|e| e.id == id)
    }

    fn archive(&mut self, delivery: &WebhookDelivery) -> WebhookDeadLetter {
        let input = CreateWebhookDeadLetter::from_delivery(delivery);
        let entry = WebhookDeadLetter {
            id: Uuid::new_v4(),
            subscription_id: input.subscription_id,
            delivery_id: input.delivery_id,
            event_type: input.event_type,
            event_id: input.event_id,
            payload: input.payload,
            error_message: input.error_message,
            http_status_code: input.http_status_code,
            response_body: input.response_body,
            attempt_count: input.attempt_count,
            original_created_at: input.original_created_at,
            moved_to_dlq_at: Utc::now(),
            replayed_at: None,
            replay_successful: None,
        };
        self.dead_letters.push(entry.clone());
        entry
    }
}

fn apply_success(row: &mut WebhookDelivery, outcome: &AttemptSuccess, now: DateTime<Utc>) {
    if is_ignored_terminal_write(row, "success") {
        return;
    }
    row.status = DeliveryStatus::Delivered;
    row.http_status_code = Some(outcome.http_status_code);
    row.response_body.clone_from(&outcome.response_body);
    row.delivered_at = Some(now);
    row.attempt_count += 1;
    row.updated_at = now;
}

fn apply_failure(row: &mut WebhookDelivery, outcome: &AttemptFailure, now: DateTime<Utc>) {
    if is_ignored_terminal_write(row, "failure") {
        return;
    }
    let transition = FailureTransition::evaluate(row.attempt_count, row.max_attempts);
    row.status = transition.status;
    row.attempt_count = transition.attempt_count;
    row.http_status_code = outcome.http_status_code;
    row.error_message = Some(outcome.error_message.clone());
    row.next_attempt_at = if transition.is_exhausted() {
        outcome.next_attempt_at
    } else {
        Some(outcome.next_attempt_at.unwrap_or(now))
    };
    row.updated_at = now;
}

fn page<T: Clone>(items: Vec<&T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
    let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
    items
        .into_iter()
        .skip(offset)
        .take(limit)
        .cloned()
        .collect()
}

/// Store kept entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWebhookStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryWebhookStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored delivery. Lets tests and fixtures set up states
    /// such as past-due or exhausted rows directly.
    pub fn put_delivery(&self, delivery: WebhookDelivery) {
        let mut state = self.state.lock();
        match state.delivery_mut(delivery.id) {
            Some(row) => *row = delivery,
            None => state.deliveries.push(delivery),
        }
    }

    /// Ids currently held by an in-flight claim.
    #[must_use]
    pub fn locked_ids(&self) -> HashSet<Uuid> {
        self.state.lock().locked.clone()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryWebhookStore {
    async fn create_subscription(
        &self,
        input: CreateWebhookSubscription,
    ) -> Result<WebhookSubscription, WebhookError> {
        let now = Utc::now();
        let sub = WebhookSubscription {
            id: Uuid::new_v4(),
            user_id: input.user_id,
            url: input.url,
            secret: input.secret,
            events: input.events,
            is_active: true,
            description: input.description,
            created_at: now,
            updated_at: now,
            last_delivery_at: None,
        };
        self.state.lock().subscriptions.push(sub.clone());
        Ok(sub)
    }

    async fn find_subscription(
        &self,
        id: Uuid,
    ) -> Result<Option<WebhookSubscription>, WebhookError> {
        let state = self.state.lock();
        Ok(state.subscriptions.iter().find(|s| s.id == id).cloned())
    }

    async fn list_subscriptions_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>, WebhookError> {
        let state = self.state.lock();
        Ok(state
            .subscriptions
            .iter()
            .rev()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_active_by_event_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, WebhookError> {
        let state = self.state.lock();
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.is_active && s.is_subscribed_to(event_type))
            .cloned()
            .collect())
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        input: UpdateWebhookSubscription,
    ) -> Result<Option<WebhookSubscription>, WebhookError> {
        let mut state = self.state.lock();
        let Some(sub) = state.subscription_mut(id) else {
            return Ok(None);
        };
        if let Some(url) = input.url {
            sub.url = url;
        }
        if let Some(events) = input.events {
            sub.events = events;
        }
        if let Some(is_active) = input.is_active {
            sub.is_active = is_active;
        }
        if let Some(description) = input.description {
            sub.description = Some(description);
        }
        sub.updated_at = Utc::now();
        Ok(Some(sub.clone()))
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<bool, WebhookError> {
        let mut state = self.state.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != id);
        Ok(state.subscriptions.len() < before)
    }

    async fn rotate_secret(
        &self,
        id: Uuid,
        secret: &str,
    ) -> Result<Option<WebhookSubscription>, WebhookError> {
        let mut state = self.state.lock();
        Ok(state.subscription_mut(id).map(|sub| {
            sub.secret = secret.to_string();
            sub.updated_at = Utc::now();
            sub.clone()
        }))
    }

    async fn record_last_delivery(
        &self,
        id: Uuid,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, WebhookError> {
        let mut state = self.state.lock();
        Ok(state
            .subscription_mut(id)
            .map(|sub| sub.last_delivery_at = Some(delivered_at))
            .is_some())
    }

    async fn count_active_subscriptions(&self) -> Result<i64, WebhookError> {
        let state = self.state.lock();
        Ok(state.subscriptions.iter().filter(|s| s.is_active).count() as i64)
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryWebhookStore {
    async fn create_delivery(
        &self,
        input: CreateWebhookDelivery,
    ) -> Result<WebhookDelivery, WebhookError> {
        ensure_attempt_budget(&input)?;
        let now = Utc::now();
        let delivery = WebhookDelivery {
            id: Uuid::new_v4(),
            subscription_id: input.subscription_id,
            event_type: input.event_type,
            event_id: input.event_id,
            payload: input.payload,
            status: DeliveryStatus::Pending,
            http_status_code: None,
            response_body: None,
            error_message: None,
            attempt_count: 0,
            max_attempts: input.max_attempts,
            next_attempt_at: Some(input.next_attempt_at),
            delivered_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().deliveries.push(delivery.clone());
        Ok(delivery)
    }

    async fn find_delivery(&self, id: Uuid) -> Result<Option<WebhookDelivery>, WebhookError> {
        let state = self.state.lock();
        Ok(state.deliveries.iter().find(|d| d.id == id).cloned())
    }

    async fn list_deliveries_by_subscription(
        &self,
        subscription_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        let state = self.state.lock();
        let rows = state
            .deliveries
            .iter()
            .rev()
            .filter(|d| d.subscription_id == subscription_id)
            .collect();
        Ok(page(rows, limit, offset))
    }

    async fn count_deliveries_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<i64, WebhookError> {
        let state = self.state.lock();
        Ok(state
            .deliveries
            .iter()
            .filter(|d| d.subscription_id == subscription_id)
            .count() as i64)
    }

    async fn count_pending_deliveries(&self) -> Result<i64, WebhookError> {
        let state = self.state.lock();
        Ok(state
            .deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Pending)
            .count() as i64)
    }

    async fn recent_delivery_counts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<DeliveryCounts, WebhookError> {
        let state = self.state.lock();
        let mut counts = DeliveryCounts::default();
        for d in state.deliveries.iter().filter(|d| d.updated_at >= since) {
            match d.status {
                DeliveryStatus::Delivered => counts.delivered += 1,
                DeliveryStatus::Failed => counts.failed += 1,
                DeliveryStatus::Pending => counts.pending += 1,
            }
        }
        Ok(counts)
    }

    async fn record_success(
        &self,
        id: Uuid,
        outcome: &AttemptSuccess,
    ) -> Result<WebhookDelivery, WebhookError> {
        let mut state = self.state.lock();
        if state.locked.contains(&id) {
            return Err(WebhookError::DeliveryLocked(id));
        }
        let row = state
            .delivery_mut(id)
            .ok_or(WebhookError::DeliveryNotFound)?;
        apply_success(row, outcome, Utc::now());
        Ok(row.clone())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        outcome: &AttemptFailure,
    ) -> Result<WebhookDelivery, WebhookError> {
        let mut state = self.state.lock();
        if state.locked.contains(&id) {
            return Err(WebhookError::DeliveryLocked(id));
        }
        let row = state
            .delivery_mut(id)
            .ok_or(WebhookError::DeliveryNotFound)?;
        apply_failure(row, outcome, Utc::now());
        Ok(row.clone())
    }
}

/// Claim over rows of an [`InMemoryWebhookStore`].
pub struct InMemoryDeliveryClaim {
    state: Arc<Mutex<MemoryState>>,
    deliveries: Vec<WebhookDelivery>,
    staged: HashMap<Uuid, WebhookDelivery>,
    released: bool,
}

impl InMemoryDeliveryClaim {
    /// Working copy of a claimed row: the staged version if one exists.
    fn working_copy(&self, id: Uuid) -> Result<WebhookDelivery, WebhookError> {
        if let Some(row) = self.staged.get(&id) {
            return Ok(row.clone());
        }
        self.deliveries
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| {
                WebhookError::InvalidState(format!("Delivery {id} is not part of this claim"))
            })
    }

    fn unlock(&mut self, state: &mut MemoryState) {
        for d in &self.deliveries {
            state.locked.remove(&d.id);
        }
        self.released = true;
    }
}

impl Drop for InMemoryDeliveryClaim {
    fn drop(&mut self) {
        if !self.released {
            let state = Arc::clone(&self.state);
            let mut guard = state.lock();
            self.unlock(&mut guard);
        }
    }
}

#[async_trait]
impl DeliveryClaim for InMemoryDeliveryClaim {
    fn deliveries(&self) -> &[WebhookDelivery] {
        &self.deliveries
    }

    async fn record_success(
        &mut self,
        id: Uuid,
        outcome: &AttemptSuccess,
    ) -> Result<WebhookDelivery, WebhookError> {
        let mut row = self.working_copy(id)?;
        apply_success(&mut row, outcome, Utc::now());
        self.staged.insert(id, row.clone());
        Ok(row)
    }

    async fn record_failure(
        &mut self,
        id: Uuid,
        outcome: &AttemptFailure,
    ) -> Result<WebhookDelivery, WebhookError> {
        let mut row = self.working_copy(id)?;
        apply_failure(&mut row, outcome, Utc::now());
        self.staged.insert(id, row.clone());
        Ok(row)
    }

    async fn commit(mut self) -> Result<(), WebhookError> {
        let state = Arc::clone(&self.state);
        let mut guard = state.lock();
        for (id, row) in std::mem::take(&mut self.staged) {
            if let Some(current) = guard.delivery_mut(id) {
                *current = row;
            }
        }
        self.unlock(&mut guard);
        Ok(())
    }

    async fn release(mut self) -> Result<(), WebhookError> {
        let state = Arc::clone(&self.state);
        let mut guard = state.lock();
        self.unlock(&mut guard);
        Ok(())
    }
}

#[async_trait]
impl ClaimScheduler for InMemoryWebhookStore {
    type Claim = InMemoryDeliveryClaim;

    async fn claim_due(&self, limit: i64) -> Result<InMemoryDeliveryClaim, WebhookError> {
        let now = Utc::now();
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);

        let mut state = self.state.lock();
        let mut due: Vec<WebhookDelivery> = state
            .deliveries
            .iter()
            .filter(|d| d.is_due(now) && !state.locked.contains(&d.id))
            .cloned()
            .collect();
        due.sort_by_key(|d| d.next_attempt_at);
        due.truncate(limit);

        for d in &due {
            state.locked.insert(d.id);
        }

        Ok(InMemoryDeliveryClaim {
            state: Arc::clone(&self.state),
            deliveries: due,
            staged: HashMap::new(),
            released: false,
        })
    }
}

#[async_trait]
impl DeadLetterArchive for InMemoryWebhookStore {
    async fn migrate_to_dead_letter(
        &self,
        delivery: &WebhookDelivery,
    ) -> Result<WebhookDeadLetter, WebhookError> {
        ensure_archivable(delivery)?;
        Ok(self.state.lock().archive(delivery))
    }

    async fn migrate_exhausted(&self, limit: i64) -> Result<Vec<WebhookDeadLetter>, WebhookError> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let mut state = self.state.lock();

        let archived_ids: HashSet<Uuid> =
            state.dead_letters.iter().map(|e| e.delivery_id).collect();
        let mut candidates: Vec<WebhookDelivery> = state
            .deliveries
            .iter()
            .filter(|d| {
                d.status == DeliveryStatus::Failed
                    && !archived_ids.contains(&d.id)
                    && !state.locked.contains(&d.id)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|d| d.updated_at);
        candidates.truncate(limit);

        Ok(candidates.iter().map(|d| state.archive(d)).collect())
    }

    async fn list_dead_letters(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookDeadLetter>, WebhookError> {
        let state = self.state.lock();
        let mut rows: Vec<&WebhookDeadLetter> = state.dead_letters.iter().rev().collect();
        rows.sort_by(|a, b| b.moved_to_dlq_at.cmp(&a.moved_to_dlq_at));
        Ok(page(rows, limit, offset))
    }

    async fn find_dead_letter(&self, id: Uuid) -> Result<Option<WebhookDeadLetter>, WebhookError> {
        let state = self.state.lock();
        Ok(state.dead_letters.iter().find(|e| e.id == id).cloned())
    }

    async fn count_dead_letters(&self) -> Result<i64, WebhookError> {
        Ok(self.state.lock().dead_letters.len() as i64)
    }

    async fn record_replay(
        &self,
        id: Uuid,
        successful: bool,
    ) -> Result<Option<WebhookDeadLetter>, WebhookError> {
        let mut state = self.state.lock();
        Ok(state.dead_letter_mut(id).map(|entry| {
            entry.replayed_at = Some(Utc::now());
            entry.replay_successful = Some(successful);
            entry.clone()
        }))
    }

    async fn delete_dead_letter(&self, id: Uuid) -> Result<bool, WebhookError> {
        let mut state = self.state.lock();
        let before = state.dead_letters.len();
        state.dead_letters.retain(|e| e.id != id);
        Ok(state.dead_letters.len() < before)
    }
}
