// Store traits
//
// Seams between the domain logic and persistence. The in-memory store
// implements all of them for tests and single-process runs; the Postgres
// store lives in eventline-storage.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::board::Board;
use crate::card::Card;
use crate::comment::Comment;
use crate::delivery::{DelinquencyTracker, Delivery, DeliveryOutcome};
use crate::error::Result;
use crate::event::{Event, EventQuery, EventRecord, EventableRef};
use crate::fanout::{FanoutKind, FanoutTask, NewFanoutTask, QueueStats, TaskFailureOutcome};
use crate::notification::{NewNotification, Notification};
use crate::user::User;
use crate::webhook::Webhook;

// ============================================================================
// Transaction - unit of work for a state change
// ============================================================================

/// A database transaction that state changes, their events and their outbox
/// rows are written through
///
/// Nothing written through a transaction is visible to readers or workers
/// until `commit` succeeds. Dropping without committing rolls back.
#[async_trait]
pub trait Transaction: Send {
    async fn insert_event(&mut self, event: &Event) -> Result<()>;

    /// Write an outbox row. Returns false when `(kind, subject_id)` already exists.
    async fn enqueue_fanout(&mut self, task: NewFanoutTask) -> Result<bool>;

    async fn find_user(&mut self, id: Uuid) -> Result<Option<User>>;

    async fn find_users(&mut self, ids: &[Uuid]) -> Result<Vec<User>>;

    async fn find_board(&mut self, id: Uuid) -> Result<Option<Board>>;

    /// The account's system user, used as author of generated comments
    async fn system_user(&mut self, account_id: Uuid) -> Result<User>;

    /// Load a card and lock it for the rest of the transaction
    async fn find_card_for_update(&mut self, id: Uuid) -> Result<Option<Card>>;

    /// Insert or update a card
    async fn save_card(&mut self, card: &Card) -> Result<()>;

    async fn insert_comment(&mut self, comment: &Comment) -> Result<()>;

    async fn find_comment(&mut self, id: Uuid) -> Result<Option<Comment>>;

    /// Delete a card with its comments and every event, notification and
    /// delivery that references them. Returns false if the card did not exist.
    async fn delete_card(&mut self, id: Uuid) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// ============================================================================
// EventStore
// ============================================================================

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>>;

    /// Committed events in scope, `created_at` ascending with ties broken by
    /// id descending
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>>;
}

// ============================================================================
// AudienceResolver - who cares about an eventable
// ============================================================================

#[async_trait]
pub trait AudienceResolver: Send + Sync {
    async fn board_watchers(&self, board_id: Uuid) -> Result<Vec<Uuid>>;

    async fn card_watchers(&self, card_id: Uuid) -> Result<Vec<Uuid>>;

    async fn card_assignees(&self, card_id: Uuid) -> Result<Vec<Uuid>>;

    /// Users mentioned in the eventable's text
    async fn mentionees(&self, eventable: EventableRef) -> Result<Vec<Uuid>>;

    async fn comment_card_id(&self, comment_id: Uuid) -> Result<Option<Uuid>>;

    async fn find_user(&self, id: Uuid) -> Result<Option<User>>;

    /// Users with the given ids in one lookup; unknown ids are left out
    async fn find_users(&self, ids: &[Uuid]) -> Result<Vec<User>>;

    async fn find_board(&self, id: Uuid) -> Result<Option<Board>>;
}

// ============================================================================
// NotificationStore
// ============================================================================

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a notification unless one already exists for (event, user).
    /// Returns the stored row either way.
    async fn ensure_notification(&self, notification: NewNotification) -> Result<Notification>;

    async fn notifications_for_event(&self, event_id: Uuid) -> Result<Vec<Notification>>;

    /// Newest first
    async fn notifications_for_user(&self, user_id: Uuid) -> Result<Vec<Notification>>;

    async fn mark_read(&self, notification_id: Uuid) -> Result<Notification>;
}

// ============================================================================
// WebhookStore
// ============================================================================

#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Insert or update a webhook
    async fn save_webhook(&self, webhook: &Webhook) -> Result<()>;

    async fn find_webhook(&self, id: Uuid) -> Result<Option<Webhook>>;

    async fn active_webhooks_for_board(&self, board_id: Uuid) -> Result<Vec<Webhook>>;

    /// Insert a pending delivery unless one already exists for (webhook, event)
    async fn ensure_delivery(&self, webhook_id: Uuid, event_id: Uuid) -> Result<Delivery>;

    async fn find_delivery(&self, id: Uuid) -> Result<Option<Delivery>>;

    async fn deliveries_for_event(&self, event_id: Uuid) -> Result<Vec<Delivery>>;

    async fn update_delivery(&self, delivery: &Delivery) -> Result<()>;

    /// Current tracker, or a fresh one if the webhook never failed
    async fn delinquency(&self, webhook_id: Uuid) -> Result<DelinquencyTracker>;

    /// Fold a delivery outcome into the webhook's tracker and return the
    /// updated tracker. Concurrent calls for one webhook must not lose counts.
    async fn record_delivery_outcome(
        &self,
        webhook_id: Uuid,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<DelinquencyTracker>;

    async fn deactivate_webhook(&self, webhook_id: Uuid) -> Result<()>;
}

// ============================================================================
// FanoutQueue - worker side of the outbox
// ============================================================================

#[async_trait]
pub trait FanoutQueue: Send + Sync {
    /// Write an outbox row outside of any event transaction (follow-up work
    /// created by workers). Returns false if it already existed.
    async fn enqueue(&self, task: NewFanoutTask) -> Result<bool>;

    /// Claim up to `max` visible pending tasks of the given kinds
    async fn claim(
        &self,
        worker_id: &str,
        kinds: &[FanoutKind],
        max: usize,
    ) -> Result<Vec<FanoutTask>>;

    /// Mark a claimed task done
    ///
    /// `complete` and `fail` only apply while `task` still holds the claim
    /// (same worker, same attempt); otherwise they return `ClaimLost`.
    async fn complete(&self, task: &FanoutTask) -> Result<()>;

    /// Record a failed run. With attempts remaining the task becomes visible
    /// again after `retry_delay`; otherwise it is parked as dead.
    async fn fail(
        &self,
        task: &FanoutTask,
        error: &str,
        retry_delay: Duration,
    ) -> Result<TaskFailureOutcome>;

    /// Return tasks claimed longer than `threshold` ago to pending
    async fn reclaim_stale(&self, threshold: Duration) -> Result<usize>;

    /// Wait until new tasks may be available or `timeout` elapses
    async fn wait_for_tasks(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    async fn stats(&self) -> Result<QueueStats>;
}
