//! In-memory implementation of every store trait
//!
//! Used by tests and by the worker binary when no database is configured.
//! Writers are serialized with a single async lock held for the lifetime of a
//! transaction; staged writes become visible only on commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, OwnedMutexGuard};
use uuid::Uuid;

use crate::board::Board;
use crate::card::Card;
use crate::comment::Comment;
use crate::delivery::{DelinquencyTracker, Delivery, DeliveryOutcome};
use crate::error::{EventlineError, Result};
use crate::event::{
    sort_chronologically, Event, EventQuery, EventRecord, EventableKind, EventableRef,
    EventableSummary,
};
use crate::fanout::{
    FanoutKind, FanoutTask, NewFanoutTask, QueueStats, TaskFailureOutcome, TaskStatus,
};
use crate::notification::{NewNotification, Notification};
use crate::traits::{
    AudienceResolver, EventStore, FanoutQueue, NotificationStore, Transaction, WebhookStore,
};
use crate::user::User;
use crate::webhook::Webhook;

/// Outbox row
struct TaskRow {
    id: Uuid,
    kind: FanoutKind,
    subject_id: Uuid,
    status: TaskStatus,
    attempt: u32,
    max_attempts: u32,
    seq: u64,
    visible_at: DateTime<Utc>,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct TaskTable {
    rows: HashMap<Uuid, TaskRow>,
    keys: HashMap<(FanoutKind, Uuid), Uuid>,
    seq: u64,
}

impl TaskTable {
    fn contains(&self, kind: FanoutKind, subject_id: Uuid) -> bool {
        self.keys.contains_key(&(kind, subject_id))
    }

    fn insert(&mut self, task: NewFanoutTask) -> bool {
        if self.contains(task.kind, task.subject_id) {
            return false;
        }
        self.seq += 1;
        let id = Uuid::now_v7();
        self.keys.insert((task.kind, task.subject_id), id);
        self.rows.insert(
            id,
            TaskRow {
                id,
                kind: task.kind,
                subject_id: task.subject_id,
                status: TaskStatus::Pending,
                attempt: 0,
                max_attempts: task.max_attempts,
                seq: self.seq,
                visible_at: Utc::now(),
                claimed_by: None,
                claimed_at: None,
                last_error: None,
            },
        );
        true
    }

    fn remove_subjects(&mut self, subjects: &HashSet<Uuid>) {
        self.rows.retain(|_, row| !subjects.contains(&row.subject_id));
        self.keys.retain(|(_, subject), _| !subjects.contains(subject));
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut TaskRow> {
        self.rows
            .get_mut(&id)
            .ok_or_else(|| EventlineError::not_found("task", id))
    }

    /// The row, if `task` still holds its claim
    fn claimed_mut(&mut self, task: &FanoutTask) -> Result<&mut TaskRow> {
        let row = self.get_mut(task.id)?;
        let held = row.status == TaskStatus::Claimed
            && row.attempt == task.attempt
            && row.claimed_by.as_deref() == Some(task.claimed_by.as_str());
        if !held {
            return Err(EventlineError::ClaimLost(task.id));
        }
        Ok(row)
    }
}

struct Inner {
    users: RwLock<HashMap<Uuid, User>>,
    boards: RwLock<HashMap<Uuid, Board>>,
    cards: RwLock<HashMap<Uuid, Card>>,
    comments: RwLock<HashMap<Uuid, Comment>>,
    events: RwLock<HashMap<Uuid, Event>>,
    /// Keyed by (event, user)
    notifications: RwLock<HashMap<(Uuid, Uuid), Notification>>,
    webhooks: RwLock<HashMap<Uuid, Webhook>>,
    /// Keyed by (webhook, event)
    deliveries: RwLock<HashMap<(Uuid, Uuid), Delivery>>,
    delinquency: RwLock<HashMap<Uuid, DelinquencyTracker>>,
    tasks: RwLock<TaskTable>,
    writer: Arc<tokio::sync::Mutex<()>>,
    task_signal: Notify,
    notification_fault: Mutex<Option<usize>>,
}

/// In-memory store with the same semantics as the PostgreSQL one
///
/// # Example
///
/// ```
/// use eventline_core::{Board, InMemoryStore, User};
/// use uuid::Uuid;
///
/// let store = InMemoryStore::new();
/// let account_id = Uuid::now_v7();
/// let ada = store.add_user(User::member(account_id, "Ada"));
/// store.add_board(Board::new(account_id, "Roadmap").with_watchers(vec![ada.id]));
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                users: RwLock::new(HashMap::new()),
                boards: RwLock::new(HashMap::new()),
                cards: RwLock::new(HashMap::new()),
                comments: RwLock::new(HashMap::new()),
                events: RwLock::new(HashMap::new()),
                notifications: RwLock::new(HashMap::new()),
                webhooks: RwLock::new(HashMap::new()),
                deliveries: RwLock::new(HashMap::new()),
                delinquency: RwLock::new(HashMap::new()),
                tasks: RwLock::new(TaskTable::default()),
                writer: Arc::new(tokio::sync::Mutex::new(())),
                task_signal: Notify::new(),
                notification_fault: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------------

    pub fn add_user(&self, user: User) -> User {
        self.inner.users.write().insert(user.id, user.clone());
        user
    }

    pub fn add_board(&self, board: Board) -> Board {
        self.inner.boards.write().insert(board.id, board.clone());
        board
    }

    pub fn add_card(&self, card: Card) -> Card {
        self.inner.cards.write().insert(card.id, card.clone());
        card
    }

    pub fn add_webhook(&self, webhook: Webhook) -> Webhook {
        self.inner.webhooks.write().insert(webhook.id, webhook.clone());
        webhook
    }

    /// Make the notification insert after the next `successes` new inserts
    /// fail once
    pub fn fail_notifications_after(&self, successes: usize) {
        *self.inner.notification_fault.lock() = Some(successes);
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn card(&self, id: Uuid) -> Option<Card> {
        self.inner.cards.read().get(&id).cloned()
    }

    /// Comments on a card, oldest first
    pub fn comments_for_card(&self, card_id: Uuid) -> Vec<Comment> {
        let mut comments: Vec<Comment> = self
            .inner
            .comments
            .read()
            .values()
            .filter(|c| c.card_id == card_id)
            .cloned()
            .collect();
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        comments
    }

    /// Every committed event, chronologically
    pub fn events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.inner.events.read().values().cloned().collect();
        sort_chronologically(&mut events);
        events
    }

    pub fn notification_count(&self) -> usize {
        self.inner.notifications.read().len()
    }

    pub fn delivery_count(&self) -> usize {
        self.inner.deliveries.read().len()
    }

    fn signal_tasks(&self) {
        self.inner.task_signal.notify_waiters();
    }

    fn eventable_summary(&self, eventable: EventableRef) -> Option<EventableSummary> {
        let card_id = match eventable.kind {
            EventableKind::Card => eventable.id,
            EventableKind::Comment => self.inner.comments.read().get(&eventable.id)?.card_id,
        };
        let title = self.inner.cards.read().get(&card_id)?.title.clone();
        Some(EventableSummary { eventable, title })
    }
}

// ============================================================================
// Transaction
// ============================================================================

struct MemoryTransaction {
    store: InMemoryStore,
    _writer: OwnedMutexGuard<()>,
    events: Vec<Event>,
    cards: HashMap<Uuid, Card>,
    comments: HashMap<Uuid, Comment>,
    tasks: Vec<NewFanoutTask>,
    deleted_cards: HashSet<Uuid>,
}

impl MemoryTransaction {
    fn card_exists(&self, id: Uuid) -> bool {
        !self.deleted_cards.contains(&id)
            && (self.cards.contains_key(&id) || self.store.inner.cards.read().contains_key(&id))
    }

    /// Remove everything belonging to deleted cards from committed state
    fn apply_deletes(&self) {
        if self.deleted_cards.is_empty() {
            return;
        }
        let inner = &self.store.inner;

        let comment_ids: HashSet<Uuid> = {
            let mut comments = inner.comments.write();
            let ids = comments
                .values()
                .filter(|c| self.deleted_cards.contains(&c.card_id))
                .map(|c| c.id)
                .collect();
            comments.retain(|_, c| !self.deleted_cards.contains(&c.card_id));
            ids
        };
        inner
            .cards
            .write()
            .retain(|id, _| !self.deleted_cards.contains(id));

        let event_ids: HashSet<Uuid> = {
            let mut events = inner.events.write();
            let doomed = |e: &Event| match e.eventable.kind {
                EventableKind::Card => self.deleted_cards.contains(&e.eventable.id),
                EventableKind::Comment => comment_ids.contains(&e.eventable.id),
            };
            let ids = events.values().filter(|e| doomed(e)).map(|e| e.id).collect();
            events.retain(|_, e| !doomed(e));
            ids
        };

        inner
            .notifications
            .write()
            .retain(|(event_id, _), _| !event_ids.contains(event_id));

        let delivery_ids: HashSet<Uuid> = {
            let mut deliveries = inner.deliveries.write();
            let ids = deliveries
                .values()
                .filter(|d| event_ids.contains(&d.event_id))
                .map(|d| d.id)
                .collect();
            deliveries.retain(|(_, event_id), _| !event_ids.contains(event_id));
            ids
        };

        let subjects: HashSet<Uuid> = event_ids.union(&delivery_ids).copied().collect();
        inner.tasks.write().remove_subjects(&subjects);
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn insert_event(&mut self, event: &Event) -> Result<()> {
        let duplicate = self.events.iter().any(|e| e.id == event.id)
            || self.store.inner.events.read().contains_key(&event.id);
        if duplicate {
            return Err(EventlineError::store(format!("duplicate event id {}", event.id)));
        }
        self.events.push(event.clone());
        Ok(())
    }

    async fn enqueue_fanout(&mut self, task: NewFanoutTask) -> Result<bool> {
        let exists = self
            .tasks
            .iter()
            .any(|t| t.kind == task.kind && t.subject_id == task.subject_id)
            || self
                .store
                .inner
                .tasks
                .read()
                .contains(task.kind, task.subject_id);
        if exists {
            return Ok(false);
        }
        self.tasks.push(task);
        Ok(true)
    }

    async fn find_user(&mut self, id: Uuid) -> Result<Option<User>> {
        Ok(self.store.inner.users.read().get(&id).cloned())
    }

    async fn find_users(&mut self, ids: &[Uuid]) -> Result<Vec<User>> {
        let users = self.store.inner.users.read();
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    async fn find_board(&mut self, id: Uuid) -> Result<Option<Board>> {
        Ok(self.store.inner.boards.read().get(&id).cloned())
    }

    async fn system_user(&mut self, account_id: Uuid) -> Result<User> {
        self.store
            .inner
            .users
            .read()
            .values()
            .find(|u| u.account_id == account_id && u.is_system())
            .cloned()
            .ok_or_else(|| EventlineError::not_found("system user", account_id))
    }

    async fn find_card_for_update(&mut self, id: Uuid) -> Result<Option<Card>> {
        if self.deleted_cards.contains(&id) {
            return Ok(None);
        }
        if let Some(card) = self.cards.get(&id) {
            return Ok(Some(card.clone()));
        }
        Ok(self.store.inner.cards.read().get(&id).cloned())
    }

    async fn save_card(&mut self, card: &Card) -> Result<()> {
        if self.deleted_cards.contains(&card.id) {
            return Err(EventlineError::store(format!("card {} was deleted", card.id)));
        }
        self.cards.insert(card.id, card.clone());
        Ok(())
    }

    async fn insert_comment(&mut self, comment: &Comment) -> Result<()> {
        if !self.card_exists(comment.card_id) {
            return Err(EventlineError::not_found("card", comment.card_id));
        }
        self.comments.insert(comment.id, comment.clone());
        Ok(())
    }

    async fn find_comment(&mut self, id: Uuid) -> Result<Option<Comment>> {
        let comment = match self.comments.get(&id) {
            Some(comment) => Some(comment.clone()),
            None => self.store.inner.comments.read().get(&id).cloned(),
        };
        Ok(comment.filter(|c| !self.deleted_cards.contains(&c.card_id)))
    }

    async fn delete_card(&mut self, id: Uuid) -> Result<bool> {
        if !self.card_exists(id) {
            return Ok(false);
        }

        self.cards.remove(&id);
        let staged_comments: HashSet<Uuid> = self
            .comments
            .values()
            .filter(|c| c.card_id == id)
            .map(|c| c.id)
            .collect();
        self.comments.retain(|_, c| c.card_id != id);

        let staged_events: HashSet<Uuid> = self
            .events
            .iter()
            .filter(|e| match e.eventable.kind {
                EventableKind::Card => e.eventable.id == id,
                EventableKind::Comment => staged_comments.contains(&e.eventable.id),
            })
            .map(|e| e.id)
            .collect();
        self.events.retain(|e| !staged_events.contains(&e.id));
        self.tasks.retain(|t| !staged_events.contains(&t.subject_id));

        self.deleted_cards.insert(id);
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let inner = &this.store.inner;

        inner.cards.write().extend(this.cards.iter().map(|(id, c)| (*id, c.clone())));
        inner
            .comments
            .write()
            .extend(this.comments.iter().map(|(id, c)| (*id, c.clone())));
        inner
            .events
            .write()
            .extend(this.events.iter().map(|e| (e.id, e.clone())));

        let scheduled = {
            let mut tasks = inner.tasks.write();
            this.tasks
                .iter()
                .filter(|task| tasks.insert((*task).clone()))
                .count()
        };

        this.apply_deletes();

        if scheduled > 0 {
            this.store.signal_tasks();
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// EventStore
// ============================================================================

#[async_trait]
impl EventStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let writer = self.inner.writer.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            _writer: writer,
            events: Vec::new(),
            cards: HashMap::new(),
            comments: HashMap::new(),
            tasks: Vec::new(),
            deleted_cards: HashSet::new(),
        }))
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>> {
        Ok(self.inner.events.read().get(&id).cloned())
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        let mut events: Vec<Event> = self
            .inner
            .events
            .read()
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        sort_chronologically(&mut events);
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }

        let records = events
            .into_iter()
            .map(|event| {
                let mut record = EventRecord::bare(event);
                if query.preload.creator {
                    record.creator = self.inner.users.read().get(&record.event.creator_id).cloned();
                }
                if query.preload.board {
                    record.board = self.inner.boards.read().get(&record.event.board_id).cloned();
                }
                if query.preload.eventable {
                    record.eventable = self.eventable_summary(record.event.eventable);
                }
                record
            })
            .collect();
        Ok(records)
    }
}

// ============================================================================
// AudienceResolver
// ============================================================================

#[async_trait]
impl AudienceResolver for InMemoryStore {
    async fn board_watchers(&self, board_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .inner
            .boards
            .read()
            .get(&board_id)
            .map(|b| b.watcher_ids.clone())
            .unwrap_or_default())
    }

    async fn card_watchers(&self, card_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .card(card_id)
            .map(|c| c.watcher_ids)
            .unwrap_or_default())
    }

    async fn card_assignees(&self, card_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .card(card_id)
            .map(|c| c.assignee_ids)
            .unwrap_or_default())
    }

    async fn mentionees(&self, eventable: EventableRef) -> Result<Vec<Uuid>> {
        let ids = match eventable.kind {
            EventableKind::Card => self.card(eventable.id).map(|c| c.mentionee_ids),
            EventableKind::Comment => self
                .inner
                .comments
                .read()
                .get(&eventable.id)
                .map(|c| c.mentionee_ids.clone()),
        };
        Ok(ids.unwrap_or_default())
    }

    async fn comment_card_id(&self, comment_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.inner.comments.read().get(&comment_id).map(|c| c.card_id))
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.inner.users.read().get(&id).cloned())
    }

    async fn find_users(&self, ids: &[Uuid]) -> Result<Vec<User>> {
        let users = self.inner.users.read();
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    async fn find_board(&self, id: Uuid) -> Result<Option<Board>> {
        Ok(self.inner.boards.read().get(&id).cloned())
    }
}

// ============================================================================
// NotificationStore
// ============================================================================

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn ensure_notification(&self, notification: NewNotification) -> Result<Notification> {
        let key = (notification.event_id, notification.user_id);
        if let Some(existing) = self.inner.notifications.read().get(&key) {
            return Ok(existing.clone());
        }

        {
            let mut fault = self.inner.notification_fault.lock();
            match *fault {
                Some(0) => {
                    *fault = None;
                    return Err(EventlineError::store("injected notification failure"));
                }
                Some(remaining) => *fault = Some(remaining - 1),
                None => {}
            }
        }

        Ok(self
            .inner
            .notifications
            .write()
            .entry(key)
            .or_insert_with(|| notification.into_notification())
            .clone())
    }

    async fn notifications_for_event(&self, event_id: Uuid) -> Result<Vec<Notification>> {
        let mut notifications: Vec<Notification> = self
            .inner
            .notifications
            .read()
            .values()
            .filter(|n| n.event_id == event_id)
            .cloned()
            .collect();
        notifications.sort_by_key(|n| n.user_id);
        Ok(notifications)
    }

    async fn notifications_for_user(&self, user_id: Uuid) -> Result<Vec<Notification>> {
        let mut notifications: Vec<Notification> = self
            .inner
            .notifications
            .read()
            .values()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(notifications)
    }

    async fn mark_read(&self, notification_id: Uuid) -> Result<Notification> {
        let mut notifications = self.inner.notifications.write();
        let notification = notifications
            .values_mut()
            .find(|n| n.id == notification_id)
            .ok_or_else(|| EventlineError::not_found("notification", notification_id))?;
        notification.read_at.get_or_insert_with(Utc::now);
        Ok(notification.clone())
    }
}

// ============================================================================
// WebhookStore
// ============================================================================

#[async_trait]
impl WebhookStore for InMemoryStore {
    async fn save_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.inner.webhooks.write().insert(webhook.id, webhook.clone());
        Ok(())
    }

    async fn find_webhook(&self, id: Uuid) -> Result<Option<Webhook>> {
        Ok(self.inner.webhooks.read().get(&id).cloned())
    }

    async fn active_webhooks_for_board(&self, board_id: Uuid) -> Result<Vec<Webhook>> {
        Ok(self
            .inner
            .webhooks
            .read()
            .values()
            .filter(|w| w.active && w.board_id == board_id)
            .cloned()
            .collect())
    }

    async fn ensure_delivery(&self, webhook_id: Uuid, event_id: Uuid) -> Result<Delivery> {
        Ok(self
            .inner
            .deliveries
            .write()
            .entry((webhook_id, event_id))
            .or_insert_with(|| Delivery::new(webhook_id, event_id))
            .clone())
    }

    async fn find_delivery(&self, id: Uuid) -> Result<Option<Delivery>> {
        Ok(self
            .inner
            .deliveries
            .read()
            .values()
            .find(|d| d.id == id)
            .cloned())
    }

    async fn deliveries_for_event(&self, event_id: Uuid) -> Result<Vec<Delivery>> {
        let mut deliveries: Vec<Delivery> = self
            .inner
            .deliveries
            .read()
            .values()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect();
        deliveries.sort_by_key(|d| d.webhook_id);
        Ok(deliveries)
    }

    async fn update_delivery(&self, delivery: &Delivery) -> Result<()> {
        let mut deliveries = self.inner.deliveries.write();
        let stored = deliveries
            .get_mut(&(delivery.webhook_id, delivery.event_id))
            .ok_or_else(|| EventlineError::not_found("delivery", delivery.id))?;
        *stored = delivery.clone();
        Ok(())
    }

    async fn delinquency(&self, webhook_id: Uuid) -> Result<DelinquencyTracker> {
        Ok(self
            .inner
            .delinquency
            .read()
            .get(&webhook_id)
            .cloned()
            .unwrap_or_else(|| DelinquencyTracker::new(webhook_id)))
    }

    async fn record_delivery_outcome(
        &self,
        webhook_id: Uuid,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<DelinquencyTracker> {
        let mut trackers = self.inner.delinquency.write();
        let tracker = trackers
            .entry(webhook_id)
            .or_insert_with(|| DelinquencyTracker::new(webhook_id));
        tracker.record(outcome, now);
        Ok(tracker.clone())
    }

    async fn deactivate_webhook(&self, webhook_id: Uuid) -> Result<()> {
        let mut webhooks = self.inner.webhooks.write();
        let webhook = webhooks
            .get_mut(&webhook_id)
            .ok_or_else(|| EventlineError::not_found("webhook", webhook_id))?;
        webhook.active = false;
        Ok(())
    }
}

// ============================================================================
// FanoutQueue
// ============================================================================

#[async_trait]
impl FanoutQueue for InMemoryStore {
    async fn enqueue(&self, task: NewFanoutTask) -> Result<bool> {
        let inserted = self.inner.tasks.write().insert(task);
        if inserted {
            self.signal_tasks();
        }
        Ok(inserted)
    }

    async fn claim(
        &self,
        worker_id: &str,
        kinds: &[FanoutKind],
        max: usize,
    ) -> Result<Vec<FanoutTask>> {
        let now = Utc::now();
        let mut tasks = self.inner.tasks.write();

        let mut visible: Vec<(u64, Uuid)> = tasks
            .rows
            .values()
            .filter(|row| {
                row.status == TaskStatus::Pending
                    && row.visible_at <= now
                    && kinds.contains(&row.kind)
            })
            .map(|row| (row.seq, row.id))
            .collect();
        visible.sort();

        let mut claimed = Vec::new();
        for (_, id) in visible.into_iter().take(max) {
            let row = tasks.get_mut(id)?;
            row.status = TaskStatus::Claimed;
            row.attempt += 1;
            row.claimed_by = Some(worker_id.to_string());
            row.claimed_at = Some(now);

            claimed.push(FanoutTask {
                id: row.id,
                kind: row.kind,
                subject_id: row.subject_id,
                attempt: row.attempt,
                max_attempts: row.max_attempts,
                claimed_by: worker_id.to_string(),
            });
        }
        Ok(claimed)
    }

    async fn complete(&self, task: &FanoutTask) -> Result<()> {
        let mut tasks = self.inner.tasks.write();
        let row = tasks.claimed_mut(task)?;
        row.status = TaskStatus::Completed;
        row.claimed_by = None;
        Ok(())
    }

    async fn fail(
        &self,
        task: &FanoutTask,
        error: &str,
        retry_delay: Duration,
    ) -> Result<TaskFailureOutcome> {
        let mut tasks = self.inner.tasks.write();
        let row = tasks.claimed_mut(task)?;
        row.last_error = Some(error.to_string());
        row.claimed_by = None;
        row.claimed_at = None;

        if row.attempt < row.max_attempts {
            row.status = TaskStatus::Pending;
            row.visible_at = Utc::now()
                + chrono::Duration::from_std(retry_delay).unwrap_or_else(|_| chrono::Duration::zero());
            Ok(TaskFailureOutcome::WillRetry {
                next_attempt: row.attempt + 1,
                delay: retry_delay,
            })
        } else {
            row.status = TaskStatus::Dead;
            Ok(TaskFailureOutcome::Dead)
        }
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tasks = self.inner.tasks.write();

        let mut reclaimed = 0;
        for row in tasks.rows.values_mut() {
            let stale = row.status == TaskStatus::Claimed
                && row.claimed_at.is_some_and(|at| at < cutoff);
            if !stale {
                continue;
            }
            row.claimed_by = None;
            row.claimed_at = None;
            if row.attempt >= row.max_attempts {
                row.status = TaskStatus::Dead;
                row.last_error = Some("worker lost while running final attempt".to_string());
            } else {
                row.status = TaskStatus::Pending;
                row.visible_at = Utc::now();
                reclaimed += 1;
            }
        }
        drop(tasks);

        if reclaimed > 0 {
            self.signal_tasks();
        }
        Ok(reclaimed)
    }

    async fn wait_for_tasks(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.inner.task_signal.notified()).await;
    }

    async fn stats(&self) -> Result<QueueStats> {
        let tasks = self.inner.tasks.read();
        let mut stats = QueueStats::default();
        for row in tasks.rows.values() {
            match row.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Claimed => stats.claimed += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (InMemoryStore, User, Board) {
        let store = InMemoryStore::new();
        let account_id = Uuid::now_v7();
        let user = store.add_user(User::member(account_id, "Ada"));
        let board = store.add_board(Board::new(account_id, "Roadmap"));
        (store, user, board)
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let (store, user, board) = seeded();
        let card = Card::draft(board.account_id, board.id, user.id, "Plan");

        let mut tx = store.begin().await.unwrap();
        tx.save_card(&card).await.unwrap();
        tx.enqueue_fanout(NewFanoutTask::notify(Uuid::now_v7())).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.card(card.id).is_none());
        assert_eq!(store.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_staged_writes_visible_inside_transaction_only() {
        let (store, user, board) = seeded();
        let card = Card::draft(board.account_id, board.id, user.id, "Plan");

        let mut tx = store.begin().await.unwrap();
        tx.save_card(&card).await.unwrap();
        assert!(tx.find_card_for_update(card.id).await.unwrap().is_some());
        assert!(store.card(card.id).is_none());

        tx.commit().await.unwrap();
        assert!(store.card(card.id).is_some());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_subject() {
        let store = InMemoryStore::new();
        let subject = Uuid::now_v7();

        assert!(store.enqueue(NewFanoutTask::notify(subject)).await.unwrap());
        assert!(!store.enqueue(NewFanoutTask::notify(subject)).await.unwrap());
        assert!(store
            .enqueue(NewFanoutTask::dispatch_webhooks(subject))
            .await
            .unwrap());
        assert_eq!(store.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_claim_respects_kind_and_order() {
        let store = InMemoryStore::new();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        store.enqueue(NewFanoutTask::notify(first)).await.unwrap();
        store.enqueue(NewFanoutTask::dispatch_webhooks(first)).await.unwrap();
        store.enqueue(NewFanoutTask::notify(second)).await.unwrap();

        let claimed = store.claim("w1", &[FanoutKind::Notify], 10).await.unwrap();
        let subjects: Vec<Uuid> = claimed.iter().map(|t| t.subject_id).collect();
        assert_eq!(subjects, vec![first, second]);
        assert!(claimed.iter().all(|t| t.attempt == 1));

        // already claimed
        assert!(store.claim("w2", &[FanoutKind::Notify], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_retries_then_dies() {
        let store = InMemoryStore::new();
        store
            .enqueue(NewFanoutTask::notify(Uuid::now_v7()).with_max_attempts(2))
            .await
            .unwrap();

        let task = store.claim("w1", &FanoutKind::ALL, 1).await.unwrap().remove(0);
        let outcome = store.fail(&task, "boom", Duration::ZERO).await.unwrap();
        assert_eq!(
            outcome,
            TaskFailureOutcome::WillRetry {
                next_attempt: 2,
                delay: Duration::ZERO
            }
        );

        let task = store.claim("w1", &FanoutKind::ALL, 1).await.unwrap().remove(0);
        assert_eq!(task.attempt, 2);
        let outcome = store.fail(&task, "boom", Duration::ZERO).await.unwrap();
        assert_eq!(outcome, TaskFailureOutcome::Dead);
        assert_eq!(store.stats().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn test_retry_delay_hides_task() {
        let store = InMemoryStore::new();
        store.enqueue(NewFanoutTask::notify(Uuid::now_v7())).await.unwrap();

        let task = store.claim("w1", &FanoutKind::ALL, 1).await.unwrap().remove(0);
        store
            .fail(&task, "boom", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.claim("w1", &FanoutKind::ALL, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_stale() {
        let store = InMemoryStore::new();
        store.enqueue(NewFanoutTask::notify(Uuid::now_v7())).await.unwrap();
        store.claim("w1", &FanoutKind::ALL, 1).await.unwrap();

        assert_eq!(store.reclaim_stale(Duration::from_secs(60)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.reclaim_stale(Duration::from_millis(5)).await.unwrap(), 1);

        let task = store.claim("w2", &FanoutKind::ALL, 1).await.unwrap().remove(0);
        assert_eq!(task.attempt, 2);
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_settle_reclaimed_task() {
        let store = InMemoryStore::new();
        store.enqueue(NewFanoutTask::notify(Uuid::now_v7())).await.unwrap();

        let stale = store.claim("w1", &FanoutKind::ALL, 1).await.unwrap().remove(0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.reclaim_stale(Duration::from_millis(5)).await.unwrap(), 1);

        // reclaimed but not yet picked up again
        let err = store.complete(&stale).await.unwrap_err();
        assert!(err.is_claim_lost());

        let current = store.claim("w2", &FanoutKind::ALL, 1).await.unwrap().remove(0);
        assert_eq!(current.claimed_by, "w2");

        let err = store.complete(&stale).await.unwrap_err();
        assert!(err.is_claim_lost());
        let err = store.fail(&stale, "late", Duration::ZERO).await.unwrap_err();
        assert!(err.is_claim_lost());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.completed, 0);

        store.complete(&current).await.unwrap();
        assert_eq!(store.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_same_worker_earlier_attempt_is_fenced() {
        let store = InMemoryStore::new();
        store.enqueue(NewFanoutTask::notify(Uuid::now_v7())).await.unwrap();

        let first = store.claim("w1", &FanoutKind::ALL, 1).await.unwrap().remove(0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.reclaim_stale(Duration::from_millis(5)).await.unwrap();
        let second = store.claim("w1", &FanoutKind::ALL, 1).await.unwrap().remove(0);
        assert_eq!(second.attempt, first.attempt + 1);

        assert!(store.complete(&first).await.unwrap_err().is_claim_lost());
        store.complete(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_notification_and_delivery_are_idempotent() {
        let store = InMemoryStore::new();
        let new = NewNotification {
            user_id: Uuid::now_v7(),
            event_id: Uuid::now_v7(),
            creator_id: Uuid::now_v7(),
        };

        let first = store.ensure_notification(new.clone()).await.unwrap();
        let second = store.ensure_notification(new).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.notification_count(), 1);

        let (webhook_id, event_id) = (Uuid::now_v7(), Uuid::now_v7());
        let a = store.ensure_delivery(webhook_id, event_id).await.unwrap();
        let b = store.ensure_delivery(webhook_id, event_id).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.delivery_count(), 1);
    }

    #[tokio::test]
    async fn test_mark_read() {
        let store = InMemoryStore::new();
        let notification = store
            .ensure_notification(NewNotification {
                user_id: Uuid::now_v7(),
                event_id: Uuid::now_v7(),
                creator_id: Uuid::now_v7(),
            })
            .await
            .unwrap();

        let read = store.mark_read(notification.id).await.unwrap();
        assert!(read.is_read());

        let listed = store.notifications_for_user(notification.user_id).await.unwrap();
        assert!(listed[0].is_read());
    }

    #[tokio::test]
    async fn test_writers_are_serialized() {
        let store = InMemoryStore::new();
        let tx = store.begin().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), store.begin()).await;
        assert!(waiting.is_err());

        drop(tx);
        assert!(store.begin().await.is_ok());
    }
}
