// Notification fanout
//
// Strategies compute recipients per eventable kind and action. The registry
// picks one, applies the gate, removes the creator and writes one
// notification per recipient with insert-if-absent semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::event::{actions, Event, EventableKind, EventableRef};
use crate::notification::{NewNotification, Notification};
use crate::traits::{AudienceResolver, NotificationStore};
use crate::user::User;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Whether this event notifies anyone at all. Events created by the
    /// system user never do.
    fn should_notify(&self, _event: &Event, creator: Option<&User>) -> bool {
        !creator.is_some_and(User::is_system)
    }

    /// Candidate recipients; the registry removes the creator and dedupes
    async fn recipients(&self, event: &Event, audience: &dyn AudienceResolver)
        -> Result<Vec<Uuid>>;
}

// ============================================================================
// Strategies
// ============================================================================

/// Everyone watching the event's board
pub struct BoardWatchersNotifier;

#[async_trait]
impl Notifier for BoardWatchersNotifier {
    async fn recipients(
        &self,
        event: &Event,
        audience: &dyn AudienceResolver,
    ) -> Result<Vec<Uuid>> {
        audience.board_watchers(event.board_id).await
    }
}

/// The users named in the assignment
pub struct AssignmentNotifier;

#[async_trait]
impl Notifier for AssignmentNotifier {
    async fn recipients(
        &self,
        event: &Event,
        _audience: &dyn AudienceResolver,
    ) -> Result<Vec<Uuid>> {
        Ok(event.assignee_ids())
    }
}

/// Board watchers who were not mentioned, plus every assignee
pub struct PublicationNotifier;

#[async_trait]
impl Notifier for PublicationNotifier {
    async fn recipients(
        &self,
        event: &Event,
        audience: &dyn AudienceResolver,
    ) -> Result<Vec<Uuid>> {
        let mentionees = audience.mentionees(event.eventable).await?;
        let mut recipients = audience.board_watchers(event.board_id).await?;
        recipients.retain(|id| !mentionees.contains(id));
        recipients.extend(audience.card_assignees(event.eventable.id).await?);
        Ok(recipients)
    }
}

/// Watchers of the parent card who were not mentioned in the comment
pub struct CommentNotifier;

#[async_trait]
impl Notifier for CommentNotifier {
    async fn recipients(
        &self,
        event: &Event,
        audience: &dyn AudienceResolver,
    ) -> Result<Vec<Uuid>> {
        let Some(card_id) = audience.comment_card_id(event.eventable.id).await? else {
            return Ok(Vec::new());
        };
        let mentionees = audience
            .mentionees(EventableRef::comment(event.eventable.id))
            .await?;
        let mut recipients = audience.card_watchers(card_id).await?;
        recipients.retain(|id| !mentionees.contains(id));
        Ok(recipients)
    }
}

/// Bookkeeping actions that nobody is told about
pub struct QuietNotifier;

#[async_trait]
impl Notifier for QuietNotifier {
    fn should_notify(&self, _event: &Event, _creator: Option<&User>) -> bool {
        false
    }

    async fn recipients(
        &self,
        _event: &Event,
        _audience: &dyn AudienceResolver,
    ) -> Result<Vec<Uuid>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// NotifierRegistry
// ============================================================================

/// Strategy lookup: `(kind, action)`, then `kind`, then the fallback
pub struct NotifierRegistry {
    by_action: HashMap<(EventableKind, String), Arc<dyn Notifier>>,
    by_kind: HashMap<EventableKind, Arc<dyn Notifier>>,
    fallback: Arc<dyn Notifier>,
}

impl Default for NotifierRegistry {
    fn default() -> Self {
        let mut registry = Self::new(Arc::new(BoardWatchersNotifier));
        registry.register_action(
            EventableKind::Card,
            actions::CARD_ASSIGNED,
            Arc::new(AssignmentNotifier),
        );
        registry.register_action(
            EventableKind::Card,
            actions::CARD_PUBLISHED,
            Arc::new(PublicationNotifier),
        );
        registry.register_action(
            EventableKind::Card,
            actions::CARD_TITLE_CHANGED,
            Arc::new(QuietNotifier),
        );
        registry.register_kind(EventableKind::Comment, Arc::new(CommentNotifier));
        registry
    }
}

impl NotifierRegistry {
    /// Empty registry that routes everything to `fallback`
    pub fn new(fallback: Arc<dyn Notifier>) -> Self {
        Self {
            by_action: HashMap::new(),
            by_kind: HashMap::new(),
            fallback,
        }
    }

    pub fn register_action(
        &mut self,
        kind: EventableKind,
        action: impl Into<String>,
        notifier: Arc<dyn Notifier>,
    ) {
        self.by_action.insert((kind, action.into()), notifier);
    }

    pub fn register_kind(&mut self, kind: EventableKind, notifier: Arc<dyn Notifier>) {
        self.by_kind.insert(kind, notifier);
    }

    pub fn strategy_for(&self, event: &Event) -> &dyn Notifier {
        let kind = event.eventable.kind;
        self.by_action
            .get(&(kind, event.action.clone()))
            .or_else(|| self.by_kind.get(&kind))
            .unwrap_or(&self.fallback)
            .as_ref()
    }

    /// Final recipient list: gated, creator removed, deduplicated, sorted by id
    pub async fn recipients(
        &self,
        event: &Event,
        audience: &dyn AudienceResolver,
    ) -> Result<Vec<Uuid>> {
        let strategy = self.strategy_for(event);
        let creator = audience.find_user(event.creator_id).await?;
        if !strategy.should_notify(event, creator.as_ref()) {
            return Ok(Vec::new());
        }

        let mut recipients = strategy.recipients(event, audience).await?;
        recipients.retain(|id| *id != event.creator_id);
        recipients.sort();
        recipients.dedup();
        Ok(recipients)
    }

    /// Write one notification per recipient
    ///
    /// Safe to re-run after a partial failure: existing (event, user) rows
    /// are returned as they are.
    #[instrument(skip_all, fields(event_id = %event.id, action = %event.action))]
    pub async fn notify_recipients(
        &self,
        event: &Event,
        audience: &dyn AudienceResolver,
        store: &dyn NotificationStore,
    ) -> Result<Vec<Notification>> {
        let recipients = self.recipients(event, audience).await?;

        let mut notifications = Vec::with_capacity(recipients.len());
        for user_id in recipients {
            let notification = store
                .ensure_notification(NewNotification {
                    user_id,
                    event_id: event.id,
                    creator_id: event.creator_id,
                })
                .await?;
            notifications.push(notification);
        }

        debug!(count = notifications.len(), "notified recipients");
        Ok(notifications)
    }
}
