// Webhook subscriptions and dispatch
//
// A webhook is a board-scoped registration of an external endpoint that
// subscribes to a subset of the permitted actions. Dispatch turns one event
// into one delivery per matching active webhook.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use crate::board::Board;
use crate::delivery::Delivery;
use crate::error::{EventlineError, Result};
use crate::event::{actions, Event, EventableRef, Particulars};
use crate::fanout::NewFanoutTask;
use crate::traits::{FanoutQueue, WebhookStore};
use crate::user::User;

/// Actions that may ever reach an external endpoint
pub const PERMITTED_ACTIONS: &[&str] = &[
    actions::CARD_ASSIGNED,
    actions::CARD_BOARD_CHANGED,
    actions::CARD_CLOSED,
    actions::CARD_POSTPONED,
    actions::CARD_PUBLISHED,
    actions::CARD_REOPENED,
    actions::CARD_TITLE_CHANGED,
    actions::CARD_UNASSIGNED,
    actions::COMMENT_CREATED,
];

// ============================================================================
// Webhook
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub account_id: Uuid,
    pub board_id: Uuid,
    pub name: String,
    pub url: String,
    pub active: bool,
    pub subscribed_actions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    /// Create an active webhook after validating its endpoint and actions
    pub fn new<I, S>(
        account_id: Uuid,
        board_id: Uuid,
        name: impl Into<String>,
        url: impl Into<String>,
        subscribed_actions: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let webhook = Self {
            id: Uuid::now_v7(),
            account_id,
            board_id,
            name: name.into(),
            url: url.into(),
            active: true,
            subscribed_actions: subscribed_actions.into_iter().map(Into::into).collect(),
            created_at: Utc::now(),
        };
        webhook.validate()?;
        Ok(webhook)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EventlineError::validation("webhook name can't be blank"));
        }

        let url = Url::parse(&self.url)
            .map_err(|e| EventlineError::validation(format!("invalid webhook url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EventlineError::validation(format!(
                "webhook url must use http or https, got {}",
                url.scheme()
            )));
        }

        if let Some(action) = self
            .subscribed_actions
            .iter()
            .find(|action| !PERMITTED_ACTIONS.contains(&action.as_str()))
        {
            return Err(EventlineError::validation(format!(
                "action {action} is not available for webhooks"
            )));
        }

        Ok(())
    }

    pub fn subscribes_to(&self, action: &str) -> bool {
        self.subscribed_actions.contains(action)
    }

    /// Replace the subscribed actions. Existing deliveries are unaffected.
    pub fn resubscribe<I, S>(&mut self, subscribed_actions: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let previous = std::mem::replace(
            &mut self.subscribed_actions,
            subscribed_actions.into_iter().map(Into::into).collect(),
        );
        if let Err(e) = self.validate() {
            self.subscribed_actions = previous;
            return Err(e);
        }
        Ok(())
    }
}

// ============================================================================
// Wire payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadBoard {
    pub id: Uuid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadUser {
    pub id: Uuid,
    pub name: Option<String>,
}

/// JSON body delivered to webhook endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: Uuid,
    pub action: String,
    pub created_at: DateTime<Utc>,
    pub particulars: Particulars,
    pub eventable: EventableRef,
    pub board: PayloadBoard,
    pub creator: PayloadUser,
}

impl WebhookPayload {
    pub fn new(event: &Event, board: Option<&Board>, creator: Option<&User>) -> Self {
        Self {
            id: event.id,
            action: event.action.clone(),
            created_at: event.created_at,
            particulars: event.particulars.clone(),
            eventable: event.eventable,
            board: PayloadBoard {
                id: event.board_id,
                name: board.map(|b| b.name.clone()),
            },
            creator: PayloadUser {
                id: event.creator_id,
                name: creator.map(|u| u.name.clone()),
            },
        }
    }
}

// ============================================================================
// WebhookDispatcher - subscription matching
// ============================================================================

/// Matches events against webhook subscriptions and creates deliveries
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    permitted: BTreeSet<String>,
    delivery_max_attempts: u32,
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new(PERMITTED_ACTIONS.iter().copied())
    }
}

impl WebhookDispatcher {
    pub fn new<I, S>(permitted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permitted: permitted.into_iter().map(Into::into).collect(),
            delivery_max_attempts: 1,
        }
    }

    /// Attempts granted to each delivery task (storage failures only; HTTP
    /// failures are recorded, not retried)
    pub fn with_delivery_max_attempts(mut self, max_attempts: u32) -> Self {
        self.delivery_max_attempts = max_attempts.max(1);
        self
    }

    pub fn is_permitted(&self, action: &str) -> bool {
        self.permitted.contains(action)
    }

    pub fn matches(&self, webhook: &Webhook, event: &Event) -> bool {
        webhook.active
            && webhook.board_id == event.board_id
            && self.is_permitted(&event.action)
            && webhook.subscribes_to(&event.action)
    }

    /// Create one delivery per matching active webhook and schedule it
    ///
    /// Safe to re-run: deliveries are keyed by (webhook, event) and delivery
    /// tasks by delivery id.
    #[instrument(skip_all, fields(event_id = %event.id, action = %event.action))]
    pub async fn dispatch_webhooks(
        &self,
        event: &Event,
        webhooks: &dyn WebhookStore,
        queue: &dyn FanoutQueue,
    ) -> Result<Vec<Delivery>> {
        if !self.is_permitted(&event.action) {
            debug!("action not permitted for webhooks");
            return Ok(Vec::new());
        }

        let mut candidates = webhooks.active_webhooks_for_board(event.board_id).await?;
        candidates.retain(|webhook| self.matches(webhook, event));
        candidates.sort_by_key(|webhook| webhook.id);

        let mut deliveries = Vec::with_capacity(candidates.len());
        for webhook in candidates {
            let delivery = webhooks.ensure_delivery(webhook.id, event.id).await?;
            queue
                .enqueue(
                    NewFanoutTask::deliver_webhook(delivery.id)
                        .with_max_attempts(self.delivery_max_attempts),
                )
                .await?;
            deliveries.push(delivery);
        }

        debug!(count = deliveries.len(), "dispatched webhook deliveries");
        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryState;
    use crate::memory::InMemoryStore;

    fn board_webhook(actions: &[&str]) -> Webhook {
        Webhook::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "CI",
            "https://example.com/hooks/eventline",
            actions.iter().copied(),
        )
        .unwrap()
    }

    fn event_on(board_id: Uuid, action: &str) -> Event {
        Event::new(
            Uuid::now_v7(),
            board_id,
            Uuid::now_v7(),
            EventableRef::card(Uuid::now_v7()),
            action,
            Particulars::new(),
        )
    }

    #[test]
    fn test_rejects_unpermitted_action() {
        let result = Webhook::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "CI",
            "https://example.com/hook",
            ["card_internal_bookkeeping"],
        );
        assert!(matches!(result, Err(EventlineError::Validation(_))));
    }

    #[test]
    fn test_rejects_non_http_url() {
        let result = Webhook::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "CI",
            "ftp://example.com/hook",
            [actions::CARD_CLOSED],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_matches_requires_board_action_and_active() {
        let dispatcher = WebhookDispatcher::default();
        let mut webhook = board_webhook(&[actions::CARD_CLOSED]);

        assert!(dispatcher.matches(&webhook, &event_on(webhook.board_id, actions::CARD_CLOSED)));
        assert!(!dispatcher.matches(&webhook, &event_on(webhook.board_id, actions::CARD_REOPENED)));
        assert!(!dispatcher.matches(&webhook, &event_on(Uuid::now_v7(), actions::CARD_CLOSED)));

        webhook.active = false;
        assert!(!dispatcher.matches(&webhook, &event_on(webhook.board_id, actions::CARD_CLOSED)));
    }

    #[test]
    fn test_allow_list_overrides_subscription() {
        let dispatcher = WebhookDispatcher::new([actions::CARD_PUBLISHED]);
        let webhook = board_webhook(&[actions::CARD_CLOSED]);

        assert!(!dispatcher.matches(&webhook, &event_on(webhook.board_id, actions::CARD_CLOSED)));
    }

    #[test]
    fn test_resubscribe_keeps_previous_actions_on_error() {
        let mut webhook = board_webhook(&[actions::CARD_CLOSED]);
        assert!(webhook.resubscribe(["nope"]).is_err());
        assert!(webhook.subscribes_to(actions::CARD_CLOSED));
    }

    #[tokio::test]
    async fn test_dispatch_ignores_unpermitted_and_unsubscribed_actions() {
        let store = InMemoryStore::new();
        let webhook = store.add_webhook(board_webhook(&[actions::CARD_CLOSED]));

        let dispatcher = WebhookDispatcher::default();
        for action in ["card_internal_bookkeeping", actions::CARD_REOPENED] {
            let event = event_on(webhook.board_id, action);
            let deliveries = dispatcher
                .dispatch_webhooks(&event, &store, &store)
                .await
                .unwrap();
            assert!(deliveries.is_empty(), "{action} should not be delivered");
        }

        // subscribed, but narrowed out of the allow-list
        let narrowed = WebhookDispatcher::new([actions::CARD_PUBLISHED]);
        let event = event_on(webhook.board_id, actions::CARD_CLOSED);
        let deliveries = narrowed
            .dispatch_webhooks(&event, &store, &store)
            .await
            .unwrap();
        assert!(deliveries.is_empty());

        assert_eq!(store.delivery_count(), 0);
        assert_eq!(store.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_resubscribe_keeps_existing_deliveries() {
        let store = InMemoryStore::new();
        let mut webhook = store.add_webhook(board_webhook(&[actions::CARD_CLOSED]));
        let dispatcher = WebhookDispatcher::default();
        let event = event_on(webhook.board_id, actions::CARD_CLOSED);

        let created = dispatcher
            .dispatch_webhooks(&event, &store, &store)
            .await
            .unwrap();
        assert_eq!(created.len(), 1);

        webhook.resubscribe([actions::CARD_REOPENED]).unwrap();
        store.save_webhook(&webhook).await.unwrap();

        // a re-run no longer matches, but nothing already created is touched
        let rerun = dispatcher
            .dispatch_webhooks(&event, &store, &store)
            .await
            .unwrap();
        assert!(rerun.is_empty());

        let kept = store.deliveries_for_event(event.id).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, created[0].id);
        assert_eq!(kept[0].state, DeliveryState::Pending);
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[test]
    fn test_payload_shape() {
        let account_id = Uuid::now_v7();
        let board = Board::new(account_id, "Roadmap");
        let creator = User::member(account_id, "Ada");
        let event = Event::new(
            account_id,
            board.id,
            creator.id,
            EventableRef::card(Uuid::now_v7()),
            actions::CARD_CLOSED,
            Particulars::new(),
        );

        let json = serde_json::to_value(WebhookPayload::new(&event, Some(&board), Some(&creator)))
            .unwrap();

        assert_eq!(json["action"], "card_closed");
        assert_eq!(json["board"]["name"], "Roadmap");
        assert_eq!(json["creator"]["name"], "Ada");
        assert_eq!(json["eventable"]["type"], "card");
    }
}
