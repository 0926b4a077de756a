// Card entity and service
//
// Cards are the main eventable. Drafts are invisible to the audit trail:
// nothing they do is tracked until they are published.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{EventlineError, Result};
use crate::event::{particulars, particulars_from, Event, EventableRef, Particulars};
use crate::eventable::{Eventable, Reactions};
use crate::tracker::EventTracker;
use crate::traits::{EventStore, Transaction};
use crate::user::require_members;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Drafted,
    Published,
    Closed,
    Postponed,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafted => "drafted",
            Self::Published => "published",
            Self::Closed => "closed",
            Self::Postponed => "postponed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "drafted" => Ok(Self::Drafted),
            "published" => Ok(Self::Published),
            "closed" => Ok(Self::Closed),
            "postponed" => Ok(Self::Postponed),
            other => Err(EventlineError::store(format!("unknown card status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub account_id: Uuid,
    pub board_id: Uuid,
    pub title: String,
    pub status: CardStatus,
    pub creator_id: Uuid,
    #[serde(default)]
    pub assignee_ids: Vec<Uuid>,
    #[serde(default)]
    pub watcher_ids: Vec<Uuid>,
    #[serde(default)]
    pub mentionee_ids: Vec<Uuid>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Card {
    /// A new draft; the creator watches it
    pub fn draft(
        account_id: Uuid,
        board_id: Uuid,
        creator_id: Uuid,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            account_id,
            board_id,
            title: title.into(),
            status: CardStatus::Drafted,
            creator_id,
            assignee_ids: Vec::new(),
            watcher_ids: vec![creator_id],
            mentionee_ids: Vec::new(),
            last_active_at: now,
            created_at: now,
        }
    }

    pub fn with_mentionees(mut self, mentionee_ids: Vec<Uuid>) -> Self {
        self.mentionee_ids = mentionee_ids;
        self
    }

    pub fn is_draft(&self) -> bool {
        self.status == CardStatus::Drafted
    }

    pub fn is_closed(&self) -> bool {
        self.status == CardStatus::Closed
    }

    fn watch(&mut self, user_id: Uuid) {
        if !self.watcher_ids.contains(&user_id) {
            self.watcher_ids.push(user_id);
        }
    }
}

#[async_trait]
impl Eventable for Card {
    fn eventable_ref(&self) -> EventableRef {
        EventableRef::card(self.id)
    }

    fn account_id(&self) -> Uuid {
        self.account_id
    }

    fn board_id(&self) -> Uuid {
        self.board_id
    }

    fn should_track_event(&self) -> bool {
        !self.is_draft()
    }

    async fn on_event_created(
        &self,
        tx: &mut dyn Transaction,
        event: &Event,
        reactions: &Reactions<'_>,
    ) -> Result<()> {
        reactions.commenter.post(tx, event, self.id).await?;

        let mut card = self.clone();
        card.last_active_at = event.created_at;
        tx.save_card(&card).await
    }
}

fn ids_json(ids: &[Uuid]) -> serde_json::Value {
    json!(ids.iter().map(Uuid::to_string).collect::<Vec<_>>())
}

// ============================================================================
// Cards service
// ============================================================================

/// State transitions on cards, each in its own transaction
pub struct Cards {
    store: Arc<dyn EventStore>,
    tracker: Arc<EventTracker>,
}

impl Cards {
    pub fn new(store: Arc<dyn EventStore>, tracker: Arc<EventTracker>) -> Self {
        Self { store, tracker }
    }

    /// Create a draft card. Drafts are not tracked.
    #[instrument(skip(self, title))]
    pub async fn create_draft(
        &self,
        board_id: Uuid,
        creator_id: Uuid,
        title: &str,
    ) -> Result<Card> {
        let title = title.trim();
        if title.is_empty() {
            return Err(EventlineError::validation("card title can't be blank"));
        }

        let mut tx = self.store.begin().await?;
        let board = tx
            .find_board(board_id)
            .await?
            .ok_or_else(|| EventlineError::not_found("board", board_id))?;
        let creator = tx
            .find_user(creator_id)
            .await?
            .ok_or_else(|| EventlineError::not_found("user", creator_id))?;
        if creator.account_id != board.account_id {
            return Err(EventlineError::validation(
                "card creator belongs to another account",
            ));
        }

        let card = Card::draft(board.account_id, board.id, creator.id, title);
        tx.save_card(&card).await?;
        tx.commit().await?;
        Ok(card)
    }

    pub async fn publish(&self, card_id: Uuid, creator_id: Uuid) -> Result<Card> {
        self.transition(card_id, creator_id, "published", &[], |card| {
            if !card.is_draft() {
                return Err(EventlineError::validation("card is already published"));
            }
            card.status = CardStatus::Published;
            Ok(Some(Particulars::new()))
        })
        .await
    }

    pub async fn close(&self, card_id: Uuid, creator_id: Uuid) -> Result<Card> {
        self.transition(card_id, creator_id, "closed", &[], |card| {
            match card.status {
                CardStatus::Closed => return Err(EventlineError::validation("card is already closed")),
                CardStatus::Drafted => return Err(EventlineError::validation("can't close a draft")),
                _ => {}
            }
            card.status = CardStatus::Closed;
            Ok(Some(Particulars::new()))
        })
        .await
    }

    pub async fn reopen(&self, card_id: Uuid, creator_id: Uuid) -> Result<Card> {
        self.transition(card_id, creator_id, "reopened", &[], |card| {
            if !matches!(card.status, CardStatus::Closed | CardStatus::Postponed) {
                return Err(EventlineError::validation("card is not closed or postponed"));
            }
            card.status = CardStatus::Published;
            Ok(Some(Particulars::new()))
        })
        .await
    }

    pub async fn postpone(&self, card_id: Uuid, creator_id: Uuid) -> Result<Card> {
        self.transition(card_id, creator_id, "postponed", &[], |card| {
            match card.status {
                CardStatus::Postponed => {
                    return Err(EventlineError::validation("card is already postponed"))
                }
                CardStatus::Drafted => return Err(EventlineError::validation("can't postpone a draft")),
                _ => {}
            }
            card.status = CardStatus::Postponed;
            Ok(Some(Particulars::new()))
        })
        .await
    }

    /// Assign users; only users not already assigned are recorded
    pub async fn assign(
        &self,
        card_id: Uuid,
        creator_id: Uuid,
        assignee_ids: &[Uuid],
    ) -> Result<Card> {
        let requested = assignee_ids.to_vec();
        self.transition(card_id, creator_id, "assigned", assignee_ids, move |card| {
            let mut added: Vec<Uuid> = requested
                .iter()
                .copied()
                .filter(|id| !card.assignee_ids.contains(id))
                .collect();
            added.sort();
            added.dedup();
            if added.is_empty() {
                return Err(EventlineError::validation("users are already assigned"));
            }
            for id in &added {
                card.assignee_ids.push(*id);
                card.watch(*id);
            }
            Ok(Some(particulars_from([(
                particulars::ASSIGNEE_IDS,
                ids_json(&added),
            )])))
        })
        .await
    }

    pub async fn unassign(
        &self,
        card_id: Uuid,
        creator_id: Uuid,
        assignee_ids: &[Uuid],
    ) -> Result<Card> {
        let requested = assignee_ids.to_vec();
        self.transition(card_id, creator_id, "unassigned", &[], move |card| {
            let mut removed: Vec<Uuid> = requested
                .iter()
                .copied()
                .filter(|id| card.assignee_ids.contains(id))
                .collect();
            removed.sort();
            removed.dedup();
            if removed.is_empty() {
                return Err(EventlineError::validation("users are not assigned"));
            }
            card.assignee_ids.retain(|id| !removed.contains(id));
            Ok(Some(particulars_from([(
                particulars::ASSIGNEE_IDS,
                ids_json(&removed),
            )])))
        })
        .await
    }

    /// Change the title; renaming to the same title records nothing
    pub async fn rename(&self, card_id: Uuid, creator_id: Uuid, title: &str) -> Result<Card> {
        let new_title = title.trim().to_string();
        if new_title.is_empty() {
            return Err(EventlineError::validation("card title can't be blank"));
        }
        self.transition(card_id, creator_id, "title_changed", &[], move |card| {
            if card.title == new_title {
                return Ok(None);
            }
            let old_title = std::mem::replace(&mut card.title, new_title.clone());
            Ok(Some(particulars_from([
                (particulars::OLD_TITLE, json!(old_title)),
                (particulars::NEW_TITLE, json!(new_title)),
            ])))
        })
        .await
    }

    /// Move a card to another board of the same account
    #[instrument(skip(self))]
    pub async fn move_to_board(
        &self,
        card_id: Uuid,
        creator_id: Uuid,
        board_id: Uuid,
    ) -> Result<Card> {
        let mut tx = self.store.begin().await?;
        let mut card = load_card(tx.as_mut(), card_id).await?;
        if card.board_id == board_id {
            return Err(EventlineError::validation("card is already on that board"));
        }

        let old_board = tx
            .find_board(card.board_id)
            .await?
            .ok_or_else(|| EventlineError::not_found("board", card.board_id))?;
        let new_board = tx
            .find_board(board_id)
            .await?
            .ok_or_else(|| EventlineError::not_found("board", board_id))?;
        if new_board.account_id != card.account_id {
            return Err(EventlineError::validation("board belongs to another account"));
        }

        card.board_id = new_board.id;
        tx.save_card(&card).await?;

        let particulars = particulars_from([
            (particulars::OLD_BOARD, json!(old_board.name)),
            (particulars::NEW_BOARD, json!(new_board.name)),
        ]);
        self.tracker
            .track_event(tx.as_mut(), &card, "board_changed", particulars, creator_id, None)
            .await?;

        let card = load_card(tx.as_mut(), card_id).await?;
        tx.commit().await?;
        info!(card_id = %card.id, board_id = %card.board_id, "card moved");
        Ok(card)
    }

    /// Delete a card with its comments, events and fanout records
    #[instrument(skip(self))]
    pub async fn destroy(&self, card_id: Uuid) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if !tx.delete_card(card_id).await? {
            return Err(EventlineError::not_found("card", card_id));
        }
        tx.commit().await?;
        info!(card_id = %card_id, "card destroyed");
        Ok(())
    }

    /// Load, mutate, save and track in one transaction
    ///
    /// `apply` validates against the locked row and returns the particulars to
    /// record, or None when nothing changed. `members` must all be users of
    /// the card's account.
    #[instrument(skip(self, members, apply))]
    async fn transition<F>(
        &self,
        card_id: Uuid,
        creator_id: Uuid,
        verb: &str,
        members: &[Uuid],
        apply: F,
    ) -> Result<Card>
    where
        F: FnOnce(&mut Card) -> Result<Option<Particulars>> + Send,
    {
        let mut tx = self.store.begin().await?;
        let mut card = load_card(tx.as_mut(), card_id).await?;
        require_members(tx.as_mut(), card.account_id, members, "assignee").await?;

        let Some(particulars) = apply(&mut card)? else {
            tx.rollback().await?;
            return Ok(card);
        };
        tx.save_card(&card).await?;

        self.tracker
            .track_event(tx.as_mut(), &card, verb, particulars, creator_id, None)
            .await?;

        let card = load_card(tx.as_mut(), card_id).await?;
        tx.commit().await?;
        info!(card_id = %card.id, verb, "card updated");
        Ok(card)
    }
}

async fn load_card(tx: &mut dyn Transaction, card_id: Uuid) -> Result<Card> {
    tx.find_card_for_update(card_id)
        .await?
        .ok_or_else(|| EventlineError::not_found("card", card_id))
}
