// Comment entity and service
//
// Member comments produce `comment_created` events. System comments are the
// audit trail written by the commenter and never produce events themselves.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{EventlineError, Result};
use crate::event::{Event, EventableRef, Particulars};
use crate::eventable::{Eventable, Reactions};
use crate::tracker::EventTracker;
use crate::traits::{EventStore, Transaction};
use crate::user::require_members;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub account_id: Uuid,
    pub board_id: Uuid,
    pub card_id: Uuid,
    pub creator_id: Uuid,
    pub body: String,
    /// Authored by the system user
    pub system: bool,
    #[serde(default)]
    pub mentionee_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(
        account_id: Uuid,
        board_id: Uuid,
        card_id: Uuid,
        creator_id: Uuid,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            board_id,
            card_id,
            creator_id,
            body: body.into(),
            system: false,
            mentionee_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn system(
        account_id: Uuid,
        board_id: Uuid,
        card_id: Uuid,
        author_id: Uuid,
        body: impl Into<String>,
    ) -> Self {
        Self {
            system: true,
            ..Self::new(account_id, board_id, card_id, author_id, body)
        }
    }

    pub fn with_mentionees(mut self, mentionee_ids: Vec<Uuid>) -> Self {
        self.mentionee_ids = mentionee_ids;
        self
    }
}

#[async_trait]
impl Eventable for Comment {
    fn eventable_ref(&self) -> EventableRef {
        EventableRef::comment(self.id)
    }

    fn account_id(&self) -> Uuid {
        self.account_id
    }

    fn board_id(&self) -> Uuid {
        self.board_id
    }

    fn should_track_event(&self) -> bool {
        !self.system
    }

    async fn on_event_created(
        &self,
        tx: &mut dyn Transaction,
        event: &Event,
        _reactions: &Reactions<'_>,
    ) -> Result<()> {
        let mut card = tx
            .find_card_for_update(self.card_id)
            .await?
            .ok_or_else(|| EventlineError::not_found("card", self.card_id))?;
        card.last_active_at = event.created_at;
        tx.save_card(&card).await
    }
}

// ============================================================================
// Comments service
// ============================================================================

pub struct Comments {
    store: Arc<dyn EventStore>,
    tracker: Arc<EventTracker>,
}

impl Comments {
    pub fn new(store: Arc<dyn EventStore>, tracker: Arc<EventTracker>) -> Self {
        Self { store, tracker }
    }

    /// Add a comment to a card and track `comment_created`
    #[instrument(skip(self, body, mentionee_ids))]
    pub async fn create(
        &self,
        card_id: Uuid,
        creator_id: Uuid,
        body: &str,
        mentionee_ids: Vec<Uuid>,
    ) -> Result<Comment> {
        let body = body.trim();
        if body.is_empty() {
            return Err(EventlineError::validation("comment body can't be blank"));
        }

        let mut tx = self.store.begin().await?;

        let card = tx
            .find_card_for_update(card_id)
            .await?
            .ok_or_else(|| EventlineError::not_found("card", card_id))?;
        let creator = tx
            .find_user(creator_id)
            .await?
            .ok_or_else(|| EventlineError::not_found("user", creator_id))?;
        if creator.account_id != card.account_id {
            return Err(EventlineError::validation(
                "comment creator belongs to another account",
            ));
        }
        require_members(tx.as_mut(), card.account_id, &mentionee_ids, "mentionee").await?;

        let mut comment = Comment::new(card.account_id, card.board_id, card.id, creator.id, body)
            .with_mentionees(mentionee_ids);
        comment.system = creator.is_system();
        tx.insert_comment(&comment).await?;

        self.tracker
            .track_event(
                tx.as_mut(),
                &comment,
                "created",
                Particulars::new(),
                creator.id,
                None,
            )
            .await?;

        tx.commit().await?;
        info!(comment_id = %comment.id, card_id = %card.id, "comment created");
        Ok(comment)
    }
}
