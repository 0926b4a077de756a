// Event tracker
//
// Records events inside the caller's transaction: gate, validate, insert,
// synchronous reaction, then the outbox rows for asynchronous fanout. The
// caller commits; nothing is scheduled unless it does.

use std::sync::Arc;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::commenter::SystemCommenter;
use crate::config::FanoutConfig;
use crate::error::{EventlineError, Result};
use crate::event::{Event, Particulars};
use crate::eventable::{Eventable, Reactions};
use crate::fanout::{FanoutKind, NewFanoutTask};
use crate::traits::Transaction;

pub struct EventTracker {
    commenter: Arc<SystemCommenter>,
    notify_attempts: u32,
    dispatch_attempts: u32,
}

impl Default for EventTracker {
    fn default() -> Self {
        Self::new(Arc::new(SystemCommenter::default()), &FanoutConfig::default())
    }
}

impl EventTracker {
    pub fn new(commenter: Arc<SystemCommenter>, config: &FanoutConfig) -> Self {
        Self {
            commenter,
            notify_attempts: config.retry_policy(FanoutKind::Notify).max_attempts,
            dispatch_attempts: config
                .retry_policy(FanoutKind::DispatchWebhooks)
                .max_attempts,
        }
    }

    pub fn commenter(&self) -> &SystemCommenter {
        &self.commenter
    }

    /// Track `{prefix}_{verb}` for an entity
    ///
    /// `board_id` defaults to the entity's board.
    pub async fn track_event(
        &self,
        tx: &mut dyn Transaction,
        entity: &dyn Eventable,
        verb: &str,
        particulars: Particulars,
        creator_id: Uuid,
        board_id: Option<Uuid>,
    ) -> Result<Option<Event>> {
        let action = format!("{}_{}", entity.event_action_prefix(), verb);
        let board_id = board_id.unwrap_or_else(|| entity.board_id());
        self.record_event(tx, entity, &action, creator_id, board_id, particulars)
            .await
    }

    /// Record an event with a fully assembled action
    ///
    /// Returns None without writing anything when the entity's gate is closed.
    #[instrument(skip(self, tx, entity, particulars), fields(eventable = ?entity.eventable_ref()))]
    pub async fn record_event(
        &self,
        tx: &mut dyn Transaction,
        entity: &dyn Eventable,
        action: &str,
        creator_id: Uuid,
        board_id: Uuid,
        particulars: Particulars,
    ) -> Result<Option<Event>> {
        if !entity.should_track_event() {
            debug!("event gate closed, not tracking");
            return Ok(None);
        }

        if action.trim().is_empty() || action.ends_with('_') {
            return Err(EventlineError::validation("event action can't be blank"));
        }

        let account_id = entity.account_id();

        let board = tx
            .find_board(board_id)
            .await?
            .ok_or_else(|| EventlineError::not_found("board", board_id))?;
        if board.account_id != account_id {
            return Err(EventlineError::validation(
                "event board belongs to another account",
            ));
        }

        let creator = tx
            .find_user(creator_id)
            .await?
            .ok_or_else(|| EventlineError::not_found("user", creator_id))?;
        if creator.account_id != account_id {
            return Err(EventlineError::validation(
                "event creator belongs to another account",
            ));
        }

        let event = Event::new(
            account_id,
            board.id,
            creator.id,
            entity.eventable_ref(),
            action,
            particulars,
        );
        tx.insert_event(&event).await?;

        let reactions = Reactions {
            commenter: &self.commenter,
        };
        entity
            .on_event_created(tx, &event, &reactions)
            .await
            .map_err(|e| {
                warn!(event_id = %event.id, error = %e, "event reaction failed");
                match e {
                    EventlineError::Reaction(_) => e,
                    other => EventlineError::reaction(other.to_string()),
                }
            })?;

        tx.enqueue_fanout(NewFanoutTask::notify(event.id).with_max_attempts(self.notify_attempts))
            .await?;
        tx.enqueue_fanout(
            NewFanoutTask::dispatch_webhooks(event.id).with_max_attempts(self.dispatch_attempts),
        )
        .await?;

        debug!(event_id = %event.id, action = %event.action, "event recorded");
        Ok(Some(event))
    }
}
