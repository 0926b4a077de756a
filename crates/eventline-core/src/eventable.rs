// Eventable capability
//
// Domain entities that produce events implement `Eventable`. The tracker
// consults the gate, records the event, then lets the entity react inside
// the same transaction.

use async_trait::async_trait;
use uuid::Uuid;

use crate::commenter::SystemCommenter;
use crate::error::Result;
use crate::event::{Event, EventableRef};
use crate::traits::Transaction;

/// Collaborators available to an entity reacting to its own event
pub struct Reactions<'a> {
    pub commenter: &'a SystemCommenter,
}

#[async_trait]
pub trait Eventable: Send + Sync {
    fn eventable_ref(&self) -> EventableRef;

    fn account_id(&self) -> Uuid;

    fn board_id(&self) -> Uuid;

    /// Namespace for this entity's actions
    fn event_action_prefix(&self) -> &'static str {
        self.eventable_ref().kind.action_prefix()
    }

    /// Returning false turns `track_event` into a no-op
    fn should_track_event(&self) -> bool {
        true
    }

    /// Runs once per event, inside the transaction that created it. An error
    /// rolls back the event and the caller's state change.
    async fn on_event_created(
        &self,
        _tx: &mut dyn Transaction,
        _event: &Event,
        _reactions: &Reactions<'_>,
    ) -> Result<()> {
        Ok(())
    }
}
