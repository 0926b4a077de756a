// Event entity type
//
// An Event is the immutable record of one significant state change on an
// eventable entity. It is written once inside the caller's transaction and
// never updated afterwards.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::board::Board;
use crate::error::{EventlineError, Result};
use crate::user::User;

/// Action-specific metadata attached to an event
pub type Particulars = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Action and particular names
// ============================================================================

pub mod actions {
    pub const CARD_PUBLISHED: &str = "card_published";
    pub const CARD_ASSIGNED: &str = "card_assigned";
    pub const CARD_UNASSIGNED: &str = "card_unassigned";
    pub const CARD_CLOSED: &str = "card_closed";
    pub const CARD_REOPENED: &str = "card_reopened";
    pub const CARD_POSTPONED: &str = "card_postponed";
    pub const CARD_TITLE_CHANGED: &str = "card_title_changed";
    pub const CARD_BOARD_CHANGED: &str = "card_board_changed";
    pub const COMMENT_CREATED: &str = "comment_created";
}

pub mod particulars {
    pub const ASSIGNEE_IDS: &str = "assignee_ids";
    pub const OLD_TITLE: &str = "old_title";
    pub const NEW_TITLE: &str = "new_title";
    pub const OLD_BOARD: &str = "old_board";
    pub const NEW_BOARD: &str = "new_board";
}

// ============================================================================
// Eventable reference
// ============================================================================

/// Kinds of entities that produce events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventableKind {
    Card,
    Comment,
}

impl EventableKind {
    pub const ALL: [EventableKind; 2] = [EventableKind::Card, EventableKind::Comment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Comment => "comment",
        }
    }

    /// Prefix used to namespace actions of this kind (`card` in `card_closed`)
    pub fn action_prefix(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for EventableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventableKind {
    type Err = EventlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "card" => Ok(Self::Card),
            "comment" => Ok(Self::Comment),
            other => Err(EventlineError::validation(format!(
                "unknown eventable kind: {other}"
            ))),
        }
    }
}

/// Typed polymorphic reference to the entity that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventableRef {
    #[serde(rename = "type")]
    pub kind: EventableKind,
    pub id: Uuid,
}

impl EventableRef {
    pub fn card(id: Uuid) -> Self {
        Self {
            kind: EventableKind::Card,
            id,
        }
    }

    pub fn comment(id: Uuid) -> Self {
        Self {
            kind: EventableKind::Comment,
            id,
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// Immutable record of a state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub account_id: Uuid,
    pub board_id: Uuid,
    pub creator_id: Uuid,
    pub eventable: EventableRef,
    pub action: String,
    #[serde(default)]
    pub particulars: Particulars,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Build a new event with a fresh time-ordered id
    pub fn new(
        account_id: Uuid,
        board_id: Uuid,
        creator_id: Uuid,
        eventable: EventableRef,
        action: impl Into<String>,
        particulars: Particulars,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            board_id,
            creator_id,
            eventable,
            action: action.into(),
            particulars,
            created_at: Utc::now(),
        }
    }

    /// The verb part of the action (`closed` for `card_closed`)
    pub fn verb(&self) -> &str {
        let prefix = self.eventable.kind.action_prefix();
        self.action
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_'))
            .unwrap_or(&self.action)
    }

    /// Read a list of ids from the particulars, skipping malformed entries
    pub fn particular_ids(&self, key: &str) -> Vec<Uuid> {
        self.particulars
            .get(key)
            .and_then(|value| value.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .filter_map(|s| Uuid::parse_str(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Read a string from the particulars
    pub fn particular_str(&self, key: &str) -> Option<&str> {
        self.particulars.get(key).and_then(|value| value.as_str())
    }

    /// Assignee ids carried by assignment actions
    pub fn assignee_ids(&self) -> Vec<Uuid> {
        self.particular_ids(particulars::ASSIGNEE_IDS)
    }
}

/// Build particulars from key/value pairs
pub fn particulars_from<I, K>(pairs: I) -> Particulars
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Sort events chronologically: `created_at` ascending, ties by id descending
pub fn sort_chronologically(events: &mut [Event]) {
    events.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

// ============================================================================
// Query surface
// ============================================================================

/// Scope of an event listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    Account(Uuid),
    Board(Uuid),
    Eventable(EventableRef),
}

/// Which related records to load alongside each event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Preload {
    pub creator: bool,
    pub board: bool,
    pub eventable: bool,
}

impl Preload {
    pub fn all() -> Self {
        Self {
            creator: true,
            board: true,
            eventable: true,
        }
    }
}

/// Chronological event listing request
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub scope: EventScope,
    pub preload: Preload,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new(scope: EventScope) -> Self {
        Self {
            scope,
            preload: Preload::default(),
            limit: None,
        }
    }

    pub fn for_board(board_id: Uuid) -> Self {
        Self::new(EventScope::Board(board_id))
    }

    pub fn for_account(account_id: Uuid) -> Self {
        Self::new(EventScope::Account(account_id))
    }

    pub fn for_eventable(eventable: EventableRef) -> Self {
        Self::new(EventScope::Eventable(eventable))
    }

    pub fn with_preload(mut self, preload: Preload) -> Self {
        self.preload = preload;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self.scope {
            EventScope::Account(id) => event.account_id == id,
            EventScope::Board(id) => event.board_id == id,
            EventScope::Eventable(eventable) => event.eventable == eventable,
        }
    }
}

/// Display-oriented summary of an eventable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventableSummary {
    pub eventable: EventableRef,
    /// Card title; for comments, the title of the parent card
    pub title: String,
}

/// Event plus its preloaded relations
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event: Event,
    pub creator: Option<User>,
    pub board: Option<Board>,
    pub eventable: Option<EventableSummary>,
}

impl EventRecord {
    pub fn bare(event: Event) -> Self {
        Self {
            event,
            creator: None,
            board: None,
            eventable: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn event(action: &str, particulars: Particulars) -> Event {
        Event::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            EventableRef::card(Uuid::now_v7()),
            action,
            particulars,
        )
    }

    #[test]
    fn test_verb_strips_prefix() {
        assert_eq!(event("card_closed", Particulars::new()).verb(), "closed");
        assert_eq!(
            event("card_title_changed", Particulars::new()).verb(),
            "title_changed"
        );
    }

    #[test]
    fn test_particular_ids_skip_malformed() {
        let good = Uuid::now_v7();
        let e = event(
            "card_assigned",
            particulars_from([(
                particulars::ASSIGNEE_IDS,
                json!([good.to_string(), "not-a-uuid", 7]),
            )]),
        );
        assert_eq!(e.assignee_ids(), vec![good]);
    }

    #[test]
    fn test_serialization_shape() {
        let e = event("card_closed", Particulars::new());
        let json = serde_json::to_value(&e).unwrap();

        assert_eq!(json["action"], "card_closed");
        assert_eq!(json["eventable"]["type"], "card");
        assert!(json["particulars"].is_object());
    }

    #[test]
    fn test_sort_chronologically_breaks_ties_by_id_desc() {
        let mut first = event("card_published", Particulars::new());
        let mut second = event("card_closed", Particulars::new());
        let mut third = event("card_reopened", Particulars::new());

        let now = Utc::now();
        first.created_at = now - Duration::seconds(10);
        second.created_at = now;
        third.created_at = now;

        let mut events = vec![third.clone(), second.clone(), first.clone()];
        sort_chronologically(&mut events);

        assert_eq!(events[0].id, first.id);
        // second and third share a timestamp; larger id first
        assert!(events[1].id > events[2].id);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in EventableKind::ALL {
            assert_eq!(kind.as_str().parse::<EventableKind>().unwrap(), kind);
        }
        assert!("board".parse::<EventableKind>().is_err());
    }
}
