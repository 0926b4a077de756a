// Notification entity type
//
// One notification per (event, recipient). The pair is the natural key that
// makes notification fanout safe to re-run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_id: Uuid,
    pub creator_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

/// Input for creating a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub event_id: Uuid,
    pub creator_id: Uuid,
}

impl NewNotification {
    pub fn into_notification(self) -> Notification {
        Notification {
            id: Uuid::now_v7(),
            user_id: self.user_id,
            event_id: self.event_id,
            creator_id: self.creator_id,
            created_at: Utc::now(),
            read_at: None,
        }
    }
}
