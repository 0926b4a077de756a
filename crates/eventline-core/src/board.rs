// Board entity type
//
// A board is the collaboration scope of cards and events. Watchers receive
// notifications for board-level activity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub watcher_ids: Vec<Uuid>,
}

impl Board {
    pub fn new(account_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            name: name.into(),
            watcher_ids: Vec::new(),
        }
    }

    pub fn with_watchers(mut self, watcher_ids: Vec<Uuid>) -> Self {
        self.watcher_ids = watcher_ids;
        self
    }
}
