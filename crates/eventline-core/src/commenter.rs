// System commenter
//
// Renders audit-trail narratives for events and posts them as comments
// authored by the account's system user.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::comment::Comment;
use crate::error::Result;
use crate::event::{actions, particulars, Event};
use crate::traits::Transaction;
use crate::user::User;

/// Display names used while rendering
#[derive(Debug, Clone, Default)]
pub struct Names {
    users: HashMap<Uuid, String>,
}

impl Names {
    pub const UNKNOWN: &'static str = "Someone";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_users<'a>(users: impl IntoIterator<Item = &'a User>) -> Self {
        let mut names = Self::new();
        for user in users {
            names.insert(user.id, user.name.clone());
        }
        names
    }

    pub fn insert(&mut self, id: Uuid, name: impl Into<String>) {
        self.users.insert(id, name.into());
    }

    pub fn user(&self, id: Uuid) -> &str {
        self.users.get(&id).map(String::as_str).unwrap_or(Self::UNKNOWN)
    }

    pub fn users(&self, ids: &[Uuid]) -> Vec<&str> {
        ids.iter().map(|id| self.user(*id)).collect()
    }
}

/// Join words as an English list: "A", "A and B", "A, B, and C"
pub fn to_sentence<S: AsRef<str>>(words: &[S]) -> String {
    match words {
        [] => String::new(),
        [one] => one.as_ref().to_string(),
        [first, second] => format!("{} and {}", first.as_ref(), second.as_ref()),
        [init @ .., last] => {
            let head: Vec<&str> = init.iter().map(AsRef::as_ref).collect();
            format!("{}, and {}", head.join(", "), last.as_ref())
        }
    }
}

/// Narrative renderer for one action
pub type Renderer = fn(&Event, &Names) -> Option<String>;

/// Registry of `action -> renderer`
#[derive(Debug, Clone)]
pub struct SystemCommenter {
    renderers: HashMap<String, Renderer>,
}

impl Default for SystemCommenter {
    fn default() -> Self {
        let mut commenter = Self::empty();
        commenter.register(actions::CARD_ASSIGNED, render_assigned);
        commenter.register(actions::CARD_UNASSIGNED, render_unassigned);
        commenter.register(actions::CARD_CLOSED, |event, names| {
            Some(format!("{} moved this to Done.", names.user(event.creator_id)))
        });
        commenter.register(actions::CARD_REOPENED, |event, names| {
            Some(format!("{} reopened this.", names.user(event.creator_id)))
        });
        commenter.register(actions::CARD_POSTPONED, |event, names| {
            Some(format!("{} moved this to Not Now.", names.user(event.creator_id)))
        });
        commenter.register(actions::CARD_TITLE_CHANGED, render_title_changed);
        commenter.register(actions::CARD_BOARD_CHANGED, render_board_changed);
        commenter
    }
}

impl SystemCommenter {
    /// A commenter with no narratives
    pub fn empty() -> Self {
        Self {
            renderers: HashMap::new(),
        }
    }

    pub fn register(&mut self, action: impl Into<String>, renderer: Renderer) {
        self.renderers.insert(action.into(), renderer);
    }

    pub fn handles(&self, action: &str) -> bool {
        self.renderers.contains_key(action)
    }

    /// Narrative for the event, or None when the action has none
    pub fn render(&self, event: &Event, names: &Names) -> Option<String> {
        self.renderers
            .get(&event.action)
            .and_then(|render| render(event, names))
    }

    /// Users whose names a narrative may mention
    pub fn referenced_user_ids(event: &Event) -> Vec<Uuid> {
        let mut ids = vec![event.creator_id];
        ids.extend(event.assignee_ids());
        ids.sort();
        ids.dedup();
        ids
    }

    /// Build the system comment for an event on `card_id`
    pub fn comment_for(
        &self,
        event: &Event,
        card_id: Uuid,
        names: &Names,
        author: &User,
    ) -> Option<Comment> {
        let body = self.render(event, names)?;
        let mut comment = Comment::system(event.account_id, event.board_id, card_id, author.id, body);
        comment.created_at = event.created_at;
        Some(comment)
    }

    /// Render and store the system comment inside the event's transaction
    pub async fn post(
        &self,
        tx: &mut dyn Transaction,
        event: &Event,
        card_id: Uuid,
    ) -> Result<Option<Comment>> {
        if !self.handles(&event.action) {
            return Ok(None);
        }

        let users = tx.find_users(&Self::referenced_user_ids(event)).await?;
        let names = Names::from_users(&users);
        let author = tx.system_user(event.account_id).await?;

        let Some(comment) = self.comment_for(event, card_id, &names, &author) else {
            return Ok(None);
        };
        tx.insert_comment(&comment).await?;

        debug!(event_id = %event.id, comment_id = %comment.id, "posted system comment");
        Ok(Some(comment))
    }
}

fn render_assigned(event: &Event, names: &Names) -> Option<String> {
    let assignees = event.assignee_ids();
    if assignees.is_empty() {
        return None;
    }
    Some(format!(
        "{} assigned this to {}.",
        names.user(event.creator_id),
        to_sentence(&names.users(&assignees))
    ))
}

fn render_unassigned(event: &Event, names: &Names) -> Option<String> {
    let assignees = event.assignee_ids();
    if assignees.is_empty() {
        return None;
    }
    Some(format!(
        "{} unassigned {}.",
        names.user(event.creator_id),
        to_sentence(&names.users(&assignees))
    ))
}

fn render_title_changed(event: &Event, names: &Names) -> Option<String> {
    let old = event.particular_str(particulars::OLD_TITLE)?;
    let new = event.particular_str(particulars::NEW_TITLE)?;
    Some(format!(
        "{} changed the title from \"{old}\" to \"{new}\".",
        names.user(event.creator_id)
    ))
}

fn render_board_changed(event: &Event, names: &Names) -> Option<String> {
    let old = event.particular_str(particulars::OLD_BOARD)?;
    let new = event.particular_str(particulars::NEW_BOARD)?;
    Some(format!(
        "{} moved this from {old} to {new}.",
        names.user(event.creator_id)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{particulars_from, EventableRef, Particulars};
    use serde_json::json;

    fn card_event(creator: &User, action: &str, particulars: Particulars) -> Event {
        Event::new(
            creator.account_id,
            Uuid::now_v7(),
            creator.id,
            EventableRef::card(Uuid::now_v7()),
            action,
            particulars,
        )
    }

    #[test]
    fn test_to_sentence() {
        assert_eq!(to_sentence::<&str>(&[]), "");
        assert_eq!(to_sentence(&["Ada"]), "Ada");
        assert_eq!(to_sentence(&["Ada", "Bo"]), "Ada and Bo");
        assert_eq!(to_sentence(&["Ada", "Bo", "Cy"]), "Ada, Bo, and Cy");
    }

    #[test]
    fn test_renders_closed() {
        let u1 = User::member(Uuid::now_v7(), "U1");
        let event = card_event(&u1, actions::CARD_CLOSED, Particulars::new());

        let text = SystemCommenter::default().render(&event, &Names::from_users([&u1]));
        assert_eq!(text.as_deref(), Some("U1 moved this to Done."));
    }

    #[test]
    fn test_renders_assignees() {
        let account_id = Uuid::now_v7();
        let ada = User::member(account_id, "Ada");
        let bo = User::member(account_id, "Bo");
        let event = card_event(
            &ada,
            actions::CARD_ASSIGNED,
            particulars_from([(particulars::ASSIGNEE_IDS, json!([bo.id.to_string()]))]),
        );

        let text = SystemCommenter::default().render(&event, &Names::from_users([&ada, &bo]));
        assert_eq!(text.as_deref(), Some("Ada assigned this to Bo."));
    }

    #[test]
    fn test_renders_title_change() {
        let ada = User::member(Uuid::now_v7(), "Ada");
        let event = card_event(
            &ada,
            actions::CARD_TITLE_CHANGED,
            particulars_from([
                (particulars::OLD_TITLE, json!("Draft")),
                (particulars::NEW_TITLE, json!("Launch")),
            ]),
        );

        let text = SystemCommenter::default().render(&event, &Names::from_users([&ada]));
        assert_eq!(
            text.as_deref(),
            Some("Ada changed the title from \"Draft\" to \"Launch\".")
        );
    }

    #[test]
    fn test_unknown_action_renders_nothing() {
        let ada = User::member(Uuid::now_v7(), "Ada");
        let event = card_event(&ada, actions::CARD_PUBLISHED, Particulars::new());

        assert!(SystemCommenter::default().render(&event, &Names::new()).is_none());
    }

    #[test]
    fn test_missing_name_falls_back() {
        let ada = User::member(Uuid::now_v7(), "Ada");
        let event = card_event(&ada, actions::CARD_REOPENED, Particulars::new());

        let text = SystemCommenter::default().render(&event, &Names::new());
        assert_eq!(text.as_deref(), Some("Someone reopened this."));
    }

    #[test]
    fn test_comment_uses_event_timestamp() {
        let ada = User::member(Uuid::now_v7(), "Ada");
        let system = User::system(ada.account_id);
        let mut event = card_event(&ada, actions::CARD_CLOSED, Particulars::new());
        event.created_at -= chrono::Duration::days(3);

        let comment = SystemCommenter::default()
            .comment_for(&event, event.eventable.id, &Names::from_users([&ada]), &system)
            .unwrap();

        assert_eq!(comment.created_at, event.created_at);
        assert_eq!(comment.creator_id, system.id);
        assert!(comment.system);
    }
}
