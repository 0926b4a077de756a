// Personalized event descriptions for activity feeds
//
// Unlike system comments these are rendered at read time for a specific
// viewer, so the viewer reads "you" instead of their own name.

use uuid::Uuid;

use crate::commenter::{to_sentence, Names};
use crate::event::{particulars, Event, EventableKind};

/// Read-side context for describing one event
#[derive(Debug, Clone, Copy)]
pub struct DescriptionContext<'a> {
    pub names: &'a Names,
    /// Title of the card the event is about, if loaded
    pub title: Option<&'a str>,
}

impl<'a> DescriptionContext<'a> {
    pub fn new(names: &'a Names, title: Option<&'a str>) -> Self {
        Self { names, title }
    }
}

/// Describe an event from `viewer_id`'s point of view
pub fn describe(event: &Event, viewer_id: Uuid, context: &DescriptionContext<'_>) -> String {
    let creator = if event.creator_id == viewer_id {
        "You".to_string()
    } else {
        context.names.user(event.creator_id).to_string()
    };
    let entity = entity_label(event, context.title);

    match (event.eventable.kind, event.verb()) {
        (EventableKind::Card, "published") => format!("{creator} added {entity}"),
        (EventableKind::Card, "assigned") => format!(
            "{creator} assigned {} to {entity}",
            subjects(event, viewer_id, context.names)
        ),
        (EventableKind::Card, "unassigned") => format!(
            "{creator} unassigned {} from {entity}",
            subjects(event, viewer_id, context.names)
        ),
        (EventableKind::Card, "closed") => format!("{creator} moved {entity} to Done"),
        (EventableKind::Card, "reopened") => format!("{creator} reopened {entity}"),
        (EventableKind::Card, "postponed") => format!("{creator} moved {entity} to Not Now"),
        (EventableKind::Card, "title_changed") => match (
            event.particular_str(particulars::OLD_TITLE),
            event.particular_str(particulars::NEW_TITLE),
        ) {
            (Some(old), Some(new)) => format!("{creator} renamed \"{old}\" to \"{new}\""),
            _ => format!("{creator} renamed {entity}"),
        },
        (EventableKind::Card, "board_changed") => {
            match event.particular_str(particulars::NEW_BOARD) {
                Some(board) => format!("{creator} moved {entity} to {board}"),
                None => format!("{creator} moved {entity}"),
            }
        }
        (EventableKind::Comment, "created") => format!("{creator} commented on {entity}"),
        _ => format!("{creator} updated {entity}"),
    }
}

fn entity_label(event: &Event, title: Option<&str>) -> String {
    match title {
        Some(title) => format!("\"{title}\""),
        None => match event.eventable.kind {
            EventableKind::Card => "a card".to_string(),
            EventableKind::Comment => "a comment".to_string(),
        },
    }
}

/// Assignees with the viewer shown as "you"
fn subjects(event: &Event, viewer_id: Uuid, names: &Names) -> String {
    let words: Vec<&str> = event
        .assignee_ids()
        .into_iter()
        .map(|id| if id == viewer_id { "you" } else { names.user(id) })
        .collect();
    if words.is_empty() {
        "nobody".to_string()
    } else {
        to_sentence(&words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{actions, particulars_from, EventableRef, Particulars};
    use crate::user::User;
    use serde_json::json;

    struct Fixture {
        ada: User,
        bo: User,
        names: Names,
    }

    fn fixture() -> Fixture {
        let account_id = Uuid::now_v7();
        let ada = User::member(account_id, "Ada");
        let bo = User::member(account_id, "Bo");
        let names = Names::from_users([&ada, &bo]);
        Fixture { ada, bo, names }
    }

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
    fn test_viewer_is_creator() {
        let f = fixture();
        let event = card_event(&f.ada, actions::CARD_CLOSED, Particulars::new());
        let context = DescriptionContext::new(&f.names, Some("Launch"));

        assert_eq!(describe(&event, f.ada.id, &context), "You moved \"Launch\" to Done");
        assert_eq!(describe(&event, f.bo.id, &context), "Ada moved \"Launch\" to Done");
    }

    #[test]
    fn test_viewer_is_assignee() {
        let f = fixture();
        let event = card_event(
            &f.ada,
            actions::CARD_ASSIGNED,
            particulars_from([(particulars::ASSIGNEE_IDS, json!([f.bo.id.to_string()]))]),
        );
        let context = DescriptionContext::new(&f.names, Some("Launch"));

        assert_eq!(
            describe(&event, f.bo.id, &context),
            "Ada assigned you to \"Launch\""
        );
    }

    #[test]
    fn test_unknown_action_falls_back() {
        let f = fixture();
        let event = card_event(&f.ada, "card_archived", Particulars::new());
        let context = DescriptionContext::new(&f.names, None);

        assert_eq!(describe(&event, f.bo.id, &context), "Ada updated a card");
    }

    #[test]
    fn test_comment_created() {
        let f = fixture();
        let event = Event::new(
            f.ada.account_id,
            Uuid::now_v7(),
            f.bo.id,
            EventableRef::comment(Uuid::now_v7()),
            actions::COMMENT_CREATED,
            Particulars::new(),
        );
        let context = DescriptionContext::new(&f.names, Some("Launch"));

        assert_eq!(
            describe(&event, f.ada.id, &context),
            "Bo commented on \"Launch\""
        );
    }
}
