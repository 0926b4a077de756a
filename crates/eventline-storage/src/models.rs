// Database models (internal, converted into eventline-core types)

use chrono::{DateTime, Utc};
use eventline_core::{
    Board, Card, CardStatus, Comment, DelinquencyTracker, Delivery, DeliveryState, Event,
    EventableKind, EventableRef, EventlineError, FanoutKind, FanoutTask, Notification,
    Particulars, Result, User, UserRole, Webhook,
};
use sqlx::types::JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================
// Domain rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub role: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            account_id: row.account_id,
            name: row.name,
            role: UserRole::parse(&row.role),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BoardRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub watcher_ids: Vec<Uuid>,
}

impl From<BoardRow> for Board {
    fn from(row: BoardRow) -> Self {
        Board {
            id: row.id,
            account_id: row.account_id,
            name: row.name,
            watcher_ids: row.watcher_ids,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CardRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub board_id: Uuid,
    pub title: String,
    pub status: String,
    pub creator_id: Uuid,
    pub assignee_ids: Vec<Uuid>,
    pub watcher_ids: Vec<Uuid>,
    pub mentionee_ids: Vec<Uuid>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<CardRow> for Card {
    type Error = EventlineError;

    fn try_from(row: CardRow) -> Result<Self> {
        Ok(Card {
            id: row.id,
            account_id: row.account_id,
            board_id: row.board_id,
            title: row.title,
            status: CardStatus::parse(&row.status)?,
            creator_id: row.creator_id,
            assignee_ids: row.assignee_ids,
            watcher_ids: row.watcher_ids,
            mentionee_ids: row.mentionee_ids,
            last_active_at: row.last_active_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CommentRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub board_id: Uuid,
    pub card_id: Uuid,
    pub creator_id: Uuid,
    pub body: String,
    pub system: bool,
    pub mentionee_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Comment {
            id: row.id,
            account_id: row.account_id,
            board_id: row.board_id,
            card_id: row.card_id,
            creator_id: row.creator_id,
            body: row.body,
            system: row.system,
            mentionee_ids: row.mentionee_ids,
            created_at: row.created_at,
        }
    }
}

// ============================================
// Events
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub board_id: Uuid,
    pub creator_id: Uuid,
    pub eventable_type: String,
    pub eventable_id: Uuid,
    pub action: String,
    pub particulars: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = EventlineError;

    fn try_from(row: EventRow) -> Result<Self> {
        let kind: EventableKind = row.eventable_type.parse()?;
        let particulars = match row.particulars {
            JsonValue::Object(map) => map,
            _ => Particulars::new(),
        };
        Ok(Event {
            id: row.id,
            account_id: row.account_id,
            board_id: row.board_id,
            creator_id: row.creator_id,
            eventable: EventableRef {
                kind,
                id: row.eventable_id,
            },
            action: row.action,
            particulars,
            created_at: row.created_at,
        })
    }
}

/// Card title keyed by the eventable it summarizes
#[derive(Debug, Clone, FromRow)]
pub struct EventableTitleRow {
    pub eventable_id: Uuid,
    pub title: String,
}

// ============================================
// Fanout
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct NotificationRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_id: Uuid,
    pub creator_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Notification {
            id: row.id,
            user_id: row.user_id,
            event_id: row.event_id,
            creator_id: row.creator_id,
            created_at: row.created_at,
            read_at: row.read_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WebhookRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub board_id: Uuid,
    pub name: String,
    pub url: String,
    pub active: bool,
    pub subscribed_actions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<WebhookRow> for Webhook {
    fn from(row: WebhookRow) -> Self {
        Webhook {
            id: row.id,
            account_id: row.account_id,
            board_id: row.board_id,
            name: row.name,
            url: row.url,
            active: row.active,
            subscribed_actions: row.subscribed_actions.into_iter().collect(),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DeliveryRow {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event_id: Uuid,
    pub state: String,
    pub response_code: Option<i32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = EventlineError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        Ok(Delivery {
            id: row.id,
            webhook_id: row.webhook_id,
            event_id: row.event_id,
            state: DeliveryState::parse(&row.state)?,
            response_code: row.response_code.and_then(|code| u16::try_from(code).ok()),
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DelinquencyRow {
    pub webhook_id: Uuid,
    pub consecutive_failures: i32,
    pub first_failure_at: Option<DateTime<Utc>>,
}

impl From<DelinquencyRow> for DelinquencyTracker {
    fn from(row: DelinquencyRow) -> Self {
        DelinquencyTracker {
            webhook_id: row.webhook_id,
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            first_failure_at: row.first_failure_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ClaimedTaskRow {
    pub id: Uuid,
    pub kind: String,
    pub subject_id: Uuid,
    pub attempt: i32,
    pub max_attempts: i32,
    pub claimed_by: String,
}

impl TryFrom<ClaimedTaskRow> for FanoutTask {
    type Error = EventlineError;

    fn try_from(row: ClaimedTaskRow) -> Result<Self> {
        Ok(FanoutTask {
            id: row.id,
            kind: row.kind.parse::<FanoutKind>()?,
            subject_id: row.subject_id,
            attempt: row.attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            claimed_by: row.claimed_by,
        })
    }
}

/// Convert rows, failing on the first malformed one
pub fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = EventlineError>,
{
    rows.into_iter().map(T::try_from).collect()
}
