// Event listing and audience lookups (Postgres)

use std::collections::HashMap;

use async_trait::async_trait;
use eventline_core::{
    AudienceResolver, Board, Event, EventQuery, EventRecord, EventScope, EventStore,
    EventableKind, EventableRef, EventableSummary, Result, Transaction, User,
};
use uuid::Uuid;

use crate::models::{convert_all, BoardRow, EventRow, EventableTitleRow, UserRow};
use crate::repositories::{db_err, Database};
use crate::transaction::PgTransaction;

const EVENT_COLUMNS: &str = "id, account_id, board_id, creator_id, eventable_type, eventable_id, action, particulars, created_at";

#[async_trait]
impl EventStore for Database {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(PgTransaction::begin(self).await?))
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("find_event"))?;

        row.map(Event::try_from).transpose()
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        let (account_id, board_id, eventable) = match query.scope {
            EventScope::Account(id) => (Some(id), None, None),
            EventScope::Board(id) => (None, Some(id), None),
            EventScope::Eventable(eventable) => (None, None, Some(eventable)),
        };

        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE ($1::uuid IS NULL OR account_id = $1)
              AND ($2::uuid IS NULL OR board_id = $2)
              AND ($3::text IS NULL OR (eventable_type = $3 AND eventable_id = $4))
            ORDER BY created_at ASC, id DESC
            LIMIT $5
            "#
        ))
        .bind(account_id)
        .bind(board_id)
        .bind(eventable.map(|e| e.kind.as_str()))
        .bind(eventable.map(|e| e.id))
        .bind(query.limit.map(|limit| limit as i64))
        .fetch_all(self.pool())
        .await
        .map_err(db_err("list_events"))?;

        let events: Vec<Event> = convert_all(rows)?;
        let mut records: Vec<EventRecord> = events.into_iter().map(EventRecord::bare).collect();
        if records.is_empty() {
            return Ok(records);
        }

        if query.preload.creator {
            let ids: Vec<Uuid> = records.iter().map(|r| r.event.creator_id).collect();
            let users = self.users_by_id(&ids).await?;
            for record in &mut records {
                record.creator = users.get(&record.event.creator_id).cloned();
            }
        }

        if query.preload.board {
            let ids: Vec<Uuid> = records.iter().map(|r| r.event.board_id).collect();
            let boards = self.boards_by_id(&ids).await?;
            for record in &mut records {
                record.board = boards.get(&record.event.board_id).cloned();
            }
        }

        if query.preload.eventable {
            let refs: Vec<EventableRef> = records.iter().map(|r| r.event.eventable).collect();
            let titles = self.eventable_titles(&refs).await?;
            for record in &mut records {
                let eventable = record.event.eventable;
                record.eventable = titles
                    .get(&eventable)
                    .map(|title| EventableSummary {
                        eventable,
                        title: title.clone(),
                    });
            }
        }

        Ok(records)
    }
}

// ============================================
// Preload helpers
// ============================================

impl Database {
    async fn users_by_id(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, account_id, name, role FROM users WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await
        .map_err(db_err("preload_creators"))?;

        Ok(rows.into_iter().map(|r| (r.id, User::from(r))).collect())
    }

    async fn boards_by_id(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Board>> {
        let rows = sqlx::query_as::<_, BoardRow>(
            "SELECT id, account_id, name, watcher_ids FROM boards WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await
        .map_err(db_err("preload_boards"))?;

        Ok(rows.into_iter().map(|r| (r.id, Board::from(r))).collect())
    }

    /// Card titles for cards and for the parent cards of comments
    async fn eventable_titles(
        &self,
        refs: &[EventableRef],
    ) -> Result<HashMap<EventableRef, String>> {
        let card_ids: Vec<Uuid> = refs
            .iter()
            .filter(|r| r.kind == EventableKind::Card)
            .map(|r| r.id)
            .collect();
        let comment_ids: Vec<Uuid> = refs
            .iter()
            .filter(|r| r.kind == EventableKind::Comment)
            .map(|r| r.id)
            .collect();

        let mut titles = HashMap::new();

        if !card_ids.is_empty() {
            let rows = sqlx::query_as::<_, EventableTitleRow>(
                "SELECT id AS eventable_id, title FROM cards WHERE id = ANY($1)",
            )
            .bind(&card_ids)
            .fetch_all(self.pool())
            .await
            .map_err(db_err("preload_eventables"))?;
            for row in rows {
                titles.insert(EventableRef::card(row.eventable_id), row.title);
            }
        }

        if !comment_ids.is_empty() {
            let rows = sqlx::query_as::<_, EventableTitleRow>(
                r#"
                SELECT comments.id AS eventable_id, cards.title
                FROM comments
                JOIN cards ON cards.id = comments.card_id
                WHERE comments.id = ANY($1)
                "#,
            )
            .bind(&comment_ids)
            .fetch_all(self.pool())
            .await
            .map_err(db_err("preload_eventables"))?;
            for row in rows {
                titles.insert(EventableRef::comment(row.eventable_id), row.title);
            }
        }

        Ok(titles)
    }

    async fn card_id_array(&self, card_id: Uuid, column: &'static str) -> Result<Vec<Uuid>> {
        let ids: Option<Vec<Uuid>> =
            sqlx::query_scalar(&format!("SELECT {column} FROM cards WHERE id = $1"))
                .bind(card_id)
                .fetch_optional(self.pool())
                .await
                .map_err(db_err("card_audience"))?;

        Ok(ids.unwrap_or_default())
    }
}

// ============================================
// AudienceResolver
// ============================================

#[async_trait]
impl AudienceResolver for Database {
    async fn board_watchers(&self, board_id: Uuid) -> Result<Vec<Uuid>> {
        let ids: Option<Vec<Uuid>> =
            sqlx::query_scalar("SELECT watcher_ids FROM boards WHERE id = $1")
                .bind(board_id)
                .fetch_optional(self.pool())
                .await
                .map_err(db_err("board_watchers"))?;

        Ok(ids.unwrap_or_default())
    }

    async fn card_watchers(&self, card_id: Uuid) -> Result<Vec<Uuid>> {
        self.card_id_array(card_id, "watcher_ids").await
    }

    async fn card_assignees(&self, card_id: Uuid) -> Result<Vec<Uuid>> {
        self.card_id_array(card_id, "assignee_ids").await
    }

    async fn mentionees(&self, eventable: EventableRef) -> Result<Vec<Uuid>> {
        match eventable.kind {
            EventableKind::Card => self.card_id_array(eventable.id, "mentionee_ids").await,
            EventableKind::Comment => {
                let ids: Option<Vec<Uuid>> =
                    sqlx::query_scalar("SELECT mentionee_ids FROM comments WHERE id = $1")
                        .bind(eventable.id)
                        .fetch_optional(self.pool())
                        .await
                        .map_err(db_err("mentionees"))?;
                Ok(ids.unwrap_or_default())
            }
        }
    }

    async fn comment_card_id(&self, comment_id: Uuid) -> Result<Option<Uuid>> {
        sqlx::query_scalar("SELECT card_id FROM comments WHERE id = $1")
            .bind(comment_id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err("comment_card_id"))
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, account_id, name, role FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("find_user"))?;

        Ok(row.map(User::from))
    }

    async fn find_users(&self, ids: &[Uuid]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.users_by_id(ids).await?.into_values().collect())
    }

    async fn find_board(&self, id: Uuid) -> Result<Option<Board>> {
        let row = sqlx::query_as::<_, BoardRow>(
            "SELECT id, account_id, name, watcher_ids FROM boards WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("find_board"))?;

        Ok(row.map(Board::from))
    }
}
