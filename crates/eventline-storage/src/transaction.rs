// Postgres unit of work
//
// Wraps a sqlx transaction. Events, entity changes and outbox rows written
// here become visible together on commit.

use async_trait::async_trait;
use eventline_core::{
    Board, Card, Comment, Event, EventlineError, NewFanoutTask, Result, Transaction, User,
};
use sqlx::types::Json;
use sqlx::Postgres;
use tracing::debug;
use uuid::Uuid;

use crate::models::{BoardRow, CardRow, CommentRow, UserRow};
use crate::repositories::{db_err, Database};

pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    pub async fn begin(db: &Database) -> Result<Self> {
        let tx = db.pool().begin().await.map_err(db_err("begin"))?;
        Ok(Self { tx })
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn insert_event(&mut self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, account_id, board_id, creator_id, eventable_type, eventable_id, action, particulars, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.account_id)
        .bind(event.board_id)
        .bind(event.creator_id)
        .bind(event.eventable.kind.as_str())
        .bind(event.eventable.id)
        .bind(&event.action)
        .bind(Json(&event.particulars))
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("insert_event"))?;

        Ok(())
    }

    async fn enqueue_fanout(&mut self, task: NewFanoutTask) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fanout_tasks (id, kind, subject_id, max_attempts)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, subject_id) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(task.kind.as_str())
        .bind(task.subject_id)
        .bind(task.max_attempts as i32)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("enqueue_fanout"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_user(&mut self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, account_id, name, role FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("find_user"))?;

        Ok(row.map(User::from))
    }

    async fn find_users(&mut self, ids: &[Uuid]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, account_id, name, role FROM users WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err("find_users"))?;

        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn find_board(&mut self, id: Uuid) -> Result<Option<Board>> {
        let row = sqlx::query_as::<_, BoardRow>(
            "SELECT id, account_id, name, watcher_ids FROM boards WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("find_board"))?;

        Ok(row.map(Board::from))
    }

    async fn system_user(&mut self, account_id: Uuid) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, account_id, name, role
            FROM users
            WHERE account_id = $1 AND role = 'system'
            "#,
        )
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("system_user"))?;

        row.map(User::from)
            .ok_or_else(|| EventlineError::not_found("system user", account_id))
    }

    async fn find_card_for_update(&mut self, id: Uuid) -> Result<Option<Card>> {
        let row = sqlx::query_as::<_, CardRow>(
            r#"
            SELECT id, account_id, board_id, title, status, creator_id, assignee_ids,
                   watcher_ids, mentionee_ids, last_active_at, created_at
            FROM cards
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("find_card_for_update"))?;

        row.map(Card::try_from).transpose()
    }

    async fn save_card(&mut self, card: &Card) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cards (id, account_id, board_id, title, status, creator_id, assignee_ids,
                               watcher_ids, mentionee_ids, last_active_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                board_id = EXCLUDED.board_id,
                title = EXCLUDED.title,
                status = EXCLUDED.status,
                assignee_ids = EXCLUDED.assignee_ids,
                watcher_ids = EXCLUDED.watcher_ids,
                mentionee_ids = EXCLUDED.mentionee_ids,
                last_active_at = EXCLUDED.last_active_at
            "#,
        )
        .bind(card.id)
        .bind(card.account_id)
        .bind(card.board_id)
        .bind(&card.title)
        .bind(card.status.as_str())
        .bind(card.creator_id)
        .bind(&card.assignee_ids)
        .bind(&card.watcher_ids)
        .bind(&card.mentionee_ids)
        .bind(card.last_active_at)
        .bind(card.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("save_card"))?;

        Ok(())
    }

    async fn insert_comment(&mut self, comment: &Comment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO comments (id, account_id, board_id, card_id, creator_id, body, system, mentionee_ids, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(comment.id)
        .bind(comment.account_id)
        .bind(comment.board_id)
        .bind(comment.card_id)
        .bind(comment.creator_id)
        .bind(&comment.body)
        .bind(comment.system)
        .bind(&comment.mentionee_ids)
        .bind(comment.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("insert_comment"))?;

        Ok(())
    }

    async fn find_comment(&mut self, id: Uuid) -> Result<Option<Comment>> {
        let row = sqlx::query_as::<_, CommentRow>(
            r#"
            SELECT id, account_id, board_id, card_id, creator_id, body, system, mentionee_ids, created_at
            FROM comments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("find_comment"))?;

        Ok(row.map(Comment::from))
    }

    async fn delete_card(&mut self, id: Uuid) -> Result<bool> {
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM cards WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(db_err("delete_card"))?;
        if locked.is_none() {
            return Ok(false);
        }

        // Events of the card and of its comments
        let event_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM events
            WHERE (eventable_type = 'card' AND eventable_id = $1)
               OR (eventable_type = 'comment'
                   AND eventable_id IN (SELECT id FROM comments WHERE card_id = $1))
            "#,
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err("delete_card"))?;

        let delivery_ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM webhook_deliveries WHERE event_id = ANY($1)")
                .bind(&event_ids)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(db_err("delete_card"))?;

        let subjects: Vec<Uuid> = event_ids.iter().chain(delivery_ids.iter()).copied().collect();
        sqlx::query("DELETE FROM fanout_tasks WHERE subject_id = ANY($1)")
            .bind(&subjects)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("delete_card"))?;

        // Notifications and deliveries cascade from events
        sqlx::query("DELETE FROM events WHERE id = ANY($1)")
            .bind(&event_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("delete_card"))?;

        // Comments cascade from the card
        sqlx::query("DELETE FROM cards WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("delete_card"))?;

        debug!(card_id = %id, events = event_ids.len(), "deleted card");
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(db_err("commit"))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(db_err("rollback"))
    }
}
