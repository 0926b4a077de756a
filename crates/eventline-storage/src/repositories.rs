// Database handle and administrative queries
//
// Store trait implementations live in their own modules and share the pool
// held here.

use anyhow::Result;
use eventline_core::{Board, Comment, EventlineError, User};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::{CommentRow, UserRow};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    // ============================================
    // Users and boards
    // ============================================

    pub async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, account_id, name, role)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user.id)
        .bind(user.account_id)
        .bind(&user.name)
        .bind(user.role.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_users(&self, account_id: Uuid) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, account_id, name, role
            FROM users
            WHERE account_id = $1
            ORDER BY name
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(User::from).collect())
    }

    pub async fn create_board(&self, board: &Board) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO boards (id, account_id, name, watcher_ids)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(board.id)
        .bind(board.account_id)
        .bind(&board.name)
        .bind(&board.watcher_ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Add a watcher to a board; watching twice is a no-op
    pub async fn watch_board(&self, board_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE boards
            SET watcher_ids = array_append(watcher_ids, $2)
            WHERE id = $1 AND NOT ($2 = ANY(watcher_ids))
            "#,
        )
        .bind(board_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Comments on a card, oldest first
    pub async fn comments_for_card(&self, card_id: Uuid) -> Result<Vec<Comment>> {
        let rows = sqlx::query_as::<_, CommentRow>(
            r#"
            SELECT id, account_id, board_id, card_id, creator_id, body, system, mentionee_ids, created_at
            FROM comments
            WHERE card_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(card_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Comment::from).collect())
    }
}

/// Map a sqlx error into a store error, logging the failed operation
pub(crate) fn db_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> EventlineError {
    move |e| {
        error!(operation, error = %e, "database operation failed");
        EventlineError::store(format!("{operation}: {e}"))
    }
}
