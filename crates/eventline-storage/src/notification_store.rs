// Notification persistence (Postgres)

use async_trait::async_trait;
use eventline_core::{
    EventlineError, NewNotification, Notification, NotificationStore, Result,
};
use uuid::Uuid;

use crate::models::NotificationRow;
use crate::repositories::{db_err, Database};

const NOTIFICATION_COLUMNS: &str = "id, user_id, event_id, creator_id, created_at, read_at";

#[async_trait]
impl NotificationStore for Database {
    async fn ensure_notification(&self, notification: NewNotification) -> Result<Notification> {
        let inserted = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            INSERT INTO notifications (id, user_id, event_id, creator_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id, user_id) DO NOTHING
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(notification.user_id)
        .bind(notification.event_id)
        .bind(notification.creator_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("ensure_notification"))?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        // Already notified on an earlier run
        let existing = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE event_id = $1 AND user_id = $2"
        ))
        .bind(notification.event_id)
        .bind(notification.user_id)
        .fetch_one(self.pool())
        .await
        .map_err(db_err("ensure_notification"))?;

        Ok(existing.into())
    }

    async fn notifications_for_event(&self, event_id: Uuid) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE event_id = $1 ORDER BY user_id"
        ))
        .bind(event_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err("notifications_for_event"))?;

        Ok(rows.into_iter().map(Notification::from).collect())
    }

    async fn notifications_for_user(&self, user_id: Uuid) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            "#
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err("notifications_for_user"))?;

        Ok(rows.into_iter().map(Notification::from).collect())
    }

    async fn mark_read(&self, notification_id: Uuid) -> Result<Notification> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            UPDATE notifications
            SET read_at = COALESCE(read_at, NOW())
            WHERE id = $1
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(notification_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("mark_read"))?;

        row.map(Notification::from)
            .ok_or_else(|| EventlineError::not_found("notification", notification_id))
    }
}
