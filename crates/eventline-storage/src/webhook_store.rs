// Webhook, delivery and delinquency persistence (Postgres)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventline_core::{
    DelinquencyTracker, Delivery, DeliveryOutcome, EventlineError, Result, Webhook,
    WebhookStore,
};
use uuid::Uuid;

use crate::models::{convert_all, DelinquencyRow, DeliveryRow, WebhookRow};
use crate::repositories::{db_err, Database};

const WEBHOOK_COLUMNS: &str =
    "id, account_id, board_id, name, url, active, subscribed_actions, created_at";
const DELIVERY_COLUMNS: &str =
    "id, webhook_id, event_id, state, response_code, error, created_at, updated_at";

#[async_trait]
impl WebhookStore for Database {
    async fn save_webhook(&self, webhook: &Webhook) -> Result<()> {
        let actions: Vec<String> = webhook.subscribed_actions.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO webhooks (id, account_id, board_id, name, url, active, subscribed_actions, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                active = EXCLUDED.active,
                subscribed_actions = EXCLUDED.subscribed_actions
            "#,
        )
        .bind(webhook.id)
        .bind(webhook.account_id)
        .bind(webhook.board_id)
        .bind(&webhook.name)
        .bind(&webhook.url)
        .bind(webhook.active)
        .bind(&actions)
        .bind(webhook.created_at)
        .execute(self.pool())
        .await
        .map_err(db_err("save_webhook"))?;

        Ok(())
    }

    async fn find_webhook(&self, id: Uuid) -> Result<Option<Webhook>> {
        let row = sqlx::query_as::<_, WebhookRow>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("find_webhook"))?;

        Ok(row.map(Webhook::from))
    }

    async fn active_webhooks_for_board(&self, board_id: Uuid) -> Result<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, WebhookRow>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE board_id = $1 AND active ORDER BY id"
        ))
        .bind(board_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err("active_webhooks_for_board"))?;

        Ok(rows.into_iter().map(Webhook::from).collect())
    }

    async fn ensure_delivery(&self, webhook_id: Uuid, event_id: Uuid) -> Result<Delivery> {
        let fresh = Delivery::new(webhook_id, event_id);
        let inserted = sqlx::query_as::<_, DeliveryRow>(&format!(
            r#"
            INSERT INTO webhook_deliveries (id, webhook_id, event_id, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (webhook_id, event_id) DO NOTHING
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(fresh.id)
        .bind(webhook_id)
        .bind(event_id)
        .bind(fresh.state.as_str())
        .bind(fresh.created_at)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("ensure_delivery"))?;

        let row = match inserted {
            Some(row) => row,
            None => sqlx::query_as::<_, DeliveryRow>(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE webhook_id = $1 AND event_id = $2"
            ))
            .bind(webhook_id)
            .bind(event_id)
            .fetch_one(self.pool())
            .await
            .map_err(db_err("ensure_delivery"))?,
        };

        Delivery::try_from(row)
    }

    async fn find_delivery(&self, id: Uuid) -> Result<Option<Delivery>> {
        let row = sqlx::query_as::<_, DeliveryRow>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("find_delivery"))?;

        row.map(Delivery::try_from).transpose()
    }

    async fn deliveries_for_event(&self, event_id: Uuid) -> Result<Vec<Delivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE event_id = $1 ORDER BY webhook_id"
        ))
        .bind(event_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err("deliveries_for_event"))?;

        convert_all(rows)
    }

    async fn update_delivery(&self, delivery: &Delivery) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET state = $2, response_code = $3, error = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.state.as_str())
        .bind(delivery.response_code.map(i32::from))
        .bind(&delivery.error)
        .bind(delivery.updated_at)
        .execute(self.pool())
        .await
        .map_err(db_err("update_delivery"))?;

        if result.rows_affected() == 0 {
            return Err(EventlineError::not_found("delivery", delivery.id));
        }
        Ok(())
    }

    async fn delinquency(&self, webhook_id: Uuid) -> Result<DelinquencyTracker> {
        let row = sqlx::query_as::<_, DelinquencyRow>(
            r#"
            SELECT webhook_id, consecutive_failures, first_failure_at
            FROM webhook_delinquency_trackers
            WHERE webhook_id = $1
            "#,
        )
        .bind(webhook_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("delinquency"))?;

        Ok(row
            .map(DelinquencyTracker::from)
            .unwrap_or_else(|| DelinquencyTracker::new(webhook_id)))
    }

    async fn record_delivery_outcome(
        &self,
        webhook_id: Uuid,
        outcome: &DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<DelinquencyTracker> {
        // Increment in place; the row lock serializes concurrent outcomes
        let row = sqlx::query_as::<_, DelinquencyRow>(
            r#"
            INSERT INTO webhook_delinquency_trackers AS t (webhook_id, consecutive_failures, first_failure_at, updated_at)
            VALUES (
                $1,
                CASE WHEN $2 THEN 0 ELSE 1 END,
                CASE WHEN $2 THEN NULL ELSE $3::timestamptz END,
                NOW()
            )
            ON CONFLICT (webhook_id) DO UPDATE SET
                consecutive_failures = CASE WHEN $2 THEN 0 ELSE t.consecutive_failures + 1 END,
                first_failure_at = CASE WHEN $2 THEN NULL ELSE COALESCE(t.first_failure_at, $3::timestamptz) END,
                updated_at = NOW()
            RETURNING webhook_id, consecutive_failures, first_failure_at
            "#,
        )
        .bind(webhook_id)
        .bind(outcome.is_success())
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(db_err("record_delivery_outcome"))?;

        Ok(row.into())
    }

    async fn deactivate_webhook(&self, webhook_id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE webhooks SET active = FALSE WHERE id = $1")
            .bind(webhook_id)
            .execute(self.pool())
            .await
            .map_err(db_err("deactivate_webhook"))?;

        if result.rows_affected() == 0 {
            return Err(EventlineError::not_found("webhook", webhook_id));
        }
        Ok(())
    }
}
