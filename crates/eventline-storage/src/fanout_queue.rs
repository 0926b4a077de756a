// Outbox queue (Postgres)
//
// Claiming uses FOR UPDATE SKIP LOCKED so any number of workers can poll the
// same table without handing a task out twice.

use std::time::Duration;

use async_trait::async_trait;
use eventline_core::{
    EventlineError, FanoutKind, FanoutQueue, FanoutTask, NewFanoutTask, QueueStats, Result,
    TaskFailureOutcome, TaskStatus,
};
use sqlx::postgres::types::PgInterval;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::models::{convert_all, ClaimedTaskRow};
use crate::repositories::{db_err, Database};

fn interval(duration: Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: i64::try_from(duration.as_micros()).unwrap_or(i64::MAX),
    }
}

#[async_trait]
impl FanoutQueue for Database {
    async fn enqueue(&self, task: NewFanoutTask) -> Result<bool> {
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
        .execute(self.pool())
        .await
        .map_err(db_err("enqueue"))?;

        let inserted = result.rows_affected() > 0;
        debug!(kind = %task.kind, subject_id = %task.subject_id, inserted, "enqueued fanout task");
        Ok(inserted)
    }

    #[instrument(skip(self, kinds))]
    async fn claim(
        &self,
        worker_id: &str,
        kinds: &[FanoutKind],
        max: usize,
    ) -> Result<Vec<FanoutTask>> {
        if kinds.is_empty() || max == 0 {
            return Ok(vec![]);
        }
        let kinds: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();

        let rows = sqlx::query_as::<_, ClaimedTaskRow>(
            r#"
            WITH claimable AS (
                SELECT id
                FROM fanout_tasks
                WHERE status = 'pending'
                  AND kind = ANY($1)
                  AND visible_at <= NOW()
                ORDER BY visible_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE fanout_tasks t
            SET status = 'claimed',
                claimed_by = $3,
                claimed_at = NOW(),
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.kind, t.subject_id, t.attempt, t.max_attempts, t.claimed_by
            "#,
        )
        .bind(&kinds)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .bind(worker_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err("claim"))?;

        convert_all(rows)
    }

    async fn complete(&self, task: &FanoutTask) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE fanout_tasks
            SET status = 'completed', claimed_by = NULL
            WHERE id = $1
              AND status = 'claimed'
              AND claimed_by = $2
              AND attempt = $3
            "#,
        )
        .bind(task.id)
        .bind(&task.claimed_by)
        .bind(task.attempt as i32)
        .execute(self.pool())
        .await
        .map_err(db_err("complete"))?;

        if result.rows_affected() == 0 {
            return Err(EventlineError::ClaimLost(task.id));
        }
        Ok(())
    }

    async fn fail(
        &self,
        task: &FanoutTask,
        error: &str,
        retry_delay: Duration,
    ) -> Result<TaskFailureOutcome> {
        let task_id = task.id;
        let mut tx = self.pool().begin().await.map_err(db_err("fail"))?;

        let row: Option<(i32, i32)> = sqlx::query_as(
            r#"
            SELECT attempt, max_attempts FROM fanout_tasks
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2 AND attempt = $3
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .bind(&task.claimed_by)
        .bind(task.attempt as i32)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("fail"))?;
        let (attempt, max_attempts) = row.ok_or(EventlineError::ClaimLost(task_id))?;

        let outcome = if attempt < max_attempts {
            sqlx::query(
                r#"
                UPDATE fanout_tasks
                SET status = 'pending',
                    claimed_by = NULL,
                    claimed_at = NULL,
                    last_error = $2,
                    visible_at = NOW() + $3
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(error)
            .bind(interval(retry_delay))
            .execute(&mut *tx)
            .await
            .map_err(db_err("fail"))?;

            TaskFailureOutcome::WillRetry {
                next_attempt: (attempt + 1).max(0) as u32,
                delay: retry_delay,
            }
        } else {
            sqlx::query(
                r#"
                UPDATE fanout_tasks
                SET status = 'dead', claimed_by = NULL, claimed_at = NULL, last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(db_err("fail"))?;

            TaskFailureOutcome::Dead
        };

        tx.commit().await.map_err(db_err("fail"))?;
        Ok(outcome)
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<usize> {
        let cutoff = interval(threshold);

        let dead = sqlx::query(
            r#"
            UPDATE fanout_tasks
            SET status = 'dead',
                claimed_by = NULL,
                claimed_at = NULL,
                last_error = 'worker lost while running final attempt'
            WHERE status = 'claimed'
              AND claimed_at < NOW() - $1
              AND attempt >= max_attempts
            "#,
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .map_err(db_err("reclaim_stale"))?;

        if dead.rows_affected() > 0 {
            warn!(count = dead.rows_affected(), "stale tasks exhausted their attempts");
        }

        let reclaimed = sqlx::query(
            r#"
            UPDATE fanout_tasks
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                visible_at = NOW()
            WHERE status = 'claimed'
              AND claimed_at < NOW() - $1
            "#,
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .map_err(db_err("reclaim_stale"))?;

        Ok(reclaimed.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM fanout_tasks GROUP BY status")
                .fetch_all(self.pool())
                .await
                .map_err(db_err("stats"))?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count.max(0) as usize;
            match TaskStatus::parse(&status)? {
                TaskStatus::Pending => stats.pending = count,
                TaskStatus::Claimed => stats.claimed = count,
                TaskStatus::Completed => stats.completed = count,
                TaskStatus::Dead => stats.dead = count,
            }
        }
        Ok(stats)
    }
}
