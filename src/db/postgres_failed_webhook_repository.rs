use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::db::failed_webhook_repository::FailedWebhookRepository;
use crate::models::failed_webhook::FailedWebhook;
use crate::models::provider::Provider;

pub struct PostgresFailedWebhookRepository {
    pub pool: PgPool,
}

#[async_trait]
impl FailedWebhookRepository for PostgresFailedWebhookRepository {
    async fn enqueue(
        &self,
        webhook_log_id: Option<Uuid>,
        source: Provider,
        payload: serde_json::Value,
        error: &str,
    ) -> Result<Uuid, sqlx::Error> {
        let id: Uuid = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            INSERT INTO failed_webhooks (webhook_log_id, source, payload, error_message, status)
            VALUES ($1, $2, $3, $4, 'pending')
            RETURNING id
            "#,
        )
        .bind(webhook_log_id)
        .bind(source)
        .bind(payload)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_due(
        &self,
        max_attempts: i32,
        backoff_base_secs: i64,
        limit: i64,
    ) -> Result<Vec<FailedWebhook>, sqlx::Error> {
        // FOR UPDATE SKIP LOCKED keeps concurrent workers from claiming the
        // same rows. Backoff doubles per attempt from the base interval.
        sqlx::query_as::<Postgres, FailedWebhook>(
            r#"
            UPDATE failed_webhooks
            SET status = 'retrying',
                retry_count = retry_count + 1,
                last_retry_at = now()
            WHERE id IN (
                SELECT id FROM failed_webhooks
                WHERE status IN ('pending', 'retrying')
                  AND retry_count < $1
                  AND COALESCE(last_retry_at, created_at)
                      + make_interval(secs => $2 * power(2, retry_count)) <= now()
                ORDER BY created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(max_attempts)
        .bind(backoff_base_secs as f64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn claim_one(&self, id: Uuid) -> Result<Option<FailedWebhook>, sqlx::Error> {
        sqlx::query_as::<Postgres, FailedWebhook>(
            r#"
            UPDATE failed_webhooks
            SET status = 'retrying',
                retry_count = retry_count + 1,
                last_retry_at = now()
            WHERE id = $1 AND status <> 'resolved'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn mark_resolved(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query::<Postgres>("UPDATE failed_webhooks SET status = 'resolved' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query::<Postgres>(
            "UPDATE failed_webhooks SET status = 'pending', error_message = $1 WHERE id = $2",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_abandoned(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query::<Postgres>(
            "UPDATE failed_webhooks SET status = 'abandoned', error_message = $1 WHERE id = $2",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<FailedWebhook>, sqlx::Error> {
        sqlx::query_as::<Postgres, FailedWebhook>(
            r#"
            SELECT * FROM failed_webhooks
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }
}
