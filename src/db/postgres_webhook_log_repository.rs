use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::db::webhook_log_repository::WebhookLogRepository;
use crate::models::webhook_log::{NewWebhookLog, WebhookLogEntry};

pub struct PostgresWebhookLogRepository {
    pub pool: PgPool,
}

#[async_trait]
impl WebhookLogRepository for PostgresWebhookLogRepository {
    async fn insert_received(&self, entry: &NewWebhookLog) -> Result<Uuid, sqlx::Error> {
        let id: Uuid = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            INSERT INTO webhook_logs (provider, event_type, status, email, transaction_id, raw_payload)
            VALUES ($1, $2, 'received', $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(entry.provider)
        .bind(&entry.event_type)
        .bind(&entry.email)
        .bind(&entry.transaction_id)
        .bind(&entry.raw_payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn mark_processed(&self, id: Uuid, note: Option<&str>) -> Result<(), sqlx::Error> {
        // error_message doubles as an outcome note on processed rows
        // (duplicate delivery, mapping fallback).
        sqlx::query::<Postgres>(
            r#"
            UPDATE webhook_logs
            SET status = 'processed', error_message = $1, processed_at = now()
            WHERE id = $2
            "#,
        )
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_error(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query::<Postgres>(
            r#"
            UPDATE webhook_logs
            SET status = 'error', error_message = $1, processed_at = now()
            WHERE id = $2
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<WebhookLogEntry>, sqlx::Error> {
        sqlx::query_as::<Postgres, WebhookLogEntry>(
            r#"
            SELECT * FROM webhook_logs
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
