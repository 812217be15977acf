use async_trait::async_trait;
use uuid::Uuid;

use crate::models::webhook_log::{NewWebhookLog, WebhookLogEntry};

#[async_trait]
pub trait WebhookLogRepository: Send + Sync {
    /// Records a freshly received delivery with `status = received`.
    async fn insert_received(&self, entry: &NewWebhookLog) -> Result<Uuid, sqlx::Error>;

    /// Stamps `processed_at` and flips the status to `processed`. `note`
    /// carries outcome context (duplicate delivery, mapping fallback, and so on).
    async fn mark_processed(&self, id: Uuid, note: Option<&str>) -> Result<(), sqlx::Error>;

    async fn mark_error(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error>;

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<WebhookLogEntry>, sqlx::Error>;
}
