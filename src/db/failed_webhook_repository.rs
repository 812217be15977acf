use async_trait::async_trait;
use uuid::Uuid;

use crate::models::failed_webhook::FailedWebhook;
use crate::models::provider::Provider;

#[async_trait]
pub trait FailedWebhookRepository: Send + Sync {
    async fn enqueue(
        &self,
        webhook_log_id: Option<Uuid>,
        source: Provider,
        payload: serde_json::Value,
        error: &str,
    ) -> Result<Uuid, sqlx::Error>;

    /// Claims rows whose exponential backoff window has elapsed, flipping
    /// them to `retrying` and bumping `retry_count`/`last_retry_at` in the
    /// same statement so concurrent workers never double-claim.
    async fn claim_due(
        &self,
        max_attempts: i32,
        backoff_base_secs: i64,
        limit: i64,
    ) -> Result<Vec<FailedWebhook>, sqlx::Error>;

    /// Manual-retry path: claim one row regardless of backoff schedule.
    /// Returns the row as claimed, or None if it is missing or resolved.
    async fn claim_one(&self, id: Uuid) -> Result<Option<FailedWebhook>, sqlx::Error>;

    async fn mark_resolved(&self, id: Uuid) -> Result<(), sqlx::Error>;

    /// Records another failed attempt without abandoning the row.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error>;

    async fn mark_abandoned(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error>;

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<FailedWebhook>, sqlx::Error>;
}
