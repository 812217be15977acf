use core::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::Type, FromRow};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::provider::Provider;

#[derive(Type, Debug, Deserialize, Serialize, PartialEq, Eq, Copy, Clone)]
#[sqlx(type_name = "failed_webhook_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FailedWebhookStatus {
    Pending,
    Retrying,
    Resolved,
    Abandoned,
}

impl fmt::Display for FailedWebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailedWebhookStatus::Pending => "pending",
            FailedWebhookStatus::Retrying => "retrying",
            FailedWebhookStatus::Resolved => "resolved",
            FailedWebhookStatus::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

/// Dead-lettered delivery held for reprocessing. `webhook_log_id` is a weak
/// reference back to the audit row that recorded the original delivery.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct FailedWebhook {
    pub id: Uuid,
    pub webhook_log_id: Option<Uuid>,
    pub source: Provider,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub retry_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_retry_at: Option<OffsetDateTime>,
    pub status: FailedWebhookStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
