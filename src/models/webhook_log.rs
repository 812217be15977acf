use core::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::Type, FromRow};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::provider::Provider;

#[derive(Type, Debug, Deserialize, Serialize, PartialEq, Eq, Copy, Clone)]
#[sqlx(type_name = "webhook_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Received,
    Processed,
    Error,
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WebhookStatus::Received => "received",
            WebhookStatus::Processed => "processed",
            WebhookStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Append-only audit trail. One row per inbound delivery; after insertion
/// only the status, note and processed_at fields are ever touched.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct WebhookLogEntry {
    pub id: Uuid,
    pub provider: Provider,
    pub event_type: String,
    pub status: WebhookStatus,
    pub email: Option<String>,
    pub transaction_id: Option<String>,
    pub raw_payload: serde_json::Value,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

/// Insert shape for a freshly received delivery.
#[derive(Debug, Clone)]
pub struct NewWebhookLog {
    pub provider: Provider,
    pub event_type: String,
    pub email: Option<String>,
    pub transaction_id: Option<String>,
    pub raw_payload: serde_json::Value,
}
