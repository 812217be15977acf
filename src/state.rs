use std::sync::Arc;

use crate::config::Config;
use crate::db::failed_webhook_repository::FailedWebhookRepository;
use crate::db::product_mapping_repository::ProductMappingRepository;
use crate::db::subscription_store::SubscriptionStore;
use crate::db::webhook_log_repository::WebhookLogRepository;
use crate::services::smtp_mailer::Mailer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SubscriptionStore>,
    pub webhook_logs: Arc<dyn WebhookLogRepository>,
    pub product_mappings: Arc<dyn ProductMappingRepository>,
    pub failed_webhooks: Arc<dyn FailedWebhookRepository>,
    pub mailer: Arc<dyn Mailer>,
    pub config: Arc<Config>,
}
