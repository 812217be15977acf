pub mod failed_webhook;
pub mod product_mapping;
pub mod provider;
pub mod subscription;
pub mod user;
pub mod webhook_log;
