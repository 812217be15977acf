pub mod failed_webhook_repository;
pub mod mock_db;
pub mod postgres_failed_webhook_repository;
pub mod postgres_product_mapping_repository;
pub mod postgres_subscription_store;
pub mod postgres_webhook_log_repository;
pub mod product_mapping_repository;
pub mod subscription_store;
pub mod webhook_log_repository;
