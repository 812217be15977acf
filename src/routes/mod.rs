pub mod admin;
pub mod webhooks;
