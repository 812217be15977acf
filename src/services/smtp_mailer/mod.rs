use async_trait::async_trait;
use std::fmt;

pub mod mock_mailer;
pub mod smtp_impl;

pub use smtp_impl::SmtpMailer;

#[derive(Debug)]
pub enum MailError {
    Other(String),
    InvalidEmailAddress(String),
    SendError(String),
    EnvVarMissing(String),
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailError::Other(e) => write!(f, "Error: {}", e),
            MailError::InvalidEmailAddress(e) => write!(f, "Invalid Address: {}", e),
            MailError::SendError(e) => write!(f, "Send error: {}", e),
            MailError::EnvVarMissing(e) => write!(f, "Env Var Missing: {}", e),
        }
    }
}

impl std::error::Error for MailError {}

impl From<lettre::transport::smtp::Error> for MailError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        MailError::SendError(err.to_string())
    }
}

impl From<lettre::error::Error> for MailError {
    fn from(err: lettre::error::Error) -> Self {
        MailError::SendError(err.to_string())
    }
}

impl From<std::env::VarError> for MailError {
    fn from(err: std::env::VarError) -> Self {
        MailError::EnvVarMissing(err.to_string())
    }
}

/// Member notifications sent after a subscription changes state. Sends are
/// fire-and-forget; a mail failure never fails webhook processing.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_welcome_email(&self, to: &str, name: &str) -> Result<(), MailError>;

    async fn send_access_ended_email(&self, to: &str, reason: &str) -> Result<(), MailError>;
}
