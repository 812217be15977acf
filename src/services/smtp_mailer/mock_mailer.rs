use async_trait::async_trait;
use std::sync::Mutex;

use super::{MailError, Mailer};

/// A mock mailer that records sent emails for testing purposes.
#[derive(Debug, Default)]
pub struct MockMailer {
    pub sent_welcome_emails: Mutex<Vec<(String, String)>>,
    pub sent_access_ended_emails: Mutex<Vec<(String, String)>>,
    pub fail_send: bool,
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send_welcome_email(&self, to: &str, name: &str) -> Result<(), MailError> {
        if self.fail_send {
            return Err(MailError::Other("mock failure".into()));
        }
        self.sent_welcome_emails
            .lock()
            .unwrap()
            .push((to.to_string(), name.to_string()));
        Ok(())
    }

    async fn send_access_ended_email(&self, to: &str, reason: &str) -> Result<(), MailError> {
        if self.fail_send {
            return Err(MailError::Other("mock failure".into()));
        }
        self.sent_access_ended_emails
            .lock()
            .unwrap()
            .push((to.to_string(), reason.to_string()));
        Ok(())
    }
}
