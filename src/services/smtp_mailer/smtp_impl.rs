use async_trait::async_trait;
use lettre::{
    address::AddressError,
    message::Mailbox,
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::sync::Arc;

use super::{MailError, Mailer};

#[derive(Clone)]
pub struct SmtpMailer {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    sender: Mailbox,
}

impl SmtpMailer {
    pub fn new() -> Result<Self, MailError> {
        let host = std::env::var("SMTP_HOST")?;
        let username = std::env::var("SMTP_USERNAME")?;
        let password = std::env::var("SMTP_PASSWORD")?;
        let from = std::env::var("SMTP_FROM")?
            .parse()
            .map_err(|e: AddressError| MailError::InvalidEmailAddress(e.to_string()))?;
        let port: u16 = std::env::var("SMTP_PORT")?
            .parse()
            .map_err(|e| MailError::Other(format!("invalid SMTP_PORT: {}", e)))?;

        let disabled_tls = std::env::var("SMTP_TLS_DISABLED")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            == "true";

        let mailer = if disabled_tls {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&host)
                .port(port)
                .build()
        } else {
            let creds = Credentials::new(username, password);
            let tls = TlsParameters::new(host.clone())?;

            AsyncSmtpTransport::<Tokio1Executor>::relay(&host)?
                .port(port)
                .tls(Tls::Required(tls))
                .credentials(creds)
                .build()
        };

        Ok(Self {
            transport: Arc::new(mailer),
            sender: from,
        })
    }

    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let email = Message::builder()
            .from(self.sender.clone())
            .to(to
                .parse()
                .map_err(|e: AddressError| MailError::InvalidEmailAddress(e.to_string()))?)
            .subject(subject)
            .body(body.to_string())?;

        self.transport
            .send(email)
            .await
            .map(|_| ())
            .map_err(|e| e.into())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_welcome_email(&self, to: &str, name: &str) -> Result<(), MailError> {
        let body = format!(
            "Olá {},\n\nSua assinatura foi ativada e seu acesso já está liberado.\n\n\
             Entre com seu e-mail e a senha inicial informada na página de boas-vindas.",
            name
        );

        self.send_email(to, "Seu acesso foi liberado", &body).await
    }

    async fn send_access_ended_email(&self, to: &str, reason: &str) -> Result<(), MailError> {
        let body = format!(
            "Olá,\n\nSua assinatura foi encerrada ({}) e o acesso premium foi desativado.\n\n\
             Se isso foi um engano, entre em contato com o suporte.",
            reason
        );

        self.send_email(to, "Sua assinatura foi encerrada", &body)
            .await
    }
}
