//! Owner notification delivery via SMTP.
//!
//! [`SmtpEmailer`] wraps the `lettre` async SMTP transport to send the
//! plain-text result emails. The pipeline talks to [`EmailService`] so tests
//! can capture sent mail instead of opening sockets. Transport failures map
//! to transient errors (the notifier retries them); a malformed recipient
//! address is fatal.

use async_trait::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;

use crate::retry::ApiError;

/// SMTP settings. Absent entirely when email delivery is not configured.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// SMTP server hostname.
    pub smtp_host: String,
    /// SMTP server port (defaults to 587, STARTTLS).
    pub smtp_port: u16,
    /// RFC 5322 "From" address.
    pub from_address: String,
    /// Optional SMTP username.
    pub smtp_user: Option<String>,
    /// Optional SMTP password.
    pub smtp_password: Option<String>,
}

#[async_trait]
pub trait EmailService: Send + Sync {
    /// Send one plain-text email.
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ApiError>;
}

/// Sends result emails over SMTP.
pub struct SmtpEmailer {
    config: EmailConfig,
}

impl SmtpEmailer {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EmailService for SmtpEmailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ApiError> {
        let from = self
            .config
            .from_address
            .parse()
            .map_err(|e| ApiError::Fatal(format!("Invalid from address: {e}")))?;
        let to_mailbox = to
            .parse()
            .map_err(|e| ApiError::Fatal(format!("Invalid recipient address {to}: {e}")))?;

        let email = Message::builder()
            .from(from)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| ApiError::Fatal(format!("Failed to build email: {e}")))?;

        let mut transport_builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)
                .map_err(|e| ApiError::Transient(format!("SMTP relay setup failed: {e}")))?
                .port(self.config.smtp_port);

        if let (Some(user), Some(pass)) = (&self.config.smtp_user, &self.config.smtp_password) {
            transport_builder =
                transport_builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let mailer = transport_builder.build();
        mailer
            .send(email)
            .await
            .map_err(|e| ApiError::Transient(format!("SMTP send failed: {e}")))?;

        info!(to, subject, "Result email sent");
        Ok(())
    }
}
