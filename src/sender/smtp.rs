//! SMTP sender via lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::campaign::model::{EmailStep, Lead};
use crate::config::SmtpConfig;
use crate::error::SendError;
use crate::sender::{EmailSender, SendReceipt, compose};

/// Delivers campaign emails over an authenticated SMTP relay.
#[derive(Clone)]
pub struct SmtpSender {
    transport: SmtpTransport,
    from_address: String,
    public_url: String,
}

impl SmtpSender {
    pub fn new(config: &SmtpConfig, public_url: impl Into<String>) -> Result<Self, SendError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| SendError::Transport {
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            transport,
            from_address: config.from_address.clone(),
            public_url: public_url.into(),
        })
    }

    /// Build the MIME message. Returns it with the Message-ID used as transport id.
    pub fn build_message(&self, lead: &Lead, step: EmailStep) -> Result<(Message, String), SendError> {
        let email = compose(lead, step, &self.public_url)?;

        let domain = self
            .from_address
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or("localhost");
        let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);

        let message = Message::builder()
            .from(self.from_address.parse().map_err(|e| SendError::InvalidAddress {
                address: self.from_address.clone(),
                reason: format!("{e}"),
            })?)
            .to(email.to.parse().map_err(|e| SendError::InvalidAddress {
                address: email.to.clone(),
                reason: format!("{e}"),
            })?)
            .subject(email.subject)
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_PLAIN)
            .body(email.body)
            .map_err(|e| SendError::Build(e.to_string()))?;

        Ok((message, message_id))
    }
}

#[async_trait]
impl EmailSender for SmtpSender {
    async fn send(&self, lead: &Lead, step: EmailStep) -> Result<SendReceipt, SendError> {
        let (message, message_id) = self.build_message(lead, step)?;
        let transport = self.transport.clone();

        let response = tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| SendError::Transport {
                reason: format!("SMTP task panicked: {e}"),
            })?
            .map_err(|e| SendError::Transport {
                reason: format!("SMTP send failed: {e}"),
            })?;

        if !response.is_positive() {
            return Err(SendError::Transport {
                reason: format!("SMTP rejected message: {}", response.code()),
            });
        }

        tracing::info!(to = %lead.email, step = step.number(), message_id = %message_id, "Email sent");
        Ok(SendReceipt::new(message_id))
    }
}
