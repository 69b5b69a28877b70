//! Outbound send collaborator.
//!
//! The batch processor only needs `send(lead, step) -> transport id`; how the
//! message is rendered and delivered lives behind [`EmailSender`].

pub mod smtp;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::campaign::model::{EmailStep, Lead};
use crate::error::SendError;

pub use smtp::SmtpSender;

/// Proof of a confirmed send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    /// Transport-assigned message identifier. A receipt without one is
    /// treated as a failed send.
    pub transport_id: Option<String>,
}

impl SendReceipt {
    pub fn new(transport_id: impl Into<String>) -> Self {
        Self {
            transport_id: Some(transport_id.into()),
        }
    }
}

/// Sends one campaign email to one lead.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, lead: &Lead, step: EmailStep) -> Result<SendReceipt, SendError>;
}

/// A rendered email, ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Build the outgoing email for a step, with the opt-out footer appended.
pub fn compose(lead: &Lead, step: EmailStep, public_url: &str) -> Result<OutgoingEmail, SendError> {
    let content = lead
        .content(step)
        .ok_or(SendError::MissingContent { step: step.number() })?;

    let body = format!(
        "{}\n\n--\nDon't want these emails? Unsubscribe: {}",
        content.body.trim_end(),
        unsubscribe_url(public_url, &lead.email)
    );

    Ok(OutgoingEmail {
        to: lead.email.clone(),
        subject: content.subject.trim().to_string(),
        body,
    })
}

/// Opt-out link for an address.
pub fn unsubscribe_url(public_url: &str, email: &str) -> String {
    format!(
        "{}/unsubscribe?email={}",
        public_url.trim_end_matches('/'),
        urlencoding::encode(email)
    )
}

/// Sender that logs instead of delivering. Used when no SMTP host is configured.
#[derive(Debug, Clone)]
pub struct DryRunSender {
    public_url: String,
}

impl DryRunSender {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
        }
    }
}

#[async_trait]
impl EmailSender for DryRunSender {
    async fn send(&self, lead: &Lead, step: EmailStep) -> Result<SendReceipt, SendError> {
        let email = compose(lead, step, &self.public_url)?;
        let id = format!("dry-run-{}", Uuid::new_v4());
        tracing::info!(
            to = %email.to,
            step = step.number(),
            subject = %email.subject,
            transport_id = %id,
            "Dry run: email not delivered"
        );
        Ok(SendReceipt::new(id))
    }
}
