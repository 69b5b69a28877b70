//! Error types for the drip campaign.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Lead store errors. Any of these aborts the batch that hit it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Write conflict: {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors from the outbound send collaborator. Always scoped to a single lead.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Transport failed: {reason}")]
    Transport { reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Send outcome unknown after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("No content configured for email {step}")]
    MissingContent { step: u8 },
}

/// Campaign rule violations and lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Invalid email step {0}: expected 1, 2 or 3")]
    InvalidStep(u8),

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("Lead not found: {0}")]
    LeadNotFound(String),

    #[error("Lead {email} is {stage}, cannot move to {target}")]
    TransitionRejected {
        email: String,
        stage: String,
        target: String,
    },
}

/// Result type alias for the campaign.
pub type Result<T> = std::result::Result<T, Error>;
