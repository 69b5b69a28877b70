//! Store key layout.

use crate::campaign::model::{EmailStep, LeadStage};
use crate::error::CampaignError;

/// Shared last-send timestamp (epoch millis) used by the rate limiter.
pub const RATE_LIMIT_KEY: &str = "ratelimit:last_send_ms";

pub fn lead_key(email: &str) -> String {
    format!("lead:{email}")
}

pub fn stage_set_key(stage: LeadStage) -> String {
    format!("stage:{}", stage.as_str())
}

pub fn cursor_key(step: EmailStep) -> String {
    format!("cursor:email{}", step.number())
}

/// Trim and lower-case an address, rejecting anything without a local part and a dotted domain.
pub fn normalize_email(raw: &str) -> Result<String, CampaignError> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(CampaignError::InvalidEmail(raw.to_string()))
    }
}
