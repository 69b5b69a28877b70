//! Campaign data model: leads, stages, email steps, and batch results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CampaignError;

/// Where a lead is in the campaign. Each value has its own membership set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeadStage {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "email1_sent")]
    Email1Sent,
    #[serde(rename = "email2_sent")]
    Email2Sent,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "unsubscribed")]
    Unsubscribed,
    #[serde(rename = "failed")]
    Failed,
}

impl LeadStage {
    pub const ALL: [LeadStage; 6] = [
        LeadStage::Queued,
        LeadStage::Email1Sent,
        LeadStage::Email2Sent,
        LeadStage::Completed,
        LeadStage::Unsubscribed,
        LeadStage::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStage::Queued => "queued",
            LeadStage::Email1Sent => "email1_sent",
            LeadStage::Email2Sent => "email2_sent",
            LeadStage::Completed => "completed",
            LeadStage::Unsubscribed => "unsubscribed",
            LeadStage::Failed => "failed",
        }
    }

    /// No campaign email will ever be sent from this stage.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LeadStage::Completed | LeadStage::Unsubscribed | LeadStage::Failed
        )
    }
}

impl fmt::Display for LeadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LeadStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown lead stage: {s}"))
    }
}

/// One of the three scheduled emails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EmailStep {
    First,
    Second,
    Third,
}

impl EmailStep {
    pub const ALL: [EmailStep; 3] = [EmailStep::First, EmailStep::Second, EmailStep::Third];

    pub fn from_number(n: u8) -> Result<Self, CampaignError> {
        match n {
            1 => Ok(EmailStep::First),
            2 => Ok(EmailStep::Second),
            3 => Ok(EmailStep::Third),
            other => Err(CampaignError::InvalidStep(other)),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            EmailStep::First => 1,
            EmailStep::Second => 2,
            EmailStep::Third => 3,
        }
    }

    /// The stage whose membership set this step drains.
    pub fn pending_stage(&self) -> LeadStage {
        match self {
            EmailStep::First => LeadStage::Queued,
            EmailStep::Second => LeadStage::Email1Sent,
            EmailStep::Third => LeadStage::Email2Sent,
        }
    }

    /// The stage a lead lands in once this step is done.
    pub fn completed_stage(&self) -> LeadStage {
        match self {
            EmailStep::First => LeadStage::Email1Sent,
            EmailStep::Second => LeadStage::Email2Sent,
            EmailStep::Third => LeadStage::Completed,
        }
    }
}

impl fmt::Display for EmailStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl Serialize for EmailStep {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.number())
    }
}

impl<'de> Deserialize<'de> for EmailStep {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u8::deserialize(deserializer)?;
        EmailStep::from_number(n).map_err(serde::de::Error::custom)
    }
}

/// Subject and body for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
}

impl EmailContent {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Blank subject or body counts as "not configured".
    pub fn is_configured(&self) -> bool {
        !self.subject.trim().is_empty() && !self.body.trim().is_empty()
    }
}

/// A prospective contact enrolled in the campaign, keyed by normalized email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email1: Option<EmailContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email2: Option<EmailContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email3: Option<EmailContent>,

    pub stage: LeadStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email1_sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email2_sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email3_sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribed_at: Option<DateTime<Utc>>,

    /// Consecutive failed sends at the current stage.
    #[serde(default)]
    pub send_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// A fresh `queued` lead. `email` must already be normalized.
    pub fn new(email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            email: email.into(),
            first_name: None,
            last_name: None,
            company: None,
            job_title: None,
            email1: None,
            email2: None,
            email3: None,
            stage: LeadStage::Queued,
            email1_sent_at: None,
            email2_sent_at: None,
            email3_sent_at: None,
            completed_at: None,
            unsubscribed_at: None,
            send_failures: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the content for a step.
    pub fn with_content(mut self, step: EmailStep, content: EmailContent) -> Self {
        match step {
            EmailStep::First => self.email1 = Some(content),
            EmailStep::Second => self.email2 = Some(content),
            EmailStep::Third => self.email3 = Some(content),
        }
        self
    }

    /// Configured content for a step, if any.
    pub fn content(&self, step: EmailStep) -> Option<&EmailContent> {
        let content = match step {
            EmailStep::First => self.email1.as_ref(),
            EmailStep::Second => self.email2.as_ref(),
            EmailStep::Third => self.email3.as_ref(),
        };
        content.filter(|c| c.is_configured())
    }

    /// When the given step's email went out.
    pub fn sent_at(&self, step: EmailStep) -> Option<DateTime<Utc>> {
        match step {
            EmailStep::First => self.email1_sent_at,
            EmailStep::Second => self.email2_sent_at,
            EmailStep::Third => self.email3_sent_at,
        }
    }
}

/// Why a batch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Reached the end of the pending set.
    Exhausted,
    /// Ran out of page size or wall-clock budget.
    Budget,
    /// The rate limiter denied a slot.
    RateLimited,
}

/// A per-lead failure recorded during a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadFailure {
    pub email: String,
    pub step: EmailStep,
    pub error: String,
}

/// Outcome of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub step: EmailStep,
    pub run_id: Uuid,
    /// Leads examined this run (sent + skipped + failed).
    pub processed: usize,
    pub sent: usize,
    /// Skipped leads that still advanced because their step has no content.
    pub advanced: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Pending leads not yet examined in this pass.
    pub remaining: usize,
    pub completed_all: bool,
    pub stopped_reason: StopReason,
    #[serde(default)]
    pub errors: Vec<LeadFailure>,
}

impl BatchResult {
    pub(crate) fn new(step: EmailStep, run_id: Uuid) -> Self {
        Self {
            step,
            run_id,
            processed: 0,
            sent: 0,
            advanced: 0,
            skipped: 0,
            failed: 0,
            remaining: 0,
            completed_all: false,
            stopped_reason: StopReason::Exhausted,
            errors: Vec::new(),
        }
    }
}
