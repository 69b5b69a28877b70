//! Lead repository: record reads/writes and idempotent lead submission.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::campaign::keys::{lead_key, normalize_email, stage_set_key};
use crate::campaign::model::{EmailContent, Lead, LeadStage};
use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::store::KvStore;

/// Lead submission payload. Absent fields leave an existing lead's value alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewLead {
    pub email: String,
    #[serde(default, alias = "firstName")]
    pub first_name: Option<String>,
    #[serde(default, alias = "lastName")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default, alias = "jobTitle", alias = "title")]
    pub job_title: Option<String>,
    #[serde(default)]
    pub email1: Option<EmailContent>,
    #[serde(default)]
    pub email2: Option<EmailContent>,
    #[serde(default)]
    pub email3: Option<EmailContent>,
}

impl NewLead {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Default::default()
        }
    }

    /// Builder: set step 1 content.
    pub fn with_email1(mut self, subject: &str, body: &str) -> Self {
        self.email1 = Some(EmailContent::new(subject, body));
        self
    }

    /// Builder: set step 2 content.
    pub fn with_email2(mut self, subject: &str, body: &str) -> Self {
        self.email2 = Some(EmailContent::new(subject, body));
        self
    }

    /// Builder: set step 3 content.
    pub fn with_email3(mut self, subject: &str, body: &str) -> Self {
        self.email3 = Some(EmailContent::new(subject, body));
        self
    }

    fn apply_to(&self, lead: &mut Lead) {
        macro_rules! overwrite {
            ($($field:ident),*) => {
                $(if let Some(value) = &self.$field { lead.$field = Some(value.clone()); })*
            };
        }
        overwrite!(first_name, last_name, company, job_title, email1, email2, email3);
    }
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    Created,
    Updated,
}

/// Attempts at a conditional record write before giving up.
const MAX_WRITE_ATTEMPTS: usize = 8;

/// What an edit closure passed to [`LeadRepository::update`] wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edit {
    Write,
    /// Leave the record untouched. Return this before mutating anything.
    Keep,
}

/// Reads and writes lead records.
///
/// Stage, timestamps and membership belong to the stage engine; this type
/// only creates leads and edits their content. Every write to an existing
/// record is a compare-and-swap against the value that was read.
#[derive(Clone)]
pub struct LeadRepository {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl LeadRepository {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Fetch a lead by (already normalized) email.
    pub async fn get(&self, email: &str) -> std::result::Result<Option<Lead>, StoreError> {
        match self.store.get(&lead_key(email)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write a brand new record. Returns `false` if one already exists.
    async fn create(&self, lead: &Lead) -> std::result::Result<bool, StoreError> {
        let raw = serde_json::to_string(lead)?;
        self.store
            .compare_and_swap(&lead_key(&lead.email), None, &raw)
            .await
    }

    /// Read-modify-write one record.
    ///
    /// `edit` always sees the freshest record and is re-run when another
    /// writer got in between the read and the write. `Ok(None)` when the
    /// record does not exist.
    pub(crate) async fn update<F>(&self, email: &str, mut edit: F) -> Result<Option<Lead>>
    where
        F: FnMut(&mut Lead) -> Result<Edit>,
    {
        let key = lead_key(email);
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let Some(raw) = self.store.get(&key).await? else {
                return Ok(None);
            };
            let mut lead: Lead = serde_json::from_str(&raw).map_err(StoreError::from)?;
            if edit(&mut lead)? == Edit::Keep {
                return Ok(Some(lead));
            }
            let next = serde_json::to_string(&lead).map_err(StoreError::from)?;
            if self.store.compare_and_swap(&key, Some(&raw), &next).await? {
                return Ok(Some(lead));
            }
            debug!(email = %email, attempt, "Lead record changed underneath, retrying");
        }
        Err(StoreError::Conflict(format!("lead {email} kept changing during update")).into())
    }

    /// Unconditional write, for setting up odd states in tests.
    #[cfg(test)]
    pub(crate) async fn put(&self, lead: &Lead) -> std::result::Result<(), StoreError> {
        let raw = serde_json::to_string(lead)?;
        self.store.set(&lead_key(&lead.email), &raw).await
    }

    /// Create a lead in `queued`, or update content on an existing one.
    ///
    /// Resubmission never re-queues and never writes stage or send
    /// timestamps: the lead keeps whatever the engine last recorded and is
    /// only re-asserted in that stage's set.
    pub async fn submit(&self, new_lead: NewLead) -> Result<SubmitOutcome> {
        let email = normalize_email(&new_lead.email)?;
        let now = self.clock.now();

        let mut fresh = Lead::new(email.clone(), now);
        new_lead.apply_to(&mut fresh);
        if self.create(&fresh).await? {
            self.store
                .add_to_set(&stage_set_key(LeadStage::Queued), &email)
                .await?;
            info!(email = %email, "Lead queued");
            return Ok(SubmitOutcome::Created);
        }

        let lead = self
            .update(&email, |lead| {
                new_lead.apply_to(lead);
                lead.updated_at = now;
                Ok(Edit::Write)
            })
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("lead {email} vanished during update")))?;

        let set_key = stage_set_key(lead.stage);
        self.store.add_to_set(&set_key, &email).await?;
        // Stages only move forward, so a lead that moved on since our write
        // will never need this membership again.
        let moved_on = self
            .get(&email)
            .await?
            .is_some_and(|current| current.stage != lead.stage);
        if moved_on {
            self.store.remove_from_set(&set_key, &email).await?;
        }
        debug!(email = %email, stage = %lead.stage, "Lead updated");
        Ok(SubmitOutcome::Updated)
    }

    /// Number of leads in each stage set.
    pub async fn stage_counts(&self) -> std::result::Result<Vec<(LeadStage, usize)>, StoreError> {
        let mut counts = Vec::with_capacity(LeadStage::ALL.len());
        for stage in LeadStage::ALL {
            counts.push((stage, self.store.set_cardinality(&stage_set_key(stage)).await?));
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::model::EmailStep;
    use crate::clock::SystemClock;
    use crate::error::{CampaignError, Error};
    use crate::store::MemoryStore;

    fn repo() -> (Arc<MemoryStore>, LeadRepository) {
        let store = Arc::new(MemoryStore::new());
        let repo = LeadRepository::new(store.clone(), Arc::new(SystemClock));
        (store, repo)
    }

    #[tokio::test]
    async fn submit_creates_queued_lead() {
        let (store, repo) = repo();
        let outcome = repo
            .submit(NewLead::new(" A@X.com ").with_email1("Hi", "Hello there"))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Created);

        let lead = repo.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(lead.stage, LeadStage::Queued);
        assert!(lead.content(EmailStep::First).is_some());
        assert_eq!(
            store.set_members("stage:queued").await.unwrap(),
            vec!["a@x.com"]
        );
    }

    #[tokio::test]
    async fn resubmission_updates_without_duplicating_membership() {
        let (store, repo) = repo();
        repo.submit(NewLead::new("a@x.com").with_email1("Hi", "v1"))
            .await
            .unwrap();

        let mut update = NewLead::new("A@x.com").with_email2("Follow up", "v2");
        update.company = Some("Acme".into());
        assert_eq!(repo.submit(update).await.unwrap(), SubmitOutcome::Updated);

        let lead = repo.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(lead.email1.as_ref().unwrap().body, "v1");
        assert_eq!(lead.email2.as_ref().unwrap().body, "v2");
        assert_eq!(lead.company.as_deref(), Some("Acme"));
        assert_eq!(store.set_cardinality("stage:queued").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn resubmission_keeps_advanced_stage() {
        let (store, repo) = repo();
        repo.submit(NewLead::new("a@x.com")).await.unwrap();

        let mut lead = repo.get("a@x.com").await.unwrap().unwrap();
        lead.stage = LeadStage::Email1Sent;
        repo.put(&lead).await.unwrap();
        store.remove_from_set("stage:queued", "a@x.com").await.unwrap();
        store.add_to_set("stage:email1_sent", "a@x.com").await.unwrap();

        repo.submit(NewLead::new("a@x.com")).await.unwrap();
        assert_eq!(store.set_cardinality("stage:queued").await.unwrap(), 0);
        assert_eq!(store.set_cardinality("stage:email1_sent").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn submit_rejects_invalid_email() {
        let (_store, repo) = repo();
        let err = repo.submit(NewLead::new("not-an-email")).await.unwrap_err();
        assert!(matches!(err, Error::Campaign(CampaignError::InvalidEmail(_))));
    }

    #[tokio::test]
    async fn stage_counts_cover_every_stage() {
        let (_store, repo) = repo();
        repo.submit(NewLead::new("a@x.com")).await.unwrap();
        repo.submit(NewLead::new("b@x.com")).await.unwrap();

        let counts = repo.stage_counts().await.unwrap();
        assert_eq!(counts.len(), LeadStage::ALL.len());
        assert_eq!(counts[0], (LeadStage::Queued, 2));
        assert!(counts[1..].iter().all(|(_, n)| *n == 0));
    }
}
