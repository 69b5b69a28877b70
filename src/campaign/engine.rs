//! Stage transition engine: eligibility rules and the only writer of a
//! lead's stage, stage timestamps, and set membership.
//!
//! The store has no multi-key transactions, so every move is applied in a
//! fixed order:
//!
//! 1. write the lead record with its new stage (compare-and-swap)
//! 2. add the lead to the new stage set
//! 3. remove the lead from the old stage set
//!
//! A crash between 1 and 3 leaves the lead indexed under both stages (never
//! under none). Set writes are idempotent, so repeating the move, or running
//! [`crate::campaign::reconcile`], repairs it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::campaign::keys::{normalize_email, stage_set_key};
use crate::campaign::leads::{Edit, LeadRepository};
use crate::campaign::model::{EmailStep, Lead, LeadStage};
use crate::clock::Clock;
use crate::config::WindowPolicy;
use crate::error::{CampaignError, Result, StoreError};
use crate::store::KvStore;

/// Timing rule for a follow-up step: wait `days` after `anchor` was sent.
struct WaitRule {
    anchor: EmailStep,
    days: i64,
}

/// Eligibility table entry.
struct StepRule {
    step: EmailStep,
    wait: Option<WaitRule>,
}

static STEP_RULES: [StepRule; 3] = [
    StepRule {
        step: EmailStep::First,
        wait: None,
    },
    StepRule {
        step: EmailStep::Second,
        wait: Some(WaitRule {
            anchor: EmailStep::First,
            days: 3,
        }),
    },
    StepRule {
        step: EmailStep::Third,
        wait: Some(WaitRule {
            anchor: EmailStep::Second,
            days: 4,
        }),
    },
];

fn rule_for(step: EmailStep) -> &'static StepRule {
    // STEP_RULES is indexed by step number
    &STEP_RULES[usize::from(step.number() - 1)]
}

/// Why a lead may or may not receive a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Unsubscribed,
    /// The lead is not in the stage this step drains.
    WrongStage(LeadStage),
    /// The prior send time is missing from the record.
    MissingTimestamp,
    TooEarly,
    /// The `[N, N+1)` day window has passed; only a catch-up run can send now.
    WindowMissed,
}

/// Result of the opt-out operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsubscribeOutcome {
    Unsubscribed,
    AlreadyUnsubscribed,
    NotFound,
}

/// What happened after recording a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The lead stays where it is and will be retried.
    Retained { failures: u32 },
    /// The retry ceiling was hit and the lead moved to `failed`.
    GaveUp { failures: u32 },
    /// The record disappeared in the meantime.
    Missing,
}

/// Why a lead is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// The step's email went out.
    Sent,
    /// The step had no content.
    Skipped,
    OptOut,
}

/// Stage transition engine.
pub struct StageEngine {
    store: Arc<dyn KvStore>,
    leads: LeadRepository,
    clock: Arc<dyn Clock>,
    window_policy: WindowPolicy,
    max_send_failures: Option<u32>,
}

impl StageEngine {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        window_policy: WindowPolicy,
        max_send_failures: Option<u32>,
    ) -> Self {
        Self {
            leads: LeadRepository::new(Arc::clone(&store), Arc::clone(&clock)),
            store,
            clock,
            window_policy,
            max_send_failures,
        }
    }

    pub fn leads(&self) -> &LeadRepository {
        &self.leads
    }

    /// Whether `lead` may receive `step` right now.
    pub fn is_eligible(&self, lead: &Lead, step: EmailStep) -> bool {
        self.check(lead, step) == Eligibility::Eligible
    }

    /// Eligibility with the reason when it fails.
    pub fn check(&self, lead: &Lead, step: EmailStep) -> Eligibility {
        self.check_at(lead, step, self.clock.now())
    }

    fn check_at(&self, lead: &Lead, step: EmailStep, now: DateTime<Utc>) -> Eligibility {
        if lead.stage == LeadStage::Unsubscribed {
            return Eligibility::Unsubscribed;
        }
        let rule = rule_for(step);
        if lead.stage != rule.step.pending_stage() {
            return Eligibility::WrongStage(lead.stage);
        }
        let Some(wait) = &rule.wait else {
            return Eligibility::Eligible;
        };
        let Some(anchor) = lead.sent_at(wait.anchor) else {
            return Eligibility::MissingTimestamp;
        };

        let elapsed = now - anchor;
        if elapsed < Duration::days(wait.days) {
            return Eligibility::TooEarly;
        }
        match self.window_policy {
            WindowPolicy::Exact if elapsed >= Duration::days(wait.days + 1) => {
                Eligibility::WindowMissed
            }
            _ => Eligibility::Eligible,
        }
    }

    /// Move a lead from `from` to `to` after a confirmed send.
    ///
    /// Repeating a move that already happened is a no-op that re-asserts
    /// membership. Terminal leads can only be moved to `unsubscribed`.
    pub async fn transition(&self, email: &str, to: LeadStage, from: LeadStage) -> Result<Lead> {
        self.apply(email, to, from, Delivery::Sent).await
    }

    /// Advance a lead past a step that has no content, without sending.
    pub async fn advance_skipped(&self, email: &str, step: EmailStep) -> Result<Lead> {
        self.apply(
            email,
            step.completed_stage(),
            step.pending_stage(),
            Delivery::Skipped,
        )
        .await
    }

    /// Opt a lead out of every future step. Idempotent.
    pub async fn unsubscribe(&self, raw_email: &str) -> Result<UnsubscribeOutcome> {
        let Ok(email) = normalize_email(raw_email) else {
            return Ok(UnsubscribeOutcome::NotFound);
        };
        let Some(lead) = self.leads.get(&email).await? else {
            return Ok(UnsubscribeOutcome::NotFound);
        };

        if lead.stage == LeadStage::Unsubscribed {
            self.store
                .add_to_set(&stage_set_key(LeadStage::Unsubscribed), &email)
                .await?;
            return Ok(UnsubscribeOutcome::AlreadyUnsubscribed);
        }

        self.apply(&email, LeadStage::Unsubscribed, lead.stage, Delivery::OptOut)
            .await?;
        info!(email = %email, from = %lead.stage, "Lead unsubscribed");
        Ok(UnsubscribeOutcome::Unsubscribed)
    }

    /// Record a failed send. Past the retry ceiling the lead moves to `failed`,
    /// but only if it is still waiting for `step`.
    pub async fn record_send_failure(
        &self,
        email: &str,
        step: EmailStep,
        error: &str,
    ) -> Result<FailureOutcome> {
        let now = self.clock.now();
        let pending = step.pending_stage();
        let ceiling = self.max_send_failures;
        let mut gave_up_from = None;

        let updated = self
            .leads
            .update(email, |lead| {
                gave_up_from = None;
                lead.send_failures = lead.send_failures.saturating_add(1);
                lead.last_error = Some(format!("email {step}: {error}"));
                lead.updated_at = now;
                if ceiling.is_some_and(|max| lead.send_failures >= max) && lead.stage == pending {
                    gave_up_from = Some(lead.stage);
                    lead.stage = LeadStage::Failed;
                }
                Ok(Edit::Write)
            })
            .await?;
        let Some(lead) = updated else {
            return Ok(FailureOutcome::Missing);
        };

        let failures = lead.send_failures;
        match gave_up_from {
            Some(from) => {
                self.index_move(&lead, from).await?;
                warn!(email = %email, step = step.number(), failures, "Retry ceiling reached, lead marked failed");
                Ok(FailureOutcome::GaveUp { failures })
            }
            None => Ok(FailureOutcome::Retained { failures }),
        }
    }

    /// Put a lead's membership back in line with its record after finding it
    /// in `found_in`. Returns whether anything was stale.
    pub async fn reindex(&self, lead: &Lead, found_in: LeadStage) -> std::result::Result<bool, StoreError> {
        self.store
            .add_to_set(&stage_set_key(lead.stage), &lead.email)
            .await?;
        if found_in == lead.stage {
            return Ok(false);
        }
        let removed = self
            .store
            .remove_from_set(&stage_set_key(found_in), &lead.email)
            .await?;
        if removed {
            debug!(email = %lead.email, stale = %found_in, stage = %lead.stage, "Removed stale membership");
        }
        Ok(removed)
    }

    async fn apply(
        &self,
        email: &str,
        to: LeadStage,
        from: LeadStage,
        delivery: Delivery,
    ) -> Result<Lead> {
        let now = self.clock.now();
        let mut moved_from = None;

        let lead = self
            .leads
            .update(email, |lead| {
                moved_from = None;
                if lead.stage == to {
                    return Ok(Edit::Keep);
                }

                let allowed = if lead.stage.is_terminal() {
                    to == LeadStage::Unsubscribed && lead.stage != LeadStage::Unsubscribed
                } else {
                    to == LeadStage::Unsubscribed || lead.stage == from
                };
                if !allowed {
                    return Err(CampaignError::TransitionRejected {
                        email: email.to_string(),
                        stage: lead.stage.to_string(),
                        target: to.to_string(),
                    }
                    .into());
                }

                match to {
                    LeadStage::Email1Sent => lead.email1_sent_at = Some(now),
                    LeadStage::Email2Sent => lead.email2_sent_at = Some(now),
                    LeadStage::Completed => {
                        lead.completed_at = Some(now);
                        if delivery == Delivery::Sent {
                            lead.email3_sent_at = Some(now);
                        }
                    }
                    LeadStage::Unsubscribed => lead.unsubscribed_at = Some(now),
                    LeadStage::Queued | LeadStage::Failed => {}
                }
                if delivery == Delivery::Sent {
                    lead.send_failures = 0;
                    lead.last_error = None;
                }
                lead.updated_at = now;
                moved_from = Some(lead.stage);
                lead.stage = to;
                Ok(Edit::Write)
            })
            .await?
            .ok_or_else(|| CampaignError::LeadNotFound(email.to_string()))?;

        match moved_from {
            Some(previous) => self.index_move(&lead, previous).await?,
            None => {
                self.reindex(&lead, from).await?;
            }
        }
        Ok(lead)
    }

    /// After the record is written: add to the new set, then remove from the old one.
    async fn index_move(&self, lead: &Lead, from: LeadStage) -> std::result::Result<(), StoreError> {
        self.store
            .add_to_set(&stage_set_key(lead.stage), &lead.email)
            .await?;
        if from != lead.stage {
            self.store
                .remove_from_set(&stage_set_key(from), &lead.email)
                .await?;
        }
        debug!(email = %lead.email, from = %from, to = %lead.stage, "Lead transitioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::campaign::leads::NewLead;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::store::MemoryStore;

    /// Hands out a stale read: the next `get` returns the current value but
    /// only after a pause, so another writer can land in between.
    struct StaleReadStore {
        inner: MemoryStore,
        pause_next_get: AtomicBool,
    }

    impl StaleReadStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                pause_next_get: AtomicBool::new(false),
            }
        }

        fn pause_next_get(&self) {
            self.pause_next_get.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl KvStore for StaleReadStore {
        async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
            let value = self.inner.get(key).await;
            if self.pause_next_get.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            value
        }
        async fn set(&self, key: &str, value: &str) -> std::result::Result<(), StoreError> {
            self.inner.set(key, value).await
        }
        async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError> {
            self.inner.delete(key).await
        }
        async fn set_members(&self, set_key: &str) -> std::result::Result<Vec<String>, StoreError> {
            self.inner.set_members(set_key).await
        }
        async fn add_to_set(&self, set_key: &str, member: &str) -> std::result::Result<bool, StoreError> {
            self.inner.add_to_set(set_key, member).await
        }
        async fn remove_from_set(&self, set_key: &str, member: &str) -> std::result::Result<bool, StoreError> {
            self.inner.remove_from_set(set_key, member).await
        }
        async fn set_cardinality(&self, set_key: &str) -> std::result::Result<usize, StoreError> {
            self.inner.set_cardinality(set_key).await
        }
        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&str>,
            new: &str,
        ) -> std::result::Result<bool, StoreError> {
            self.inner.compare_and_swap(key, expected, new).await
        }
    }

    fn racy_engine(max_failures: Option<u32>) -> (Arc<StaleReadStore>, Arc<StageEngine>) {
        let store = Arc::new(StaleReadStore::new());
        let clock = Arc::new(ManualClock::new("2026-03-02T09:00:00Z".parse().unwrap()));
        let engine = Arc::new(StageEngine::new(
            store.clone(),
            clock,
            WindowPolicy::Exact,
            max_failures,
        ));
        (store, engine)
    }

    async fn stages_listing(store: &StaleReadStore, email: &str) -> Vec<LeadStage> {
        let mut found = Vec::new();
        for stage in LeadStage::ALL {
            if store
                .set_members(&stage_set_key(stage))
                .await
                .unwrap()
                .iter()
                .any(|m| m == email)
            {
                found.push(stage);
            }
        }
        found
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        engine: StageEngine,
    }

    fn fixture(policy: WindowPolicy, max_failures: Option<u32>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            "2026-03-02T09:00:00Z".parse().unwrap(),
        ));
        let engine = StageEngine::new(store.clone(), clock.clone(), policy, max_failures);
        Fixture {
            store,
            clock,
            engine,
        }
    }

    /// Every lead sits in exactly one set and it matches the record.
    async fn assert_indexed_once(f: &Fixture, email: &str) {
        let lead = f.engine.leads().get(email).await.unwrap().unwrap();
        let mut found = Vec::new();
        for stage in LeadStage::ALL {
            if f
                .store
                .set_members(&stage_set_key(stage))
                .await
                .unwrap()
                .iter()
                .any(|m| m == email)
            {
                found.push(stage);
            }
        }
        assert_eq!(found, vec![lead.stage], "membership for {email}");
    }

    fn lead_at(stage: LeadStage, email1: Option<DateTime<Utc>>, email2: Option<DateTime<Utc>>) -> Lead {
        let mut lead = Lead::new("a@x.com", Utc::now());
        lead.stage = stage;
        lead.email1_sent_at = email1;
        lead.email2_sent_at = email2;
        lead
    }

    #[test]
    fn first_step_requires_queued() {
        let f = fixture(WindowPolicy::Exact, None);
        let now = f.clock.now();
        assert!(f.engine.is_eligible(&lead_at(LeadStage::Queued, None, None), EmailStep::First));
        assert_eq!(
            f.engine.check(&lead_at(LeadStage::Email1Sent, Some(now), None), EmailStep::First),
            Eligibility::WrongStage(LeadStage::Email1Sent)
        );
    }

    #[test]
    fn second_step_window_boundaries() {
        let f = fixture(WindowPolicy::Exact, None);
        let now = f.clock.now();
        let at = |ago: Duration| lead_at(LeadStage::Email1Sent, Some(now - ago), None);

        assert!(f.engine.is_eligible(&at(Duration::days(3)), EmailStep::Second));
        assert_eq!(
            f.engine.check(&at(Duration::days(3) - Duration::minutes(1)), EmailStep::Second),
            Eligibility::TooEarly
        );
        assert!(f.engine.is_eligible(&at(Duration::days(4) - Duration::minutes(1)), EmailStep::Second));
        assert_eq!(
            f.engine.check(&at(Duration::days(4) + Duration::minutes(1)), EmailStep::Second),
            Eligibility::WindowMissed
        );
    }

    #[test]
    fn third_step_window_boundaries() {
        let f = fixture(WindowPolicy::Exact, None);
        let now = f.clock.now();
        let at = |ago: Duration| {
            lead_at(LeadStage::Email2Sent, Some(now - Duration::days(10)), Some(now - ago))
        };

        assert!(!f.engine.is_eligible(&at(Duration::days(3)), EmailStep::Third));
        assert!(f.engine.is_eligible(&at(Duration::days(4)), EmailStep::Third));
        assert!(!f.engine.is_eligible(&at(Duration::days(5)), EmailStep::Third));
    }

    #[test]
    fn catch_up_policy_drops_upper_bound() {
        let f = fixture(WindowPolicy::CatchUp, None);
        let now = f.clock.now();
        let lead = lead_at(LeadStage::Email1Sent, Some(now - Duration::days(9)), None);
        assert!(f.engine.is_eligible(&lead, EmailStep::Second));

        let early = lead_at(LeadStage::Email1Sent, Some(now - Duration::days(2)), None);
        assert!(!f.engine.is_eligible(&early, EmailStep::Second));
    }

    #[test]
    fn unsubscribed_is_never_eligible() {
        let f = fixture(WindowPolicy::CatchUp, None);
        let now = f.clock.now();
        let lead = lead_at(LeadStage::Unsubscribed, Some(now - Duration::days(3)), None);
        for step in EmailStep::ALL {
            assert_eq!(f.engine.check(&lead, step), Eligibility::Unsubscribed);
        }
    }

    #[test]
    fn missing_anchor_is_not_eligible() {
        let f = fixture(WindowPolicy::Exact, None);
        let lead = lead_at(LeadStage::Email1Sent, None, None);
        assert_eq!(
            f.engine.check(&lead, EmailStep::Second),
            Eligibility::MissingTimestamp
        );
    }

    #[tokio::test]
    async fn transition_moves_record_and_membership_together() {
        let f = fixture(WindowPolicy::Exact, None);
        f.engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();

        let lead = f
            .engine
            .transition("a@x.com", LeadStage::Email1Sent, LeadStage::Queued)
            .await
            .unwrap();
        assert_eq!(lead.stage, LeadStage::Email1Sent);
        assert_eq!(lead.email1_sent_at, Some(f.clock.now()));
        assert_indexed_once(&f, "a@x.com").await;

        // Replaying the same move is harmless.
        f.engine
            .transition("a@x.com", LeadStage::Email1Sent, LeadStage::Queued)
            .await
            .unwrap();
        assert_indexed_once(&f, "a@x.com").await;
    }

    #[tokio::test]
    async fn transition_unknown_lead_is_not_found() {
        let f = fixture(WindowPolicy::Exact, None);
        let err = f
            .engine
            .transition("ghost@x.com", LeadStage::Email1Sent, LeadStage::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Campaign(CampaignError::LeadNotFound(_))));
    }

    #[tokio::test]
    async fn transition_rejects_stale_source_stage() {
        let f = fixture(WindowPolicy::Exact, None);
        f.engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();

        let err = f
            .engine
            .transition("a@x.com", LeadStage::Email2Sent, LeadStage::Email1Sent)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Campaign(CampaignError::TransitionRejected { .. })
        ));
        assert_indexed_once(&f, "a@x.com").await;
    }

    #[tokio::test]
    async fn crash_duplicate_is_repaired_by_replay() {
        let f = fixture(WindowPolicy::Exact, None);
        f.engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();

        // Simulate a crash after the record write and the add, before the remove.
        let mut lead = f.engine.leads().get("a@x.com").await.unwrap().unwrap();
        lead.stage = LeadStage::Email1Sent;
        f.engine.leads().put(&lead).await.unwrap();
        f.store.add_to_set("stage:email1_sent", "a@x.com").await.unwrap();
        assert_eq!(f.store.set_cardinality("stage:queued").await.unwrap(), 1);

        f.engine
            .transition("a@x.com", LeadStage::Email1Sent, LeadStage::Queued)
            .await
            .unwrap();
        assert_indexed_once(&f, "a@x.com").await;
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let f = fixture(WindowPolicy::Exact, None);
        f.engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();
        f.engine
            .transition("a@x.com", LeadStage::Email1Sent, LeadStage::Queued)
            .await
            .unwrap();

        assert_eq!(
            f.engine.unsubscribe("A@X.com").await.unwrap(),
            UnsubscribeOutcome::Unsubscribed
        );
        assert_eq!(
            f.engine.unsubscribe("a@x.com").await.unwrap(),
            UnsubscribeOutcome::AlreadyUnsubscribed
        );
        assert_eq!(
            f.engine.unsubscribe("nobody@x.com").await.unwrap(),
            UnsubscribeOutcome::NotFound
        );

        let lead = f.engine.leads().get("a@x.com").await.unwrap().unwrap();
        assert_eq!(lead.stage, LeadStage::Unsubscribed);
        assert!(lead.unsubscribed_at.is_some());
        assert_eq!(f.store.set_cardinality("stage:unsubscribed").await.unwrap(), 1);
        assert_indexed_once(&f, "a@x.com").await;
    }

    #[tokio::test]
    async fn unsubscribed_lead_cannot_advance() {
        let f = fixture(WindowPolicy::Exact, None);
        f.engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();
        f.engine.unsubscribe("a@x.com").await.unwrap();

        let err = f
            .engine
            .transition("a@x.com", LeadStage::Email1Sent, LeadStage::Queued)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Campaign(CampaignError::TransitionRejected { .. })
        ));
        assert_indexed_once(&f, "a@x.com").await;
    }

    #[tokio::test]
    async fn skipped_third_step_completes_without_send_timestamp() {
        let f = fixture(WindowPolicy::Exact, None);
        f.engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();
        f.engine
            .transition("a@x.com", LeadStage::Email1Sent, LeadStage::Queued)
            .await
            .unwrap();
        f.engine
            .transition("a@x.com", LeadStage::Email2Sent, LeadStage::Email1Sent)
            .await
            .unwrap();

        let lead = f
            .engine
            .advance_skipped("a@x.com", EmailStep::Third)
            .await
            .unwrap();
        assert_eq!(lead.stage, LeadStage::Completed);
        assert!(lead.completed_at.is_some());
        assert!(lead.email3_sent_at.is_none());
        assert_indexed_once(&f, "a@x.com").await;
    }

    #[tokio::test]
    async fn failures_are_retained_below_ceiling() {
        let f = fixture(WindowPolicy::Exact, Some(2));
        f.engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();

        assert_eq!(
            f.engine
                .record_send_failure("a@x.com", EmailStep::First, "smtp down")
                .await
                .unwrap(),
            FailureOutcome::Retained { failures: 1 }
        );
        let lead = f.engine.leads().get("a@x.com").await.unwrap().unwrap();
        assert_eq!(lead.stage, LeadStage::Queued);
        assert_eq!(lead.last_error.as_deref(), Some("email 1: smtp down"));

        assert_eq!(
            f.engine
                .record_send_failure("a@x.com", EmailStep::First, "smtp down")
                .await
                .unwrap(),
            FailureOutcome::GaveUp { failures: 2 }
        );
        assert_indexed_once(&f, "a@x.com").await;
        assert_eq!(f.store.set_cardinality("stage:failed").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn successful_send_resets_failure_count() {
        let f = fixture(WindowPolicy::Exact, None);
        f.engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();
        f.engine
            .record_send_failure("a@x.com", EmailStep::First, "boom")
            .await
            .unwrap();

        let lead = f
            .engine
            .transition("a@x.com", LeadStage::Email1Sent, LeadStage::Queued)
            .await
            .unwrap();
        assert_eq!(lead.send_failures, 0);
        assert!(lead.last_error.is_none());
    }

    #[tokio::test]
    async fn resubmission_racing_a_transition_keeps_the_new_stage() {
        let (store, engine) = racy_engine(None);
        engine
            .leads()
            .submit(NewLead::new("a@x.com").with_email1("Hi", "v1"))
            .await
            .unwrap();

        store.pause_next_get();
        let resubmit = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .leads()
                    .submit(NewLead::new("a@x.com").with_email2("Again", "v2"))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        engine
            .transition("a@x.com", LeadStage::Email1Sent, LeadStage::Queued)
            .await
            .unwrap();
        resubmit.await.unwrap().unwrap();

        let lead = engine.leads().get("a@x.com").await.unwrap().unwrap();
        assert_eq!(lead.stage, LeadStage::Email1Sent);
        assert!(lead.email1_sent_at.is_some());
        assert_eq!(lead.email2.as_ref().unwrap().body, "v2");
        assert_eq!(stages_listing(&store, "a@x.com").await, vec![LeadStage::Email1Sent]);
    }

    #[tokio::test]
    async fn failure_racing_an_opt_out_keeps_lead_unsubscribed() {
        let (store, engine) = racy_engine(Some(1));
        engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();

        store.pause_next_get();
        let failure = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .record_send_failure("a@x.com", EmailStep::First, "smtp down")
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(
            engine.unsubscribe("a@x.com").await.unwrap(),
            UnsubscribeOutcome::Unsubscribed
        );
        assert_eq!(
            failure.await.unwrap().unwrap(),
            FailureOutcome::Retained { failures: 1 }
        );

        let lead = engine.leads().get("a@x.com").await.unwrap().unwrap();
        assert_eq!(lead.stage, LeadStage::Unsubscribed);
        assert!(lead.unsubscribed_at.is_some());
        assert_eq!(lead.send_failures, 1);
        assert_eq!(stages_listing(&store, "a@x.com").await, vec![LeadStage::Unsubscribed]);
    }

    #[tokio::test]
    async fn opt_out_keeps_failure_history() {
        let f = fixture(WindowPolicy::Exact, None);
        f.engine.leads().submit(NewLead::new("a@x.com")).await.unwrap();
        f.engine
            .record_send_failure("a@x.com", EmailStep::First, "boom")
            .await
            .unwrap();

        f.engine.unsubscribe("a@x.com").await.unwrap();
        let lead = f.engine.leads().get("a@x.com").await.unwrap().unwrap();
        assert_eq!(lead.send_failures, 1);
        assert_eq!(lead.last_error.as_deref(), Some("email 1: boom"));
        assert!(lead.email1_sent_at.is_none());
    }
}
