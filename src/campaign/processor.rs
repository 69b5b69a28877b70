//! Batch processor: drains one step's pending set under a budget.
//!
//! Leads are handled strictly one at a time, oldest first: check, acquire a
//! send slot, send, then advance. A lead only advances after a confirmed send
//! result, so a run killed mid-send leaves it pending for the next run.
//!
//! Leads that stay pending (skipped or failed) are remembered by address in a
//! cursor persisted per step, so the next invocation passes over them instead
//! of re-reading the same page. Membership changes between invocations cannot
//! make a lead be passed over unexamined. When a pass reaches the end of the
//! pending set the cursor is cleared.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::campaign::engine::{Eligibility, FailureOutcome, StageEngine};
use crate::campaign::keys::{cursor_key, stage_set_key};
use crate::campaign::model::{BatchResult, EmailStep, LeadFailure, StopReason};
use crate::campaign::rate_limiter::{RateLimiter, SlotDecision};
use crate::clock::Clock;
use crate::config::ProcessorConfig;
use crate::error::{CampaignError, Error, Result, SendError, StoreError};
use crate::sender::EmailSender;
use crate::store::KvStore;

/// How much work one invocation may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchBudget {
    /// Examine at most `batch_size` leads.
    Page { batch_size: usize },
    /// Keep going until the wall-clock budget is spent.
    Drain { time_budget: Duration },
}

/// Resume point for a logical run spanning several invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCursor {
    pub run_id: Uuid,
    /// Leads examined earlier in this pass that stayed pending.
    #[serde(default)]
    pub examined: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-lead result inside the loop.
enum LeadOutcome {
    Sent,
    /// Advanced past a step with no content.
    Advanced,
    Skipped { retained: bool },
    Failed { retained: bool },
    /// No send slot; stop the batch and leave this lead for next time.
    Denied,
}

/// Runs batches for any step.
pub struct BatchProcessor {
    store: Arc<dyn KvStore>,
    engine: Arc<StageEngine>,
    limiter: Arc<dyn RateLimiter>,
    sender: Arc<dyn EmailSender>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
    max_slot_wait: Duration,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn KvStore>,
        engine: Arc<StageEngine>,
        limiter: Arc<dyn RateLimiter>,
        sender: Arc<dyn EmailSender>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
        max_slot_wait: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            limiter,
            sender,
            clock,
            config,
            max_slot_wait,
        }
    }

    /// Process `step`'s pending leads within `budget`.
    ///
    /// Store failures abort the batch with an error; everything scoped to a
    /// single lead is recorded in the result and the batch carries on.
    pub async fn run_batch(&self, step: EmailStep, budget: BatchBudget) -> Result<BatchResult> {
        let pending_stage = step.pending_stage();
        let members = self.store.set_members(&stage_set_key(pending_stage)).await?;

        let now = self.clock.now();
        let cursor = self.load_cursor(step, now).await?;
        let resumed = cursor.is_some();
        let (run_id, started_at, examined) = match cursor {
            Some(c) => (c.run_id, c.started_at, c.examined),
            None => (Uuid::new_v4(), now, Vec::new()),
        };

        // Leads that left the set since the last invocation are dropped from the cursor.
        let seen: HashSet<&str> = examined.iter().map(String::as_str).collect();
        let mut kept: Vec<String> = members
            .iter()
            .filter(|m| seen.contains(m.as_str()))
            .cloned()
            .collect();
        let queue: Vec<&String> = members
            .iter()
            .filter(|m| !seen.contains(m.as_str()))
            .collect();

        let mut result = BatchResult::new(step, run_id);
        info!(
            run_id = %run_id,
            step = step.number(),
            pending = members.len(),
            already_examined = kept.len(),
            resumed,
            "Batch started"
        );

        let started = Instant::now();
        let mut next = 0usize;

        while next < queue.len() {
            let over_budget = match budget {
                BatchBudget::Page { batch_size } => result.processed >= batch_size,
                BatchBudget::Drain { time_budget } => started.elapsed() >= time_budget,
            };
            if over_budget {
                result.stopped_reason = StopReason::Budget;
                break;
            }

            let email = queue[next];
            let outcome = match self.process_lead(step, email, &mut result).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(run_id = %run_id, step = step.number(), email = %email, error = %e, "Batch aborted");
                    return Err(e);
                }
            };

            let retained = match outcome {
                LeadOutcome::Denied => {
                    result.stopped_reason = StopReason::RateLimited;
                    break;
                }
                LeadOutcome::Sent => {
                    result.sent += 1;
                    false
                }
                LeadOutcome::Advanced => {
                    result.advanced += 1;
                    result.skipped += 1;
                    false
                }
                LeadOutcome::Skipped { retained } => {
                    result.skipped += 1;
                    retained
                }
                LeadOutcome::Failed { retained } => {
                    result.failed += 1;
                    retained
                }
            };
            if retained {
                kept.push(email.clone());
            }
            result.processed += 1;
            next += 1;
        }

        result.remaining = queue.len() - next;
        result.completed_all = result.remaining == 0;

        if result.completed_all {
            result.stopped_reason = StopReason::Exhausted;
            self.store.delete(&cursor_key(step)).await?;
        } else {
            let cursor = BatchCursor {
                run_id,
                examined: kept,
                started_at,
                updated_at: self.clock.now(),
            };
            self.store
                .set(&cursor_key(step), &serde_json::to_string(&cursor).map_err(StoreError::from)?)
                .await?;
        }

        info!(
            run_id = %run_id,
            step = step.number(),
            processed = result.processed,
            sent = result.sent,
            advanced = result.advanced,
            skipped = result.skipped,
            failed = result.failed,
            remaining = result.remaining,
            completed_all = result.completed_all,
            stopped = ?result.stopped_reason,
            "Batch finished"
        );
        Ok(result)
    }

    /// The stored cursor for `step`, unless it has gone stale.
    pub async fn load_cursor(
        &self,
        step: EmailStep,
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<BatchCursor>, StoreError> {
        let Some(raw) = self.store.get(&cursor_key(step)).await? else {
            return Ok(None);
        };
        let cursor: BatchCursor = match serde_json::from_str(&raw) {
            Ok(c) => c,
            Err(e) => {
                warn!(step = step.number(), error = %e, "Discarding unreadable batch cursor");
                return Ok(None);
            }
        };
        let ttl = chrono::Duration::from_std(self.config.cursor_ttl).unwrap_or(chrono::Duration::MAX);
        if now - cursor.updated_at > ttl {
            debug!(step = step.number(), run_id = %cursor.run_id, "Batch cursor expired");
            return Ok(None);
        }
        Ok(Some(cursor))
    }

    async fn process_lead(
        &self,
        step: EmailStep,
        email: &str,
        result: &mut BatchResult,
    ) -> Result<LeadOutcome> {
        let pending_stage = step.pending_stage();

        let Some(lead) = self.engine.leads().get(email).await? else {
            record(result, email, step, "lead record missing");
            return Ok(LeadOutcome::Failed { retained: true });
        };

        match self.engine.check(&lead, step) {
            Eligibility::Eligible => {}
            Eligibility::Unsubscribed | Eligibility::WrongStage(_) => {
                // Left over from an interrupted move; the record wins.
                let removed = self.engine.reindex(&lead, pending_stage).await?;
                debug!(email = %email, stage = %lead.stage, step = step.number(), "Skipped: not in this step's stage");
                return Ok(LeadOutcome::Skipped { retained: !removed });
            }
            Eligibility::WindowMissed => {
                warn!(email = %email, step = step.number(), "Send window missed, lead needs a catch-up run");
                return Ok(LeadOutcome::Skipped { retained: true });
            }
            reason => {
                debug!(email = %email, step = step.number(), reason = ?reason, "Skipped: not eligible yet");
                return Ok(LeadOutcome::Skipped { retained: true });
            }
        }

        if lead.content(step).is_none() {
            if step == EmailStep::First {
                let err = SendError::MissingContent { step: step.number() };
                warn!(email = %email, "No content for the first email, nothing sent");
                record(result, email, step, &err.to_string());
                return Ok(LeadOutcome::Failed { retained: true });
            }
            return match self.engine.advance_skipped(email, step).await {
                Ok(lead) => {
                    info!(email = %email, step = step.number(), stage = %lead.stage, "No content, advanced without sending");
                    Ok(LeadOutcome::Advanced)
                }
                Err(Error::Store(e)) => Err(e.into()),
                Err(e) => {
                    record(result, email, step, &e.to_string());
                    Ok(LeadOutcome::Failed { retained: false })
                }
            };
        }

        if let SlotDecision::Denied = self.limiter.acquire_send_slot(self.max_slot_wait).await {
            warn!(email = %email, step = step.number(), "Send slot denied, stopping batch");
            return Ok(LeadOutcome::Denied);
        }

        let send_error = match tokio::time::timeout(self.config.send_timeout, self.sender.send(&lead, step)).await {
            Ok(Ok(receipt)) => match receipt.transport_id.filter(|id| !id.trim().is_empty()) {
                Some(transport_id) => {
                    let outcome = self.advance_after_send(step, email, &transport_id, result).await?;
                    if !self.config.send_delay.is_zero() {
                        tokio::time::sleep(self.config.send_delay).await;
                    }
                    return Ok(outcome);
                }
                None => SendError::Transport {
                    reason: "send returned no transport id".into(),
                },
            },
            Ok(Err(e)) => e,
            Err(_) => SendError::Timeout {
                timeout: self.config.send_timeout,
            },
        };

        warn!(email = %email, step = step.number(), error = %send_error, "Send failed, lead kept for retry");
        record(result, email, step, &send_error.to_string());
        let retained = match self
            .engine
            .record_send_failure(email, step, &send_error.to_string())
            .await?
        {
            FailureOutcome::Retained { .. } | FailureOutcome::Missing => true,
            FailureOutcome::GaveUp { .. } => false,
        };
        Ok(LeadOutcome::Failed { retained })
    }

    async fn advance_after_send(
        &self,
        step: EmailStep,
        email: &str,
        transport_id: &str,
        result: &mut BatchResult,
    ) -> Result<LeadOutcome> {
        match self
            .engine
            .transition(email, step.completed_stage(), step.pending_stage())
            .await
        {
            Ok(_) => {
                info!(email = %email, step = step.number(), transport_id = %transport_id, "Email sent, lead advanced");
                Ok(LeadOutcome::Sent)
            }
            Err(Error::Store(e)) => Err(e.into()),
            Err(e) => {
                // Sent but not advanced; the lead may receive this step again.
                let retained = !matches!(
                    e,
                    Error::Campaign(CampaignError::TransitionRejected { .. })
                );
                error!(email = %email, step = step.number(), transport_id = %transport_id, error = %e, "Sent but could not advance lead");
                record(result, email, step, &e.to_string());
                Ok(LeadOutcome::Failed { retained })
            }
        }
    }
}

fn record(result: &mut BatchResult, email: &str, step: EmailStep, error: &str) {
    result.errors.push(LeadFailure {
        email: email.to_string(),
        step,
        error: error.to_string(),
    });
}
