//! `Campaign`: one handle over the store, engine, limiter, sender and
//! processor, shared by the HTTP routes and the scheduler.

use std::sync::Arc;

use crate::campaign::engine::{StageEngine, UnsubscribeOutcome};
use crate::campaign::leads::{NewLead, SubmitOutcome};
use crate::campaign::model::{BatchResult, EmailStep, LeadStage};
use crate::campaign::processor::{BatchBudget, BatchProcessor};
use crate::campaign::rate_limiter::{RateLimiter, StoreRateLimiter};
use crate::campaign::reconcile::{ReconcileReport, reconcile};
use crate::clock::{Clock, SystemClock};
use crate::config::CampaignConfig;
use crate::error::{Result, StoreError};
use crate::sender::EmailSender;
use crate::store::KvStore;

pub struct Campaign {
    store: Arc<dyn KvStore>,
    engine: Arc<StageEngine>,
    processor: BatchProcessor,
    config: CampaignConfig,
}

impl Campaign {
    /// Wire a campaign with the system clock and a store-backed rate limiter.
    pub fn new(store: Arc<dyn KvStore>, sender: Arc<dyn EmailSender>, config: CampaignConfig) -> Self {
        let limiter = Arc::new(StoreRateLimiter::new(
            Arc::clone(&store),
            config.rate_limit.min_interval,
        ));
        Self::with_parts(store, sender, limiter, Arc::new(SystemClock), config)
    }

    pub fn with_parts(
        store: Arc<dyn KvStore>,
        sender: Arc<dyn EmailSender>,
        limiter: Arc<dyn RateLimiter>,
        clock: Arc<dyn Clock>,
        config: CampaignConfig,
    ) -> Self {
        let engine = Arc::new(StageEngine::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.processor.window_policy,
            config.processor.max_send_failures,
        ));
        let processor = BatchProcessor::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            limiter,
            sender,
            clock,
            config.processor.clone(),
            config.rate_limit.max_wait,
        );
        Self {
            store,
            engine,
            processor,
            config,
        }
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    pub fn engine(&self) -> &StageEngine {
        &self.engine
    }

    pub async fn run_batch(&self, step: EmailStep, budget: BatchBudget) -> Result<BatchResult> {
        self.processor.run_batch(step, budget).await
    }

    /// Paged budget, falling back to the configured page size.
    pub fn page_budget(&self, batch_size: Option<usize>) -> BatchBudget {
        BatchBudget::Page {
            batch_size: batch_size
                .filter(|n| *n > 0)
                .unwrap_or(self.config.default_batch_size),
        }
    }

    /// Drain budget, falling back to the configured time budget.
    pub fn drain_budget(&self, time_budget_ms: Option<u64>) -> BatchBudget {
        BatchBudget::Drain {
            time_budget: time_budget_ms
                .filter(|ms| *ms > 0)
                .map(std::time::Duration::from_millis)
                .unwrap_or(self.config.default_time_budget),
        }
    }

    pub async fn submit(&self, lead: NewLead) -> Result<SubmitOutcome> {
        self.engine.leads().submit(lead).await
    }

    pub async fn unsubscribe(&self, email: &str) -> Result<UnsubscribeOutcome> {
        self.engine.unsubscribe(email).await
    }

    pub async fn stage_counts(&self) -> std::result::Result<Vec<(LeadStage, usize)>, StoreError> {
        self.engine.leads().stage_counts().await
    }

    pub async fn reconcile(&self) -> std::result::Result<ReconcileReport, StoreError> {
        reconcile(&self.store, &self.engine).await
    }
}
