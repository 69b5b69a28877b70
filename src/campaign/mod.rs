//! Drip campaign core: lead model, stage engine, rate limiter and batch processor.

pub mod engine;
pub mod keys;
pub mod leads;
pub mod model;
pub mod processor;
pub mod rate_limiter;
pub mod reconcile;
pub mod service;

pub use engine::{Eligibility, StageEngine, UnsubscribeOutcome};
pub use leads::{LeadRepository, NewLead, SubmitOutcome};
pub use model::{BatchResult, EmailContent, EmailStep, Lead, LeadStage, StopReason};
pub use processor::{BatchBudget, BatchProcessor};
pub use rate_limiter::{RateLimiter, SlotDecision, StoreRateLimiter};
pub use reconcile::ReconcileReport;
pub use service::Campaign;
