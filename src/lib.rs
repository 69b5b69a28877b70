//! Drip campaign: staged outbound email with a shared send throttle and
//! resumable batches.

pub mod campaign;
pub mod clock;
pub mod config;
pub mod error;
pub mod sender;
pub mod store;
pub mod trigger;
