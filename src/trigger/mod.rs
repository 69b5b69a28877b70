//! Entry points that start batch runs: HTTP routes and the cron scheduler.

pub mod auth;
pub mod routes;
pub mod scheduler;

pub use routes::{AppState, campaign_routes};
pub use scheduler::{run_scheduled, spawn_schedule};
