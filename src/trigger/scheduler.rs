//! Cron-driven scheduled runs.
//!
//! Each fire drains steps 1, 2 and 3 in order, one at a time. Work left over
//! when a budget runs out waits for the next fire; nothing is re-queued here.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::campaign::model::{BatchResult, EmailStep};
use crate::campaign::service::Campaign;
use crate::error::{ConfigError, Result};

pub fn parse_schedule(expr: &str) -> std::result::Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "CAMPAIGN_SCHEDULE".into(),
        message: format!("invalid cron expression: {e}"),
    })
}

/// Run every step once in drain mode. Stops at the first store failure.
pub async fn run_scheduled(campaign: &Campaign) -> Result<Vec<BatchResult>> {
    let mut results = Vec::with_capacity(EmailStep::ALL.len());
    for step in EmailStep::ALL {
        let result = campaign.run_batch(step, campaign.drain_budget(None)).await?;
        if !result.completed_all {
            info!(
                step = step.number(),
                remaining = result.remaining,
                stopped = ?result.stopped_reason,
                "Step not drained, leftover waits for the next fire"
            );
        }
        results.push(result);
    }
    Ok(results)
}

/// Spawn the scheduler background task.
pub fn spawn_schedule(
    campaign: Arc<Campaign>,
    schedule: cron::Schedule,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Campaign schedule has no upcoming fire times, scheduler stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            info!(next = %next, "Next scheduled campaign run");
            tokio::time::sleep(wait).await;

            match run_scheduled(&campaign).await {
                Ok(results) => {
                    let sent: usize = results.iter().map(|r| r.sent).sum();
                    let failed: usize = results.iter().map(|r| r.failed).sum();
                    info!(sent, failed, "Scheduled campaign run finished");
                }
                Err(e) => error!(error = %e, "Scheduled campaign run aborted"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::leads::NewLead;
    use crate::config::CampaignConfig;
    use crate::sender::DryRunSender;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[test]
    fn parses_cron_expressions() {
        assert!(parse_schedule("0 */15 * * * *").is_ok());
        assert!(matches!(
            parse_schedule("every morning"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn scheduled_run_covers_every_step() {
        let mut config = CampaignConfig::default();
        config.processor.send_delay = Duration::ZERO;
        config.rate_limit.min_interval = Duration::ZERO;
        config.default_time_budget = Duration::from_secs(5);
        let campaign = Campaign::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DryRunSender::new("http://localhost:8080")),
            config,
        );
        campaign
            .submit(NewLead::new("a@x.com").with_email1("Hi", "Hello"))
            .await
            .unwrap();

        let results = run_scheduled(&campaign).await.unwrap();
        let steps: Vec<u8> = results.iter().map(|r| r.step.number()).collect();
        assert_eq!(steps, vec![1, 2, 3]);
        assert_eq!(results[0].sent, 1);
        // Just sent, so the second email isn't due yet.
        assert_eq!(results[1].sent, 0);
        assert!(results.iter().all(|r| r.completed_all));
    }
}
