//! Configuration types, built from environment variables.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// How the day window for follow-up emails is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowPolicy {
    /// Send only while `N <= days_since < N + 1`. A missed day strands the lead.
    #[default]
    Exact,
    /// Send any time once `days_since >= N`.
    CatchUp,
}

impl FromStr for WindowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(WindowPolicy::Exact),
            "catch_up" | "catchup" | "catch-up" => Ok(WindowPolicy::CatchUp),
            other => Err(ConfigError::InvalidValue {
                key: "CAMPAIGN_WINDOW_POLICY".into(),
                message: format!("expected 'exact' or 'catch_up', got '{other}'"),
            }),
        }
    }
}

/// Rate limiter tuning.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum spacing between any two sends, across all processes.
    pub min_interval: Duration,
    /// Longest a single lead waits for a slot before the batch gives up.
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_wait: Duration::from_millis(3000),
        }
    }
}

/// Batch processor tuning.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Extra pause after every successful send.
    pub send_delay: Duration,
    /// Bound on a single call to the send collaborator.
    pub send_timeout: Duration,
    /// Move a lead to `failed` after this many consecutive send failures.
    pub max_send_failures: Option<u32>,
    /// Persisted cursors older than this are ignored.
    pub cursor_ttl: Duration,
    pub window_policy: WindowPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            send_delay: Duration::from_millis(100),
            send_timeout: Duration::from_secs(20),
            max_send_failures: None,
            cursor_ttl: Duration::from_secs(3600),
            window_policy: WindowPolicy::Exact,
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    /// Shared secret guarding trigger and admin endpoints.
    pub shared_secret: Option<SecretString>,
    pub db_path: String,
    pub port: u16,
    /// Base URL for opt-out links in outgoing mail.
    pub public_url: String,
    /// Page size for manual runs that don't specify one.
    pub default_batch_size: usize,
    /// Wall-clock budget for drain runs that don't specify one.
    pub default_time_budget: Duration,
    /// Cron expression for scheduled runs (`None` disables scheduling).
    pub schedule: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub processor: ProcessorConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            db_path: "./data/campaign.db".to_string(),
            port: 8080,
            public_url: "http://localhost:8080".to_string(),
            default_batch_size: 50,
            default_time_budget: Duration::from_millis(50_000),
            schedule: None,
            rate_limit: RateLimitConfig::default(),
            processor: ProcessorConfig::default(),
        }
    }
}

impl CampaignConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let shared_secret = std::env::var("CAMPAIGN_SHARED_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from);

        let db_path = std::env::var("CAMPAIGN_DB_PATH").unwrap_or(defaults.db_path);
        let port = env_parse("CAMPAIGN_PORT")?.unwrap_or(defaults.port);
        let public_url = std::env::var("CAMPAIGN_PUBLIC_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or(defaults.public_url);

        let default_batch_size =
            env_parse("CAMPAIGN_BATCH_SIZE")?.unwrap_or(defaults.default_batch_size);
        if default_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CAMPAIGN_BATCH_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }

        let default_time_budget = env_millis("CAMPAIGN_TIME_BUDGET_MS")?
            .unwrap_or(defaults.default_time_budget);

        let schedule = std::env::var("CAMPAIGN_SCHEDULE")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if let Some(ref expr) = schedule {
            crate::trigger::scheduler::parse_schedule(expr)?;
        }

        let rate_limit = RateLimitConfig {
            min_interval: env_millis("CAMPAIGN_MIN_SEND_INTERVAL_MS")?
                .unwrap_or(defaults.rate_limit.min_interval),
            max_wait: env_millis("CAMPAIGN_MAX_SLOT_WAIT_MS")?
                .unwrap_or(defaults.rate_limit.max_wait),
        };

        let processor = ProcessorConfig {
            send_delay: env_millis("CAMPAIGN_SEND_DELAY_MS")?
                .unwrap_or(defaults.processor.send_delay),
            send_timeout: env_parse::<u64>("CAMPAIGN_SEND_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.processor.send_timeout),
            max_send_failures: env_parse("CAMPAIGN_MAX_SEND_FAILURES")?,
            cursor_ttl: env_parse::<u64>("CAMPAIGN_CURSOR_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.processor.cursor_ttl),
            window_policy: match std::env::var("CAMPAIGN_WINDOW_POLICY") {
                Ok(s) => s.parse()?,
                Err(_) => WindowPolicy::default(),
            },
        };

        Ok(Self {
            shared_secret,
            db_path,
            port,
            public_url,
            default_batch_size,
            default_time_budget,
            schedule,
            rate_limit,
            processor,
        })
    }
}

/// SMTP transport configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMTP_HOST` is not set (sends become dry runs).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_send_ceiling() {
        let config = CampaignConfig::default();
        assert_eq!(config.rate_limit.min_interval, Duration::from_millis(500));
        assert_eq!(config.rate_limit.max_wait, Duration::from_millis(3000));
        assert_eq!(config.processor.window_policy, WindowPolicy::Exact);
        assert!(config.processor.max_send_failures.is_none());
    }

    #[test]
    fn window_policy_parses() {
        assert_eq!("exact".parse::<WindowPolicy>().unwrap(), WindowPolicy::Exact);
        assert_eq!("catch_up".parse::<WindowPolicy>().unwrap(), WindowPolicy::CatchUp);
        assert_eq!("Catch-Up".parse::<WindowPolicy>().unwrap(), WindowPolicy::CatchUp);
        assert!("sometimes".parse::<WindowPolicy>().is_err());
    }
}
