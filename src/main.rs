use std::sync::Arc;

use anyhow::Context;

use drip_campaign::campaign::Campaign;
use drip_campaign::config::{CampaignConfig, SmtpConfig};
use drip_campaign::sender::{DryRunSender, EmailSender, SmtpSender};
use drip_campaign::store::{KvStore, LibSqlStore};
use drip_campaign::trigger::{campaign_routes, scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = CampaignConfig::from_env().context("invalid campaign configuration")?;

    eprintln!("📬 Drip Campaign v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/campaign", config.port);
    eprintln!("   Opt-out: {}/unsubscribe", config.public_url);
    if config.shared_secret.is_none() {
        eprintln!("   Warning: CAMPAIGN_SHARED_SECRET not set, guarded endpoints will refuse requests");
    }

    // ── Store ────────────────────────────────────────────────────────────
    let store: Arc<dyn KvStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&config.db_path))
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path))?,
    );
    eprintln!("   Database: {}", config.db_path);

    // ── Sender ───────────────────────────────────────────────────────────
    let sender: Arc<dyn EmailSender> = match SmtpConfig::from_env() {
        Some(smtp) => {
            eprintln!("   SMTP: {}:{} as {}", smtp.host, smtp.port, smtp.from_address);
            Arc::new(SmtpSender::new(&smtp, config.public_url.clone())?)
        }
        None => {
            eprintln!("   SMTP: not configured, sends are dry runs");
            Arc::new(DryRunSender::new(config.public_url.clone()))
        }
    };

    let port = config.port;
    let schedule = config.schedule.clone();
    let campaign = Arc::new(Campaign::new(store, sender, config));

    // ── Schedule ─────────────────────────────────────────────────────────
    let _schedule_handle = match schedule {
        Some(expr) => {
            eprintln!("   Schedule: {expr}");
            let schedule = scheduler::parse_schedule(&expr)?;
            Some(scheduler::spawn_schedule(Arc::clone(&campaign), schedule))
        }
        None => {
            eprintln!("   Schedule: disabled (trigger runs over HTTP)");
            None
        }
    };

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = campaign_routes(campaign);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    tracing::info!(port, "Campaign server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
