//! One-shot expiry sweep, for cron-style scheduling.
//!
//! Exits 0 whenever the sweep ran, however many invoices it found; only a
//! failure to reach the store is an error.

use anyhow::Context;
use booking_service::config::Config;
use booking_service::startup::{connect_store, notifier_from_config, refunds_from_config};
use booking_service::AppState;
use clap::Parser;
use mongodb::bson::DateTime;
use secrecy::ExposeSecret;
use service_core::observability::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "expiry-sweeper", about = "Expire overdue invoices and release their slots")]
struct Args {
    /// Log intended transitions without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Evaluate due dates as of this instant (RFC 3339) instead of now.
    #[arg(long, env = "SWEEPER_NOW")]
    now: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load()?;

    init_tracing(
        "expiry-sweeper",
        &config.observability.log_level,
        config.observability.otlp_endpoint.as_deref(),
    );

    let now = match args.now.as_deref() {
        Some(raw) => DateTime::parse_rfc3339_str(raw)
            .with_context(|| format!("--now is not an RFC 3339 timestamp: {}", raw))?,
        None => DateTime::now(),
    };

    let store = connect_store(&config)
        .await
        .context("failed to connect to the store")?;
    let redis = redis::Client::open(config.redis.url.expose_secret().as_str())?;
    let notifier = notifier_from_config(&config.notifications);
    let refunds = refunds_from_config(&config.refunds);
    let state = AppState::new(config, redis, store, notifier, refunds);

    let report = state
        .sweeper
        .run(now, args.dry_run)
        .await
        .context("expiry sweep could not list due invoices")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
