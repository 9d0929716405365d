use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use import_service::{config::AppConfig, engine::ImportEngine, observability, store::PgStatisticsStore};
use portal_client::PortalClient;
use sqlx::postgres::PgPoolOptions;
use std::{env, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: import_daily <start YYYY-MM-DD> <end YYYY-MM-DD> [username]");
    }
    let start = NaiveDate::parse_from_str(&args[1], "%Y-%m-%d")?;
    let end = NaiveDate::parse_from_str(&args[2], "%Y-%m-%d")?;
    if start > end {
        bail!("invalid date range: start date ({start}) must be before or equal to end date ({end})");
    }

    let cfg = AppConfig::load()?;
    let tz = cfg.portal.timezone;

    let today = Utc::now().with_timezone(&tz).date_naive();
    if end >= today {
        bail!("end date {end} must be at least one day in the past (the portal reports with a delay)");
    }

    let account = cfg.account(args.get(3).map(String::as_str))?;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.store.max_connections)
        .connect(&cfg.store.uri)
        .await?;
    let store = PgStatisticsStore::new(
        pool,
        cfg.store.batch_size,
        cfg.store.max_retries,
        Duration::from_millis(cfg.store.retry_backoff_ms),
    );

    let portal = PortalClient::new(cfg.portal.base_url.clone(), account.credentials());
    let mut session = portal.login().await?;

    let mut engine = ImportEngine::new(&mut session, &store, tz);
    let summary = engine
        .import_range(start, end, cfg.scheduler.granularity)
        .await?;

    session.logout();

    tracing::info!(
        days_imported = summary.days_imported,
        days_skipped = summary.days_skipped,
        closing_sum = summary.closing_sum,
        "manual range import complete"
    );
    Ok(())
}
