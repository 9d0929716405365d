use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use import_service::{config::AppConfig, engine::ImportEngine, observability, store::PgStatisticsStore};
use portal_client::{Granularity, PortalClient};
use sqlx::postgres::PgPoolOptions;
use std::{env, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: import_hourly <YYYY-MM-DD> [hourly|quarter_hourly] [username]");
    }
    let date = NaiveDate::parse_from_str(&args[1], "%Y-%m-%d")?;
    let granularity = match args.get(2) {
        Some(raw) => raw
            .parse::<Granularity>()
            .map_err(|e| anyhow::anyhow!(e))?,
        None => Granularity::Hourly,
    };

    let cfg = AppConfig::load()?;
    let tz = cfg.portal.timezone;

    // The portal reports with a delay; today and future dates are never
    // available.
    let today = Utc::now().with_timezone(&tz).date_naive();
    if date >= today {
        bail!("date {date} must be at least one day in the past (the portal reports with a delay)");
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
    let day = engine.import_day(date, granularity, None).await?;

    session.logout();

    tracing::info!(
        statistic_id = %day.statistic_id,
        points = day.points,
        closing_sum = day.closing_sum,
        "manual import complete"
    );
    Ok(())
}
