use anyhow::Result;
use import_service::{
    config::AppConfig,
    metrics_server, observability,
    scheduler::MeterImporter,
    store::PgStatisticsStore,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr);
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.store.max_connections)
        .connect(&cfg.store.uri)
        .await?;

    let store = Arc::new(PgStatisticsStore::new(
        pool,
        cfg.store.batch_size,
        cfg.store.max_retries,
        Duration::from_millis(cfg.store.retry_backoff_ms),
    ));

    tracing::info!(
        accounts = cfg.accounts.len(),
        timezone = %cfg.portal.timezone,
        "starting importers"
    );

    // One importer task per account; same-meter imports serialize inside
    // each importer, different meters run concurrently.
    let importers: Vec<_> = cfg
        .accounts
        .iter()
        .map(|account| MeterImporter::new(&cfg, account, store.clone()).run())
        .collect();
    futures::future::join_all(importers).await;

    Ok(())
}
