//! Periodic import driver.
//!
//! One importer per configured account. Each tick is a complete unit of
//! work: fresh portal session, cycle-summary gauge refresh, today's partial
//! import, and — during the early-morning window — a repair import of
//! yesterday to pick up the hours the portal releases overnight. The engine
//! is correct whenever it is invoked, so the cadence here is pure policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use portal_client::{CycleSummary, Granularity, PortalClient, PortalError};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::config::{AccountConfig, AppConfig};
use crate::engine::{EngineError, ImportEngine};
use crate::store::StatisticsStore;

/// Ticks before this local hour re-import yesterday as well.
pub fn in_morning_window(now_local: DateTime<Tz>, end_hour: u32) -> bool {
    now_local.hour() < end_hour
}

pub struct MeterImporter<K> {
    username: String,
    portal: PortalClient,
    store: Arc<K>,
    tz: Tz,
    granularity: Granularity,
    poll_interval: Duration,
    morning_end_hour: u32,
    // Two imports of the same meter must never interleave: both read and
    // advance the same baseline. Startup and tick imports funnel through
    // this lock; different accounts run independently.
    import_lock: Mutex<()>,
}

impl<K: StatisticsStore> MeterImporter<K> {
    pub fn new(cfg: &AppConfig, account: &AccountConfig, store: Arc<K>) -> Self {
        Self {
            username: account.username.clone(),
            portal: PortalClient::new(cfg.portal.base_url.clone(), account.credentials()),
            store,
            tz: cfg.portal.timezone,
            granularity: cfg.scheduler.granularity,
            poll_interval: Duration::from_secs(cfg.scheduler.poll_interval_secs),
            morning_end_hour: cfg.scheduler.morning_backfill_end_hour,
            import_lock: Mutex::new(()),
        }
    }

    pub async fn run(self) {
        // One-time catch-up so a fresh install has yesterday's data
        // without waiting out the first full cadence.
        if let Err(e) = self.import_yesterday().await {
            log_import_failure("initial yesterday import", &e);
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                log_import_failure("scheduled import", &e);
            }
        }
    }

    async fn tick(&self) -> Result<(), EngineError> {
        let _serialized = self.import_lock.lock().await;

        let mut session = self.portal.login().await?;

        match session.fetch_cycle_summary().await {
            Ok(summary) => publish_cycle_summary(&summary),
            Err(e) => tracing::warn!(account = %self.username, error = %e, "cycle summary refresh failed"),
        }

        let now_local = Utc::now().with_timezone(&self.tz);
        let today = now_local.date_naive();

        {
            let mut engine = ImportEngine::new(&mut session, self.store.as_ref(), self.tz);

            // Today's data is partial all day long; each tick re-imports
            // whatever the portal has released so far.
            if let Err(e) = engine.import_day(today, self.granularity, None).await {
                log_import_failure("today import", &e);
            }

            if in_morning_window(now_local, self.morning_end_hour) {
                if let Some(yesterday) = today.pred_opt() {
                    if let Err(e) = engine.import_day(yesterday, self.granularity, None).await {
                        log_import_failure("yesterday backfill", &e);
                    }
                }
            }
        }

        session.logout();
        Ok(())
    }

    async fn import_yesterday(&self) -> Result<(), EngineError> {
        let _serialized = self.import_lock.lock().await;

        let mut session = self.portal.login().await?;
        let today = Utc::now().with_timezone(&self.tz).date_naive();
        let result = match today.pred_opt() {
            Some(yesterday) => {
                let mut engine = ImportEngine::new(&mut session, self.store.as_ref(), self.tz);
                engine
                    .import_day(yesterday, self.granularity, None)
                    .await
                    .map(|_| ())
            }
            None => Ok(()),
        };
        session.logout();
        result
    }
}

/// Billing-cycle summary values, surfaced as gauges in gallons.
pub fn publish_cycle_summary(summary: &CycleSummary) {
    if let Some(v) = summary.so_far_gallons() {
        metrics::gauge!("water_cycle_usage_gallons").set(v);
    }
    if let Some(v) = summary.projected_gallons() {
        metrics::gauge!("water_cycle_projected_gallons").set(v);
    }
    if let Some(v) = summary.last_cycle_gallons() {
        metrics::gauge!("water_last_cycle_gallons").set(v);
    }
    if let Some(v) = summary.average_gallons() {
        metrics::gauge!("water_average_cycle_gallons").set(v);
    }
    if let Some(v) = summary.highest_gallons() {
        metrics::gauge!("water_highest_cycle_gallons").set(v);
    }
}

fn log_import_failure(context: &str, error: &EngineError) {
    match error {
        EngineError::Portal(PortalError::NoDataAvailable(date)) => {
            tracing::info!(context, %date, "no data released yet; retrying on the next tick");
        }
        EngineError::Portal(PortalError::Auth(message)) => {
            tracing::error!(context, message = %message, "portal authentication failed; check credentials");
        }
        EngineError::Portal(PortalError::NoMeterFound) => {
            tracing::error!(context, "account has no usable water meter");
        }
        EngineError::Portal(PortalError::Transient(message)) => {
            tracing::warn!(context, message = %message, "transient portal failure; retrying on the next tick");
        }
        EngineError::Store(e) => {
            tracing::error!(context, error = %e, "statistics submission failed; the day will be re-imported");
        }
        other => {
            tracing::error!(context, error = %other, "import failed");
        }
    }
}
