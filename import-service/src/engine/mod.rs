//! Import reconciliation engine.
//!
//! Converts raw day records from the portal into duplicate-safe cumulative
//! statistics batches. The portal releases data late and in batches, so the
//! engine is built to be re-invoked at any time: re-importing a day replaces
//! its points with identical values rather than stacking them.

pub mod series;

pub use series::{accumulate, local_midnight, to_utc};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use portal_client::{DayRecord, Granularity, PortalError, PortalSession};

use crate::store::{StatisticId, StatisticPoint, StatisticsStore, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("portal: {0}")]
    Portal(#[from] PortalError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("baseline must be non-negative, got {0}")]
    NegativeBaseline(f64),
    #[error("negative usage reading of {gallons} gal at {at}")]
    NegativeUsage { at: NaiveDateTime, gallons: f64 },
    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
}

impl EngineError {
    /// Failures that skip a single day inside a range without touching the
    /// carried baseline. Everything else aborts the range.
    fn skips_day(&self) -> bool {
        matches!(
            self,
            EngineError::Portal(PortalError::NoDataAvailable(_))
                | EngineError::Portal(PortalError::Transient(_))
        )
    }
}

/// Interval-data source for one meter's account. The seam between the
/// engine and the portal session.
#[async_trait]
pub trait UsageSource: Send {
    async fn meter_number(&mut self) -> Result<String, PortalError>;

    async fn fetch_day(
        &mut self,
        date: NaiveDate,
        granularity: Granularity,
    ) -> Result<DayRecord, PortalError>;
}

#[async_trait]
impl UsageSource for PortalSession {
    async fn meter_number(&mut self) -> Result<String, PortalError> {
        PortalSession::meter_number(self).await
    }

    async fn fetch_day(
        &mut self,
        date: NaiveDate,
        granularity: Granularity,
    ) -> Result<DayRecord, PortalError> {
        PortalSession::fetch_day(self, date, granularity).await
    }
}

/// Outcome of a single-day import.
#[derive(Debug, Clone, PartialEq)]
pub struct DayImport {
    pub statistic_id: StatisticId,
    pub points: usize,
    pub closing_sum: f64,
}

/// Outcome of a range import.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeImport {
    pub days_imported: usize,
    pub days_skipped: usize,
    pub closing_sum: Option<f64>,
}

pub struct ImportEngine<'a, S, K> {
    source: &'a mut S,
    store: &'a K,
    tz: Tz,
}

impl<'a, S, K> ImportEngine<'a, S, K>
where
    S: UsageSource,
    K: StatisticsStore,
{
    pub fn new(source: &'a mut S, store: &'a K, tz: Tz) -> Self {
        Self { source, store, tz }
    }

    /// Import one calendar day.
    ///
    /// With no explicit `baseline`, the cumulative total at local midnight
    /// of `date` is resolved first from the store, then from the prior
    /// day's readings, then defaults to zero at the start of meter history.
    /// The whole day is submitted as one batch; nothing is written when the
    /// day errors.
    pub async fn import_day(
        &mut self,
        date: NaiveDate,
        granularity: Granularity,
        baseline: Option<f64>,
    ) -> Result<DayImport, EngineError> {
        let day = self.source.fetch_day(date, granularity).await?;

        let baseline = match baseline {
            Some(value) if value < 0.0 => return Err(EngineError::NegativeBaseline(value)),
            Some(value) => value,
            None => self.resolve_baseline(date, granularity).await?,
        };

        let points: Vec<StatisticPoint> = series::accumulate(&day, baseline, self.tz)?;
        let meter = self.source.meter_number().await?;
        let statistic_id = StatisticId::for_meter(&meter, granularity);

        self.store.submit(&statistic_id, &points).await?;
        metrics::counter!("import_days_completed_total").increment(1);

        let closing_sum = points.last().map(|p| p.sum).unwrap_or(baseline);
        tracing::info!(
            statistic_id = %statistic_id,
            %date,
            points = points.len(),
            closing_sum,
            "imported day"
        );

        Ok(DayImport {
            statistic_id,
            points: points.len(),
            closing_sum,
        })
    }

    /// Import every day in the inclusive range, feeding each day's closing
    /// sum forward as the next day's baseline.
    ///
    /// Days the portal has not released (or that fail transiently) are
    /// skipped: the baseline used for the next day is the last successfully
    /// computed cumulative, never a guess.
    pub async fn import_range(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
        granularity: Granularity,
    ) -> Result<RangeImport, EngineError> {
        if start > end {
            return Err(EngineError::InvalidRange { start, end });
        }

        let mut baseline = self.resolve_baseline(start, granularity).await?;
        let mut summary = RangeImport::default();

        let mut date = start;
        loop {
            match self.import_day(date, granularity, Some(baseline)).await {
                Ok(day) => {
                    baseline = day.closing_sum;
                    summary.closing_sum = Some(day.closing_sum);
                    summary.days_imported += 1;
                }
                Err(e) if e.skips_day() => {
                    tracing::info!(%date, error = %e, "skipping day in range");
                    metrics::counter!("import_days_skipped_total").increment(1);
                    summary.days_skipped += 1;
                }
                Err(e) => return Err(e),
            }

            match date.succ_opt() {
                Some(next) if next <= end => date = next,
                _ => break,
            }
        }

        tracing::info!(
            %start,
            %end,
            days_imported = summary.days_imported,
            days_skipped = summary.days_skipped,
            "range import complete"
        );
        Ok(summary)
    }

    /// Cumulative total as of local midnight of `date`.
    ///
    /// The store query is bounded strictly before midnight, so hours of
    /// `date` already imported by an earlier partial run do not inflate the
    /// baseline on re-import.
    async fn resolve_baseline(
        &mut self,
        date: NaiveDate,
        granularity: Granularity,
    ) -> Result<f64, EngineError> {
        let meter = self.source.meter_number().await?;
        let statistic_id = StatisticId::for_meter(&meter, granularity);
        let midnight = series::local_midnight(date, self.tz);

        if let Some(sum) = self.store.last_sum_before(&statistic_id, midnight).await? {
            tracing::debug!(statistic_id = %statistic_id, %date, baseline = sum, "baseline from store");
            return Ok(sum);
        }

        // Nothing imported yet: reconstruct the prior day's cumulative from
        // the portal. A missing prior day means the start of meter history.
        let Some(prior) = date.pred_opt() else {
            return Ok(0.0);
        };
        match self.source.fetch_day(prior, granularity).await {
            Ok(day) => {
                let baseline = day.total_gallons();
                tracing::debug!(%date, baseline, "baseline from prior day fetch");
                Ok(baseline)
            }
            Err(PortalError::NoDataAvailable(_)) => Ok(0.0),
            Err(e) => Err(e.into()),
        }
    }
}
