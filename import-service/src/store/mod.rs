pub mod postgres;

pub use postgres::PgStatisticsStore;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portal_client::Granularity;

/// One persisted statistics row: the interval usage (`state`) and the
/// running cumulative total (`sum`) at `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticPoint {
    pub start: DateTime<Utc>,
    pub state: f64,
    pub sum: f64,
}

/// Stable external key for a meter's imported series.
///
/// Derived from the physical meter number, which survives reinstalls and
/// account migrations; the portal's internal account id does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatisticId(String);

impl StatisticId {
    pub fn for_meter(meter_number: &str, granularity: Granularity) -> Self {
        let suffix = match granularity {
            Granularity::Hourly => "hourly_usage",
            Granularity::QuarterHourly => "quarter_hourly_usage",
        };
        Self(format!("water_usage:{meter_number}_{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatisticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("statistics store error: {0}")]
    Database(String),
}

/// Long-term statistics store for cumulative series.
///
/// Re-submitting a point with a previously-seen timestamp replaces it, so
/// repeated imports of the same day are safe by construction.
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    /// Last known cumulative sum strictly before `instant`, if any.
    async fn last_sum_before(
        &self,
        id: &StatisticId,
        instant: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError>;

    /// Upsert a day's batch of points. All-or-error: a partial write is
    /// reported as failure and repaired by the next full re-import.
    async fn submit(&self, id: &StatisticId, points: &[StatisticPoint]) -> Result<(), StoreError>;
}
