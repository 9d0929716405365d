use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, Postgres, QueryBuilder};

use crate::store::{StatisticId, StatisticPoint, StatisticsStore, StoreError};

/// Postgres-wire statistics store (works against QuestDB's pgwire endpoint
/// or plain Postgres). The `(statistic_id, ts)` upsert implements the
/// replace-on-duplicate-timestamp contract the engine relies on.
pub struct PgStatisticsStore {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl PgStatisticsStore {
    pub fn new(pool: PgPool, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            batch_size,
            max_retries,
            retry_backoff,
        }
    }

    async fn flush_batch(
        &self,
        id: &StatisticId,
        batch: &[StatisticPoint],
    ) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            match self.upsert_batch(id, batch).await {
                Ok(()) => {
                    let counter = metrics::counter!("statistics_points_written_total");
                    counter.increment(batch.len() as u64);
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        statistic_id = %id,
                        "statistics flush failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, statistic_id = %id, "statistics flush failed, giving up");
                    metrics::counter!("statistics_store_errors_total").increment(1);
                    return Err(StoreError::Database(e.to_string()));
                }
            }
        }
    }

    async fn upsert_batch(
        &self,
        id: &StatisticId,
        batch: &[StatisticPoint],
    ) -> Result<(), sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO water_statistics (statistic_id, ts, state, sum) ",
        );

        builder.push_values(batch, |mut b, point| {
            b.push_bind(id.as_str())
                .push_bind(point.start)
                .push_bind(point.state)
                .push_bind(point.sum);
        });
        builder.push(" ON CONFLICT (statistic_id, ts) DO UPDATE SET state = EXCLUDED.state, sum = EXCLUDED.sum");

        let query = builder.build();
        query.execute(&self.pool).await.map(|_| ())
    }
}

#[async_trait]
impl StatisticsStore for PgStatisticsStore {
    async fn last_sum_before(
        &self,
        id: &StatisticId,
        instant: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError> {
        let row: Option<(f64,)> = sqlx::query_as(
            r#"
            SELECT sum
            FROM water_statistics
            WHERE statistic_id = $1
              AND ts < $2
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(id.as_str())
        .bind(instant)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.map(|r| r.0))
    }

    async fn submit(&self, id: &StatisticId, points: &[StatisticPoint]) -> Result<(), StoreError> {
        for chunk in points.chunks(self.batch_size.max(1)) {
            self.flush_batch(id, chunk).await?;
        }
        Ok(())
    }
}
