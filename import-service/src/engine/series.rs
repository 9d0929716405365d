//! Pure cumulative-series construction and civil-timezone arithmetic.
//!
//! All "midnight" computation happens in the utility's IANA timezone. A
//! baseline computed against the wrong timezone's midnight shows up as a
//! negative or doubled jump at the day boundary, so every conversion in the
//! import path funnels through here.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use portal_client::DayRecord;

use crate::engine::EngineError;
use crate::store::StatisticPoint;

/// Build the statistics batch for one day.
///
/// `baseline` is the cumulative total as of local midnight of the day.
/// Readings are accumulated strictly in ascending timestamp order (the
/// `DayRecord` contract), so re-running on identical input reproduces
/// bit-identical sums. The first emitted sum is `baseline + first interval
/// usage`, never `baseline` alone, and no emitted sum drops below the
/// baseline.
pub fn accumulate(
    day: &DayRecord,
    baseline: f64,
    tz: Tz,
) -> Result<Vec<StatisticPoint>, EngineError> {
    if baseline < 0.0 {
        return Err(EngineError::NegativeBaseline(baseline));
    }

    let mut sum = baseline;
    let mut points = Vec::with_capacity(day.len());
    for reading in day.readings() {
        if reading.gallons < 0.0 {
            return Err(EngineError::NegativeUsage {
                at: reading.local_time,
                gallons: reading.gallons,
            });
        }
        sum += reading.gallons;
        points.push(StatisticPoint {
            start: to_utc(reading.local_time, tz),
            state: reading.gallons,
            sum,
        });
    }
    Ok(points)
}

/// Convert a civil-timezone local time to the UTC instant it names.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant.
/// Local times erased by a DST gap resolve to the first valid instant that
/// follows, probing in 15-minute steps (no tz-database gap exceeds three
/// hours).
pub fn to_utc(local: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        chrono::LocalResult::None => {
            let mut probe = local;
            for _ in 0..12 {
                probe += chrono::Duration::minutes(15);
                if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
                    return dt.with_timezone(&Utc);
                }
            }
            Utc.from_utc_datetime(&local)
        }
    }
}

/// Midnight of `date` in the utility's civil timezone, as a UTC instant.
pub fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    to_utc(date.and_time(NaiveTime::MIN), tz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use chrono_tz::America::{Los_Angeles, Santiago};
    use portal_client::{Granularity, IntervalReading};

    const EPS: f64 = 1e-9;

    fn hourly_day(date: NaiveDate, usages: &[f64]) -> DayRecord {
        let readings = usages
            .iter()
            .enumerate()
            .map(|(hour, gallons)| IntervalReading {
                local_time: date.and_hms_opt(hour as u32, 0, 0).unwrap(),
                gallons: *gallons,
            })
            .collect();
        DayRecord::new(date, Granularity::Hourly, readings)
    }

    // 24 hourly usages totalling 46.81 gallons.
    const FULL_DAY: [f64; 24] = [
        3.89, 2.54, 1.87, 1.12, 0.66, 0.0, 0.0, 0.73, 1.48, 2.95, 3.60, 2.81, 2.14, 1.90, 2.33,
        2.57, 3.02, 2.88, 2.41, 2.20, 1.96, 1.74, 1.53, 0.48,
    ];

    #[test]
    fn continues_from_the_baseline_across_the_day_boundary() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let day = hourly_day(date, &FULL_DAY);

        let points = accumulate(&day, 172.34, Los_Angeles).unwrap();
        assert_eq!(points.len(), 24);
        // First sum is baseline + first interval usage, not the baseline alone.
        assert!((points[0].sum - 176.23).abs() < EPS);
        assert!((points[0].state - 3.89).abs() < EPS);
        // Closing sum after 46.81 additional gallons.
        assert!((points[23].sum - 219.15).abs() < EPS);
    }

    #[test]
    fn sums_are_monotone_and_never_below_the_baseline() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let day = hourly_day(date, &FULL_DAY);

        let points = accumulate(&day, 10.0, Los_Angeles).unwrap();
        for pair in points.windows(2) {
            assert!(pair[1].sum >= pair[0].sum);
        }
        for point in &points {
            assert!(point.sum >= 10.0);
            assert!(point.sum >= 0.0);
        }
    }

    #[test]
    fn first_ever_import_starts_from_zero() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let day = hourly_day(date, &[2.5, 1.5]);

        let points = accumulate(&day, 0.0, Los_Angeles).unwrap();
        assert!((points[0].sum - 2.5).abs() < EPS);
        assert!((points[1].sum - 4.0).abs() < EPS);
    }

    #[test]
    fn repeat_runs_are_bit_identical() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let day = hourly_day(date, &FULL_DAY);

        let first = accumulate(&day, 172.34, Los_Angeles).unwrap();
        let second = accumulate(&day, 172.34, Los_Angeles).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_negative_baseline_and_negative_usage() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let day = hourly_day(date, &[1.0]);
        assert!(matches!(
            accumulate(&day, -0.1, Los_Angeles),
            Err(EngineError::NegativeBaseline(_))
        ));

        let bad = hourly_day(date, &[1.0, -2.0]);
        assert!(matches!(
            accumulate(&bad, 0.0, Los_Angeles),
            Err(EngineError::NegativeUsage { .. })
        ));
    }

    #[test]
    fn midnight_is_computed_in_the_utility_timezone() {
        // PST (UTC-8): local midnight of Jan 15 is 08:00 UTC of Jan 15.
        let winter = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        assert_eq!(
            local_midnight(winter, Los_Angeles),
            Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap()
        );

        // PDT (UTC-7) in summer.
        let summer = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        assert_eq!(
            local_midnight(summer, Los_Angeles),
            Utc.with_ymd_and_hms(2025, 6, 15, 7, 0, 0).unwrap()
        );
    }

    #[test]
    fn midnight_erased_by_a_dst_gap_resolves_to_first_valid_instant() {
        // Chile springs forward at local midnight: 2024-09-08 00:00 does not
        // exist, the day starts at 01:00 -03 (= 04:00 UTC).
        let date = NaiveDate::from_ymd_opt(2024, 9, 8).unwrap();
        assert_eq!(
            local_midnight(date, Santiago),
            Utc.with_ymd_and_hms(2024, 9, 8, 4, 0, 0).unwrap()
        );
    }

    #[test]
    fn ambiguous_local_times_resolve_to_the_earlier_instant() {
        // 01:30 occurs twice on the US fall-back day; the first occurrence
        // is still PDT (UTC-7).
        let local = NaiveDate::from_ymd_opt(2025, 11, 2)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        assert_eq!(
            to_utc(local, Los_Angeles),
            Utc.with_ymd_and_hms(2025, 11, 2, 8, 30, 0).unwrap()
        );
    }
}
