use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;

/// Interval resolution the portal can report at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hourly,
    QuarterHourly,
}

impl Granularity {
    pub fn interval_minutes(self) -> u32 {
        match self {
            Granularity::Hourly => 60,
            Granularity::QuarterHourly => 15,
        }
    }

    /// Interval count of a complete day (ignoring DST-shortened days).
    pub fn expected_intervals(self) -> usize {
        match self {
            Granularity::Hourly => 24,
            Granularity::QuarterHourly => 96,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Hourly => write!(f, "hourly"),
            Granularity::QuarterHourly => write!(f, "quarter_hourly"),
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Granularity::Hourly),
            "quarter_hourly" => Ok(Granularity::QuarterHourly),
            other => Err(format!(
                "unknown granularity '{other}' (expected 'hourly' or 'quarter_hourly')"
            )),
        }
    }
}

/// A single timestamped usage quantity for one sub-day interval.
///
/// The timestamp is naive and expressed in the utility's civil timezone;
/// conversion to UTC happens downstream where the timezone is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalReading {
    pub local_time: NaiveDateTime,
    pub gallons: f64,
}

/// Ordered interval readings for one calendar day.
///
/// Ascending timestamp order is part of the contract and is enforced at
/// construction, so consumers can accumulate in iteration order.
#[derive(Debug, Clone, PartialEq)]
pub struct DayRecord {
    date: NaiveDate,
    granularity: Granularity,
    readings: Vec<IntervalReading>,
}

impl DayRecord {
    pub fn new(date: NaiveDate, granularity: Granularity, mut readings: Vec<IntervalReading>) -> Self {
        readings.sort_by_key(|r| r.local_time);
        Self {
            date,
            granularity,
            readings,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn readings(&self) -> &[IntervalReading] {
        &self.readings
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Total gallons across the day, summed in chronological order.
    pub fn total_gallons(&self) -> f64 {
        self.readings.iter().map(|r| r.gallons).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn reading(hour: u32, gallons: f64) -> IntervalReading {
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        IntervalReading {
            local_time: date.and_hms_opt(hour, 0, 0).unwrap(),
            gallons,
        }
    }

    #[test]
    fn day_record_sorts_readings_ascending() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let day = DayRecord::new(
            date,
            Granularity::Hourly,
            vec![reading(5, 1.0), reading(2, 2.0), reading(9, 3.0)],
        );

        let hours: Vec<u32> = day
            .readings()
            .iter()
            .map(|r| chrono::Timelike::hour(&r.local_time))
            .collect();
        assert_eq!(hours, vec![2, 5, 9]);
    }

    #[test]
    fn total_gallons_sums_all_intervals() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let day = DayRecord::new(
            date,
            Granularity::Hourly,
            vec![reading(0, 1.5), reading(1, 2.25)],
        );
        assert!((day.total_gallons() - 3.75).abs() < f64::EPSILON);
    }

    #[test]
    fn granularity_parses_from_str() {
        assert_eq!("hourly".parse::<Granularity>().unwrap(), Granularity::Hourly);
        assert_eq!(
            "quarter_hourly".parse::<Granularity>().unwrap(),
            Granularity::QuarterHourly
        );
        assert!("daily".parse::<Granularity>().is_err());
    }
}
