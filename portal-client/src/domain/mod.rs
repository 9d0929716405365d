pub mod reading;
pub mod summary;

pub use reading::{DayRecord, Granularity, IntervalReading};
pub use summary::{hcf_to_gallons, CycleSummary, HCF_TO_GALLONS};
