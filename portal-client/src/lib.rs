pub mod domain;
pub mod error;
pub mod portal;

pub use domain::{CycleSummary, DayRecord, Granularity, IntervalReading};
pub use error::PortalError;
pub use portal::{PortalClient, PortalCredentials, PortalSession, UserInfo, DEFAULT_BASE_URL};
