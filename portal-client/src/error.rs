use chrono::NaiveDate;

/// Failure taxonomy for the utility portal.
///
/// `NoDataAvailable` is expected operation (the portal releases interval
/// data in delayed batches) and is retried on the caller's next scheduled
/// run. `Transient` covers network failures and malformed mid-session
/// responses, likewise retried on the next run. `Auth` and `NoMeterFound`
/// are terminal for the invocation and need operator attention.
#[derive(thiserror::Error, Debug)]
pub enum PortalError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("no water meter found on the account")]
    NoMeterFound,
    #[error("no usage data available for {0}")]
    NoDataAvailable(NaiveDate),
    #[error("transient portal error: {0}")]
    Transient(String),
}

impl From<reqwest::Error> for PortalError {
    fn from(e: reqwest::Error) -> Self {
        PortalError::Transient(e.to_string())
    }
}
