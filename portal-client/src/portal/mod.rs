//! HTTP client for the utility's customer portal.
//!
//! The portal is a session/CSRF-protected ASP.NET application, not an API:
//! login means scraping hidden form state off the landing page, replaying it
//! against WebMethod endpoints, and keeping the cookie jar coherent.
//!
//! A [`PortalSession`] is acquired per logical unit of work (one import, one
//! summary refresh cycle) and released with a consuming [`PortalSession::logout`].
//! Nothing here is shared or long-lived; a fresh session gets a fresh cookie
//! jar and CSRF token, which keeps concurrent units of work from trampling
//! each other's server-side state.

mod wire;

pub use wire::UserInfo;

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::RequestBuilder;
use serde::Serialize;

use crate::domain::{CycleSummary, DayRecord, Granularity};
use crate::error::PortalError;
use wire::LoginOutcome;

pub const DEFAULT_BASE_URL: &str = "https://portal.acwd.org/portal/";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(2);
const LOGIN_RETRIES: u32 = 3;
const FETCH_RETRIES: u32 = 3;
const DISCOVERY_RETRIES: u32 = 2;

#[derive(Debug, Clone)]
pub struct PortalCredentials {
    pub username: String,
    pub password: String,
}

/// Factory for portal sessions. Holds credentials and the portal base URL;
/// every unit of work asks it for a fresh [`PortalSession`].
#[derive(Debug, Clone)]
pub struct PortalClient {
    base_url: String,
    credentials: PortalCredentials,
}

impl PortalClient {
    pub fn new(base_url: impl Into<String>, credentials: PortalCredentials) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
        }
    }

    pub async fn login(&self) -> Result<PortalSession, PortalError> {
        PortalSession::open(&self.base_url, &self.credentials).await
    }
}

/// An authenticated portal session scoped to one unit of work.
pub struct PortalSession {
    http: reqwest::Client,
    base_url: String,
    csrf_token: String,
    user_info: UserInfo,
    meter_number: Option<String>,
}

impl PortalSession {
    async fn open(base_url: &str, credentials: &PortalCredentials) -> Result<Self, PortalError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PortalError::Transient(format!("failed to build http client: {e}")))?;

        tracing::debug!("fetching portal login page");
        let login_page = send_with_retries(http.get(base_url), LOGIN_RETRIES, "login page").await?;

        let fields = wire::hidden_fields(&login_page);
        tracing::debug!(count = fields.len(), "extracted hidden form fields");
        let csrf_token = fields
            .get(wire::CSRF_FIELD)
            .filter(|value| !value.is_empty())
            .cloned()
            .ok_or_else(|| PortalError::Auth("login page carried no CSRF token".to_string()))?;

        // Primes the server-side session state; the portal tolerates this
        // failing, so we do too.
        let update_state_url = format!("{base_url}default.aspx/updateState");
        let update_state = http
            .post(&update_state_url)
            .header("Referer", base_url)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("CSRFToken", csrf_token.as_str())
            .json(&serde_json::json!({}));
        if let Err(e) = send_with_retries(update_state, 1, "updateState").await {
            tracing::warn!(error = %e, "updateState call failed, continuing");
        }

        tracing::debug!("validating login");
        let validate_url = format!("{base_url}default.aspx/validateLogin");
        let payload = wire::LoginPayload::new(&credentials.username, &credentials.password);
        let validate = http
            .post(&validate_url)
            .header("Referer", base_url)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("CSRFToken", csrf_token.as_str())
            .json(&payload);
        let body = send_with_retries(validate, LOGIN_RETRIES, "validateLogin").await?;

        let inner = wire::unwrap_envelope(&body)
            .map_err(|e| PortalError::Auth(format!("unexpected login response format: {e}")))?;
        let user_info = match wire::classify_login(&inner) {
            LoginOutcome::Success(info) => info,
            LoginOutcome::Rejected(message) => return Err(PortalError::Auth(message)),
        };
        tracing::info!(
            account = user_info.account_number.as_deref().unwrap_or("unknown"),
            "portal login successful"
        );

        // Landing on the dashboard completes the server-side login
        // handshake; the session is usable even if the page itself errors.
        let dashboard = wire::dashboard_url(base_url, user_info.dashboard_option.as_deref());
        if let Err(e) = send_with_retries(http.get(&dashboard), 0, "dashboard").await {
            tracing::warn!(error = %e, "dashboard navigation failed");
        }

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            csrf_token,
            user_info,
            meter_number: None,
        })
    }

    pub fn user_info(&self) -> &UserInfo {
        &self.user_info
    }

    /// The physical meter number this account imports from, discovering it
    /// on first use via the portal's meter list.
    pub async fn meter_number(&mut self) -> Result<String, PortalError> {
        if let Some(meter) = &self.meter_number {
            return Ok(meter.clone());
        }

        let url = format!("{}Usages.aspx/BindMultiMeter", self.base_url);
        let body = self
            .api_post(&url, &serde_json::json!({"MeterType": "W"}), DISCOVERY_RETRIES)
            .await?;
        let inner = wire::unwrap_envelope(&body)
            .map_err(|e| PortalError::Transient(format!("unexpected meter list format: {e}")))?;
        let list: wire::MeterList = serde_json::from_str(&inner)
            .map_err(|e| PortalError::Transient(format!("malformed meter list: {e}")))?;

        let meter = wire::select_water_meter(&list.meter_details)?;
        tracing::info!(meter = %meter, "discovered water meter");
        self.meter_number = Some(meter.clone());
        Ok(meter)
    }

    /// Fetch one calendar day of interval readings.
    ///
    /// An empty result set maps to [`PortalError::NoDataAvailable`]: the
    /// portal has simply not released that day yet.
    pub async fn fetch_day(
        &mut self,
        date: NaiveDate,
        granularity: Granularity,
    ) -> Result<DayRecord, PortalError> {
        self.refresh_csrf().await;
        let meter = self.meter_number().await?;

        let request = wire::UsageRequest::day(&meter, date, granularity);
        let url = format!("{}Usages.aspx/LoadWaterUsage", self.base_url);
        let body = self.api_post(&url, &request, FETCH_RETRIES).await?;

        let inner = wire::unwrap_envelope(&body)
            .map_err(|e| PortalError::Transient(format!("unexpected usage response format: {e}")))?;
        let response: wire::DayUsageResponse = serde_json::from_str(&inner)
            .map_err(|e| PortalError::Transient(format!("malformed usage payload: {e}")))?;

        if response.rows.is_empty() {
            return Err(PortalError::NoDataAvailable(date));
        }

        let readings = response
            .rows
            .iter()
            .map(|row| wire::interval_reading(row, date, granularity))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(%date, intervals = readings.len(), "fetched day record");
        Ok(DayRecord::new(date, granularity, readings))
    }

    /// Fetch the billing-cycle summary tables.
    pub async fn fetch_cycle_summary(&mut self) -> Result<CycleSummary, PortalError> {
        self.refresh_csrf().await;
        let meter = self.meter_number().await?;

        let request = wire::UsageRequest::billing_cycle(&meter);
        let url = format!("{}Usages.aspx/LoadWaterUsage", self.base_url);
        let body = self.api_post(&url, &request, FETCH_RETRIES).await?;

        let inner = wire::unwrap_envelope(&body)
            .map_err(|e| PortalError::Transient(format!("unexpected usage response format: {e}")))?;
        let response: wire::CycleUsageResponse = serde_json::from_str(&inner)
            .map_err(|e| PortalError::Transient(format!("malformed cycle payload: {e}")))?;

        Ok(wire::cycle_summary(&response))
    }

    /// Release the session. The portal exposes no logout endpoint; dropping
    /// the client discards the cookie jar, which is all the state there is.
    pub fn logout(self) {
        tracing::debug!("closing portal session");
    }

    /// Usage endpoints validate against the token embedded in the usage
    /// page, which rotates; refresh before each call. Keeping the stale
    /// token is survivable, so failure only warns.
    async fn refresh_csrf(&mut self) {
        let url = format!("{}usages.aspx?type=WU", self.base_url);
        match send_with_retries(self.http.get(&url), 1, "usage page").await {
            Ok(html) => {
                if let Some(token) = wire::csrf_from_page(&html) {
                    self.csrf_token = token;
                    tracing::debug!("refreshed CSRF token from usage page");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to refresh CSRF token, using existing"),
        }
    }

    async fn api_post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &T,
        retries: u32,
    ) -> Result<String, PortalError> {
        let referer = format!("{}usages.aspx?type=WU", self.base_url);
        let builder = self
            .http
            .post(url)
            .header("Referer", referer)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("isajax", "1")
            .header("csrftoken", self.csrf_token.as_str())
            .json(payload);
        send_with_retries(builder, retries, url).await
    }
}

async fn send_once(builder: RequestBuilder) -> Result<String, PortalError> {
    let response = builder.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(PortalError::Transient(format!("portal returned {status}")));
    }
    Ok(response.text().await?)
}

/// Issue a request with bounded retries and linear backoff. Only transport
/// and HTTP-status failures are retried; payload semantics are the caller's
/// problem.
async fn send_with_retries(
    builder: RequestBuilder,
    retries: u32,
    what: &str,
) -> Result<String, PortalError> {
    let mut attempt: u32 = 0;
    loop {
        let request = builder.try_clone().ok_or_else(|| {
            PortalError::Transient(format!("request to {what} is not retryable"))
        })?;
        match send_once(request).await {
            Ok(body) => return Ok(body),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::warn!(error = %e, attempt, call = what, "portal request failed, retrying with backoff");
                tokio::time::sleep(RETRY_DELAY * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
