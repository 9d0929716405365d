use chrono_tz::Tz;
use portal_client::{Granularity, PortalCredentials};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub uri: String,
    pub max_connections: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// IANA name of the utility's civil timezone. Day boundaries and the
    /// morning backfill window are computed against this, never UTC.
    pub timezone: Tz,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Yesterday is re-imported on ticks before this local hour, to catch
    /// the final hours the portal releases overnight. The portal's release
    /// schedule drifts, so this is policy, not protocol.
    #[serde(default = "default_morning_backfill_end_hour")]
    pub morning_backfill_end_hour: u32,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            morning_backfill_end_hour: default_morning_backfill_end_hour(),
            granularity: default_granularity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
}

impl AccountConfig {
    pub fn credentials(&self) -> PortalCredentials {
        PortalCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub portal: PortalConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub accounts: Vec<AccountConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("IMPORT_CONFIG").unwrap_or_else(|_| "import-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&contents)?;
        if cfg.accounts.is_empty() {
            anyhow::bail!("no [[accounts]] configured in {path}");
        }
        Ok(cfg)
    }

    /// Select the account a manual import runs against. With several
    /// accounts configured the username must be given explicitly.
    pub fn account(&self, username: Option<&str>) -> anyhow::Result<&AccountConfig> {
        let available = || {
            self.accounts
                .iter()
                .map(|a| a.username.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };

        match username {
            Some(name) => self
                .accounts
                .iter()
                .find(|a| a.username == name)
                .ok_or_else(|| {
                    anyhow::anyhow!("unknown account '{name}'. Available accounts: {}", available())
                }),
            None if self.accounts.len() == 1 => Ok(&self.accounts[0]),
            None => anyhow::bail!(
                "multiple accounts configured, specify a username. Available accounts: {}",
                available()
            ),
        }
    }
}

fn default_base_url() -> String {
    portal_client::DEFAULT_BASE_URL.to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_poll_interval_secs() -> u64 {
    3600
}

fn default_morning_backfill_end_hour() -> u32 {
    12
}

fn default_granularity() -> Granularity {
    Granularity::Hourly
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> AppConfig {
        toml::from_str(toml_str).unwrap()
    }

    const MINIMAL: &str = r#"
        [store]
        uri = "postgres://localhost:8812/qdb"
        max_connections = 4

        [portal]
        timezone = "America/Los_Angeles"

        [[accounts]]
        username = "alice@example.com"
        password = "hunter2"
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = parse(MINIMAL);
        assert_eq!(cfg.portal.base_url, portal_client::DEFAULT_BASE_URL);
        assert_eq!(cfg.portal.timezone, chrono_tz::America::Los_Angeles);
        assert_eq!(cfg.scheduler.poll_interval_secs, 3600);
        assert_eq!(cfg.scheduler.morning_backfill_end_hour, 12);
        assert_eq!(cfg.scheduler.granularity, Granularity::Hourly);
        assert_eq!(cfg.store.batch_size, 500);
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = parse(
            r#"
            [store]
            uri = "postgres://localhost:8812/qdb"
            max_connections = 4
            batch_size = 100

            [portal]
            base_url = "https://portal.example.org/portal/"
            timezone = "America/New_York"

            [scheduler]
            poll_interval_secs = 1800
            morning_backfill_end_hour = 6
            granularity = "quarter_hourly"

            [metrics]
            bind_addr = "127.0.0.1:9090"

            [[accounts]]
            username = "alice@example.com"
            password = "hunter2"
        "#,
        );
        assert_eq!(cfg.scheduler.granularity, Granularity::QuarterHourly);
        assert_eq!(cfg.scheduler.poll_interval_secs, 1800);
        assert_eq!(cfg.portal.timezone, chrono_tz::America::New_York);
        assert_eq!(cfg.store.batch_size, 100);
        assert!(cfg.metrics.is_some());
    }

    #[test]
    fn single_account_needs_no_selector() {
        let cfg = parse(MINIMAL);
        assert_eq!(cfg.account(None).unwrap().username, "alice@example.com");
        assert!(cfg.account(Some("bob@example.com")).is_err());
    }

    #[test]
    fn multiple_accounts_require_a_selector() {
        let mut cfg = parse(MINIMAL);
        cfg.accounts.push(AccountConfig {
            username: "bob@example.com".to_string(),
            password: "secret".to_string(),
        });
        assert!(cfg.account(None).is_err());
        assert_eq!(
            cfg.account(Some("bob@example.com")).unwrap().username,
            "bob@example.com"
        );
    }
}
