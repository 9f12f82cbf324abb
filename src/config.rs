use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::parse_utc_offset;

/// Top-level configuration for the viewoor service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// HTTP API server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// ClickHouse read connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Rollup settlement configuration.
    #[serde(default)]
    pub settlement: SettlementConfig,
}

/// HTTP API server configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// ClickHouse read connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Source database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,
}

/// Rollup settlement configuration.
///
/// The business timezone governs when daily and hourly rollup jobs close
/// their buckets; it is deployment configuration, not a compiled-in
/// constant.
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    /// Business timezone as a UTC offset (e.g. "+09:00").
    #[serde(default = "default_business_utc_offset")]
    pub business_utc_offset: String,

    /// How long after local midnight the daily rollup settles. Default: 45m.
    #[serde(default = "default_daily_close", with = "humantime_serde")]
    pub daily_close: Duration,

    /// How long after the hour the hourly rollup settles. Default: 40m.
    #[serde(default = "default_hourly_close", with = "humantime_serde")]
    pub hourly_close: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_business_utc_offset() -> String {
    "+09:00".to_string()
}

fn default_daily_close() -> Duration {
    Duration::from_secs(45 * 60)
}

fn default_hourly_close() -> Duration {
    Duration::from_secs(40 * 60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            settlement: SettlementConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            business_utc_offset: default_business_utc_offset(),
            daily_close: default_daily_close(),
            hourly_close: default_hourly_close(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.clickhouse.endpoint.is_empty() {
            bail!("clickhouse.endpoint is required");
        }

        if self.server.addr.is_empty() {
            bail!("server.addr must not be empty");
        }

        parse_utc_offset(&self.settlement.business_utc_offset)
            .context("settlement.business_utc_offset is invalid")?;

        if self.settlement.daily_close >= Duration::from_secs(24 * 60 * 60) {
            bail!("settlement.daily_close must be shorter than one day");
        }
        if self.settlement.hourly_close >= Duration::from_secs(60 * 60) {
            bail!("settlement.hourly_close must be shorter than one hour");
        }

        Ok(())
    }
}
