use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};

pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
pub const CLOB_API_URL: &str = "https://clob.polymarket.com";

pub const USER_AGENT: &str = "Polymarket-Data-Collector/1.0";

/// Minimum gap between two requests issued through the same fetcher (milliseconds).
pub const RATE_LIMIT_DELAY_MS: u64 = 1_000;

/// Attempts per logical request, including the first one.
pub const MAX_RETRIES: u32 = 3;

pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Backoff unit. Wait after failed attempt k (0-based) is `base * 2^(k+1)`.
pub const RETRY_BACKOFF_BASE_MS: u64 = 1_000;

/// Default page size for every paginated collection.
pub const PAGE_SIZE: usize = 100;

/// Price poll cadence for continuous monitoring (seconds).
pub const PRICE_UPDATE_INTERVAL_SECS: u64 = 60;

/// Fluctuation monitor tick (seconds).
pub const FLUCTUATION_CHECK_INTERVAL_SECS: u64 = 10;

/// Relative change (0.05 = 5%) above which a price move is significant.
pub const PRICE_CHANGE_THRESHOLD: f64 = 0.05;

/// Per-market in-memory price history cap for the monitors.
pub const MAX_HISTORY_LENGTH: usize = 1_000;

/// Same (market, alert kind) pair is not re-alerted inside this window (seconds).
pub const ALERT_COOLDOWN_SECS: i64 = 300;

/// One-hour trade volume above which a volume spike alert fires.
pub const VOLUME_SPIKE_THRESHOLD: f64 = 10_000.0;
pub const VOLUME_SPIKE_HIGH: f64 = 50_000.0;

pub const PRICE_REPORT_DAYS: i64 = 30;
pub const SNAPSHOT_RETENTION_DAYS: i64 = 30;

/// Maximum number of users pulled from order/trade counterparties per ecosystem run.
pub const MAX_ECOSYSTEM_USERS: usize = 50;

/// Severity thresholds on absolute percentage change.
pub mod severity_thresholds {
    pub const CRITICAL_MIN: f64 = 20.0;
    pub const HIGH_MIN: f64 = 10.0;
    pub const MEDIUM_MIN: f64 = 5.0;
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gamma_api_url: String,
    pub clob_api_url: String,
    pub log_level: String,
    /// Root for the per-module data directories (DATA_DIR)
    pub data_dir: PathBuf,
    /// Relationship store file (DB_PATH), defaults under `<data_dir>/relationships`
    pub db_path: PathBuf,
    pub api_port: u16,
    pub rate_limit_delay: Duration,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub retry_backoff_base: Duration,
    pub page_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("relationships").join("relationships.db"));

        Ok(Self {
            gamma_api_url: std::env::var("GAMMA_API_URL")
                .unwrap_or_else(|_| GAMMA_API_URL.to_string()),
            clob_api_url: std::env::var("CLOB_API_URL")
                .unwrap_or_else(|_| CLOB_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            data_dir,
            db_path,
            api_port: parse_env("API_PORT", 3000u16)?,
            rate_limit_delay: Duration::from_millis(parse_env("RATE_LIMIT_DELAY_MS", RATE_LIMIT_DELAY_MS)?),
            max_retries: parse_env("MAX_RETRIES", MAX_RETRIES)?.max(1),
            request_timeout: Duration::from_secs(parse_env("REQUEST_TIMEOUT_SECS", REQUEST_TIMEOUT_SECS)?),
            retry_backoff_base: Duration::from_millis(parse_env(
                "RETRY_BACKOFF_BASE_MS",
                RETRY_BACKOFF_BASE_MS,
            )?),
            page_size: parse_env("PAGE_SIZE", PAGE_SIZE)?.max(1),
        })
    }

    /// Data directory of one collector module (`info`, `price`, ...).
    pub fn module_dir(&self, module: &str) -> PathBuf {
        self.data_dir.join(module)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Config pointed at local test servers with no throttling.
    pub fn for_tests(base_url: &str, data_dir: &std::path::Path) -> Self {
        Self {
            gamma_api_url: base_url.to_string(),
            clob_api_url: base_url.to_string(),
            log_level: "debug".to_string(),
            data_dir: data_dir.to_path_buf(),
            db_path: data_dir.join("relationships.db"),
            api_port: 0,
            rate_limit_delay: Duration::ZERO,
            max_retries: 2,
            request_timeout: Duration::from_secs(5),
            retry_backoff_base: Duration::from_millis(1),
            page_size: PAGE_SIZE,
        }
    }
}
