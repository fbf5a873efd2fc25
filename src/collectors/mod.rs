//! Collector modules. Each pairs one or two rate-limited fetchers with a
//! blob store under its own data directory.

pub mod fluctuation;
pub mod history;
pub mod market_info;
pub mod order;
pub mod price;
pub mod stats;
pub mod user;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::Result;
use crate::http::{HttpFetcher, LatencyStats};
use crate::shutdown::SharedShutdown;
use crate::storage::BlobStore;

pub use fluctuation::FluctuationMonitor;
pub use market_info::MarketInfoCollector;
pub use order::OrderCollector;
pub use price::PriceCollector;
pub use user::UserCollector;

/// Shared construction inputs for the collectors of one run.
#[derive(Clone)]
pub struct CollectorContext {
    pub config: Config,
    pub latency: Arc<LatencyStats>,
    pub shutdown: SharedShutdown,
}

impl CollectorContext {
    pub fn new(config: Config, latency: Arc<LatencyStats>, shutdown: SharedShutdown) -> Self {
        Self {
            config,
            latency,
            shutdown,
        }
    }

    pub fn gamma(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(&self.config.gamma_api_url, &self.config, Arc::clone(&self.latency))
    }

    pub fn clob(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(&self.config.clob_api_url, &self.config, Arc::clone(&self.latency))
    }

    pub fn blob_store(&self, module: &str) -> Result<BlobStore> {
        BlobStore::new(self.config.module_dir(module))
    }
}

/// `limit`/`offset` query pair shared by every list endpoint.
pub(crate) fn page_params(limit: usize, offset: usize) -> Vec<(&'static str, String)> {
    vec![("limit", limit.to_string()), ("offset", offset.to_string())]
}

pub(crate) fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;

    /// Context pointed at a local server, with data under `dir`.
    pub fn context(base_url: &str, dir: &std::path::Path) -> CollectorContext {
        CollectorContext::new(
            Config::for_tests(base_url, dir),
            Arc::new(LatencyStats::new()),
            ShutdownCoordinator::shared(),
        )
    }
}
