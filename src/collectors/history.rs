//! Per-market price history kept by the monitors, and the handle used to
//! stop and await a background monitor.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::error;

use crate::shutdown::SharedShutdown;
use crate::types;

#[derive(Debug, Clone, Serialize)]
pub struct PriceRecord {
    pub timestamp: DateTime<Utc>,
    pub price_data: Value,
}

impl PriceRecord {
    pub fn new(timestamp: DateTime<Utc>, price_data: Value) -> Self {
        Self {
            timestamp,
            price_data,
        }
    }

    pub fn price(&self) -> Option<f64> {
        self.price_data.get("price").and_then(types::lenient_f64)
    }
}

/// Bounded history per market. Oldest records are dropped past `cap`.
pub struct PriceHistoryBook {
    histories: DashMap<String, VecDeque<PriceRecord>>,
    cap: usize,
}

impl PriceHistoryBook {
    pub fn new(cap: usize) -> Self {
        Self {
            histories: DashMap::new(),
            cap: cap.max(1),
        }
    }

    pub fn push(&self, market_id: &str, record: PriceRecord) {
        let mut entry = self.histories.entry(market_id.to_string()).or_default();
        entry.push_back(record);
        while entry.len() > self.cap {
            entry.pop_front();
        }
    }

    pub fn last(&self, market_id: &str) -> Option<PriceRecord> {
        self.histories.get(market_id)?.back().cloned()
    }

    /// Record before the most recent one.
    pub fn previous(&self, market_id: &str) -> Option<PriceRecord> {
        let h = self.histories.get(market_id)?;
        h.len().checked_sub(2).and_then(|i| h.get(i).cloned())
    }

    pub fn records(&self, market_id: &str) -> Vec<PriceRecord> {
        self.histories
            .get(market_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Parseable prices among the last `n` records.
    pub fn recent_prices(&self, market_id: &str, n: usize) -> Vec<f64> {
        let Some(h) = self.histories.get(market_id) else {
            return Vec::new();
        };
        let skip = h.len().saturating_sub(n);
        h.iter().skip(skip).filter_map(PriceRecord::price).collect()
    }

    pub fn len(&self, market_id: &str) -> usize {
        self.histories.get(market_id).map(|h| h.len()).unwrap_or(0)
    }

    pub fn market_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.histories.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn total_records(&self) -> usize {
        self.histories.iter().map(|e| e.value().len()).sum()
    }
}

/// A running background monitor: its stop signal plus the task to await.
pub struct MonitorHandle<T> {
    shutdown: SharedShutdown,
    join: JoinHandle<T>,
}

impl<T> MonitorHandle<T> {
    pub fn new(shutdown: SharedShutdown, join: JoinHandle<T>) -> Self {
        Self { shutdown, join }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Requests a stop and waits for the current tick to finish.
    pub async fn stop(self) -> Option<T> {
        self.shutdown.request_shutdown();
        self.join().await
    }

    /// Waits for the monitor to end on its own.
    pub async fn join(self) -> Option<T> {
        match self.join.await {
            Ok(v) => Some(v),
            Err(e) => {
                error!("Monitor task failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::shutdown::ShutdownCoordinator;

    fn rec(price: Value) -> PriceRecord {
        PriceRecord::new(Utc::now(), json!({ "price": price }))
    }

    #[test]
    fn history_is_capped() {
        let book = PriceHistoryBook::new(3);
        for p in [0.1, 0.2, 0.3, 0.4, 0.5] {
            book.push("m", rec(json!(p)));
        }
        assert_eq!(book.len("m"), 3);
        assert_eq!(book.recent_prices("m", 10), [0.3, 0.4, 0.5]);
        assert_eq!(book.last("m").unwrap().price(), Some(0.5));
        assert_eq!(book.previous("m").unwrap().price(), Some(0.4));
    }

    #[test]
    fn recent_prices_skip_unparseable_records() {
        let book = PriceHistoryBook::new(10);
        book.push("m", rec(json!("0.5")));
        book.push("m", rec(json!("n/a")));
        book.push("m", rec(json!(0.6)));
        assert_eq!(book.recent_prices("m", 2), [0.6]);
        assert_eq!(book.recent_prices("m", 3), [0.5, 0.6]);
        assert!(book.recent_prices("other", 3).is_empty());
    }

    #[test]
    fn previous_needs_two_records() {
        let book = PriceHistoryBook::new(10);
        book.push("m", rec(json!(1)));
        assert!(book.previous("m").is_none());
        assert_eq!(book.total_records(), 1);
        assert_eq!(book.market_ids(), ["m"]);
    }

    #[tokio::test]
    async fn stop_requests_shutdown_and_returns_result() {
        let shutdown = ShutdownCoordinator::shared();
        let join = {
            let shutdown = std::sync::Arc::clone(&shutdown);
            tokio::spawn(async move {
                let mut ticks = 0;
                while shutdown.sleep(Duration::from_millis(5)).await {
                    ticks += 1;
                }
                ticks
            })
        };
        let handle = MonitorHandle::new(shutdown, join);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let ticks = handle.stop().await;
        assert!(ticks.is_some());
    }
}
