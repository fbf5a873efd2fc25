use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::collectors::history::{MonitorHandle, PriceHistoryBook, PriceRecord};
use crate::collectors::{seconds_between, stats, CollectorContext};
use crate::config;
use crate::db::RelationshipStore;
use crate::error::Result;
use crate::http::envelope::{items_or_empty, EndpointFamily};
use crate::http::HttpFetcher;
use crate::shutdown::SharedShutdown;
use crate::storage::BlobStore;
use crate::types::{self, Fidelity, PricePoint};

const BATCH_PROGRESS_EVERY: usize = 10;
const HISTORY_PROGRESS_EVERY: usize = 5;

/// Current prices, order books and price history from the CLOB API, plus
/// a background monitor that keeps an in-memory history per market.
pub struct PriceCollector {
    clob: HttpFetcher,
    store: BlobStore,
    history: PriceHistoryBook,
    relationships: Option<RelationshipStore>,
    threshold: f64,
    shutdown: SharedShutdown,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MarketPriceSnapshot {
    pub market_id: String,
    pub timestamp: String,
    /// Any of `prices`, `book`, `midpoint`, `spread` that were fetched.
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPrices {
    pub collection_timestamp: String,
    pub market_count: usize,
    pub include_detailed: bool,
    pub markets: BTreeMap<String, MarketPriceSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulk_prices: Option<Map<String, Value>>,
    pub completion_timestamp: String,
    pub duration_seconds: f64,
}

#[derive(Serialize)]
struct BatchProgress<'a> {
    completed_markets: usize,
    total_markets: usize,
    markets: &'a BTreeMap<String, MarketPriceSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketHistorySeries {
    pub market_id: String,
    pub data_points: usize,
    pub start_time: String,
    pub end_time: String,
    pub price_range: PriceRange,
    pub data: Vec<PricePoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedMarket {
    pub market_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPriceHistory {
    pub collection_timestamp: String,
    pub market_count: usize,
    pub fidelity: u32,
    pub markets: BTreeMap<String, MarketHistorySeries>,
    pub successful_markets: Vec<String>,
    pub failed_markets: Vec<FailedMarket>,
    pub completion_timestamp: String,
    pub duration_seconds: f64,
    pub success_rate: f64,
}

#[derive(Serialize)]
struct HistoryProgress {
    completed_markets: usize,
    total_markets: usize,
    successful_count: usize,
    failed_count: usize,
    fidelity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketChange {
    pub current_price: f64,
    pub last_price: f64,
    pub absolute_change: f64,
    pub percentage_change: f64,
    pub is_significant: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSummary {
    pub total_markets: usize,
    pub markets_with_changes: usize,
    pub significant_changes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceAnalysis {
    pub timestamp: String,
    pub market_changes: BTreeMap<String, MarketChange>,
    pub summary: ChangeSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignificantChange {
    pub market_id: String,
    pub current_price: f64,
    pub last_price: f64,
    pub percentage_change: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceStatistics {
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceChanges {
    pub total_change: f64,
    pub total_change_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketHistory {
    pub data_points: usize,
    pub time_range: TimeWindow,
    pub price_statistics: PriceStatistics,
    pub price_changes: PriceChanges,
}

/// Per-market entry of a price report.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MarketHistoryEntry {
    Analyzed(MarketHistory),
    Unavailable { error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeDistribution {
    pub positive_changes: usize,
    pub negative_changes: usize,
    pub no_change: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeStatistics {
    pub average_change_percent: f64,
    pub max_increase_percent: f64,
    pub max_decrease_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolatilityStatistics {
    pub average_volatility: f64,
    pub max_volatility: f64,
    pub min_volatility: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PriceReportSummary {
    pub total_markets: usize,
    pub valid_markets: usize,
    pub price_change_distribution: ChangeDistribution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_change_statistics: Option<ChangeStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volatility_statistics: Option<VolatilityStatistics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceReport {
    pub report_timestamp: String,
    pub analysis_period_days: i64,
    pub markets_analyzed: Vec<String>,
    pub summary: PriceReportSummary,
    pub detailed_analysis: BTreeMap<String, MarketHistoryEntry>,
}

impl PriceCollector {
    pub fn new(ctx: &CollectorContext) -> Result<Self> {
        Ok(Self {
            clob: ctx.clob()?,
            store: ctx.blob_store("price")?,
            history: PriceHistoryBook::new(config::MAX_HISTORY_LENGTH),
            relationships: None,
            threshold: config::PRICE_CHANGE_THRESHOLD,
            shutdown: ctx.shutdown.clone(),
        })
    }

    /// Monitor ticks append price snapshots to `store`, and reports read
    /// their history back from it.
    pub fn with_store(mut self, store: RelationshipStore) -> Self {
        self.relationships = Some(store);
        self
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn history(&self) -> &PriceHistoryBook {
        &self.history
    }

    // -----------------------------------------------------------------------
    // Fetchers
    // -----------------------------------------------------------------------

    /// Sorted by timestamp; a repeated timestamp keeps its last sample.
    /// `None` when the request failed or returned no usable points.
    pub async fn fetch_price_history(
        &self,
        market_id: &str,
        fidelity: Fidelity,
        interval: &str,
    ) -> Option<Vec<PricePoint>> {
        info!(market_id, %fidelity, "Fetching price history");
        let query = [
            ("market", market_id.to_string()),
            ("interval", interval.to_string()),
            ("fidelity", fidelity.minutes().to_string()),
        ];
        let body = self.clob.get("/prices-history", &query).await;
        if body.is_none() {
            error!(market_id, "Price history request failed");
            return None;
        }

        let mut by_ts = BTreeMap::new();
        let raw = items_or_empty(body, EndpointFamily::History);
        let raw_len = raw.len();
        for point in raw {
            let ts = point.get("t").and_then(types::lenient_f64);
            let price = point.get("p").and_then(types::lenient_f64);
            if let (Some(ts), Some(price)) = (ts, price) {
                by_ts.insert(ts as i64, price);
            }
        }
        if by_ts.len() < raw_len {
            warn!(market_id, dropped = raw_len - by_ts.len(), "Dropped duplicate or malformed points");
        }
        if by_ts.is_empty() {
            warn!(market_id, "No price history returned");
            return None;
        }
        info!(market_id, points = by_ts.len(), "Fetched price history");
        Some(
            by_ts
                .into_iter()
                .map(|(timestamp, price)| PricePoint { timestamp, price })
                .collect(),
        )
    }

    /// `{market_id: {price, ..}}` for the requested markets.
    pub async fn fetch_market_prices(&self, market_ids: &[String]) -> Option<Map<String, Value>> {
        let mut query = Vec::new();
        if !market_ids.is_empty() {
            query.push(("market_ids", market_ids.join(",")));
        }
        match self.clob.get("/prices", &query).await {
            Some(Value::Object(prices)) if !prices.is_empty() => {
                info!(markets = prices.len(), "Fetched market prices");
                Some(prices)
            }
            Some(_) => {
                warn!("Price response was empty or not an object");
                None
            }
            None => None,
        }
    }

    pub async fn fetch_market_book(&self, token_id: &str) -> Option<Value> {
        self.token_endpoint("/book", token_id).await
    }

    pub async fn fetch_market_midpoint(&self, token_id: &str) -> Option<Value> {
        self.token_endpoint("/midpoint", token_id).await
    }

    pub async fn fetch_market_spread(&self, token_id: &str) -> Option<Value> {
        self.token_endpoint("/spread", token_id).await
    }

    async fn token_endpoint(&self, path: &str, token_id: &str) -> Option<Value> {
        let body = self.clob.get(path, &[("token_id", token_id.to_string())]).await;
        if body.is_none() {
            warn!(path, token_id, "Token endpoint request failed");
        }
        body
    }

    /// Prices, book, midpoint and spread of one market; missing parts are omitted.
    pub async fn fetch_comprehensive_market_data(&self, market_id: &str) -> MarketPriceSnapshot {
        let mut data = Map::new();
        if let Some(prices) = self.fetch_market_prices(&[market_id.to_string()]).await {
            data.insert("prices".into(), Value::Object(prices));
        }
        for (name, part) in [
            ("book", self.fetch_market_book(market_id).await),
            ("midpoint", self.fetch_market_midpoint(market_id).await),
            ("spread", self.fetch_market_spread(market_id).await),
        ] {
            if let Some(v) = part {
                data.insert(name.into(), v);
            }
        }
        MarketPriceSnapshot {
            market_id: market_id.to_string(),
            timestamp: types::now_iso(),
            data,
        }
    }

    // -----------------------------------------------------------------------
    // Batch collection
    // -----------------------------------------------------------------------

    pub async fn collect_batch_prices(&self, market_ids: &[String], include_detailed: bool) -> BatchPrices {
        let start = Utc::now();
        let stamp = types::file_stamp(start);
        info!(markets = market_ids.len(), include_detailed, "Collecting batch prices");

        let bulk_prices = self.fetch_market_prices(market_ids).await;
        let mut markets = BTreeMap::new();

        if include_detailed {
            for (i, market_id) in market_ids.iter().enumerate() {
                if self.shutdown.is_shutdown_requested() {
                    warn!(completed = i, "Batch price collection interrupted");
                    break;
                }
                info!("Processing market {}/{}: {market_id}", i + 1, market_ids.len());
                let snapshot = self.fetch_comprehensive_market_data(market_id).await;
                markets.insert(market_id.clone(), snapshot);

                if (i + 1) % BATCH_PROGRESS_EVERY == 0 {
                    let progress = BatchProgress {
                        completed_markets: i + 1,
                        total_markets: market_ids.len(),
                        markets: &markets,
                    };
                    if let Err(e) = self
                        .store
                        .save_progress(&format!("batch_collection_progress_{stamp}.json"), &progress)
                    {
                        warn!("Failed to save batch progress: {e}");
                    }
                }
            }
        }

        let end = Utc::now();
        let batch = BatchPrices {
            collection_timestamp: types::iso(start),
            market_count: market_ids.len(),
            include_detailed,
            markets,
            bulk_prices,
            completion_timestamp: types::iso(end),
            duration_seconds: seconds_between(start, end),
        };
        self.save(&format!("batch_prices_{stamp}.json"), &batch);
        info!(duration_s = batch.duration_seconds, "Batch price collection finished");
        batch
    }

    pub async fn collect_batch_price_history(&self, market_ids: &[String], fidelity: Fidelity) -> BatchPriceHistory {
        let start = Utc::now();
        let stamp = types::file_stamp(start);
        info!(markets = market_ids.len(), %fidelity, "Collecting batch price history");

        let mut markets = BTreeMap::new();
        let mut successful_markets = Vec::new();
        let mut failed_markets = Vec::new();

        for (i, market_id) in market_ids.iter().enumerate() {
            if self.shutdown.is_shutdown_requested() {
                warn!(completed = i, "Batch history collection interrupted");
                break;
            }
            info!("Processing market {}/{}: {market_id}", i + 1, market_ids.len());

            match self.fetch_price_history(market_id, fidelity, "max").await {
                Some(points) => {
                    if let Err(e) = self.store.write_price_history_csv(market_id, fidelity, &points) {
                        warn!(market_id, "Failed to write price history CSV: {e}");
                    }
                    markets.insert(market_id.clone(), history_series(market_id, points));
                    successful_markets.push(market_id.clone());
                }
                None => {
                    warn!(market_id, "No price history");
                    failed_markets.push(FailedMarket {
                        market_id: market_id.clone(),
                        reason: "No data returned".to_string(),
                    });
                }
            }

            if (i + 1) % HISTORY_PROGRESS_EVERY == 0 {
                let progress = HistoryProgress {
                    completed_markets: i + 1,
                    total_markets: market_ids.len(),
                    successful_count: successful_markets.len(),
                    failed_count: failed_markets.len(),
                    fidelity: fidelity.minutes(),
                };
                self.save(&format!("batch_history_progress_{stamp}.json"), &progress);
            }
        }

        let end = Utc::now();
        let success_rate = if market_ids.is_empty() {
            0.0
        } else {
            successful_markets.len() as f64 / market_ids.len() as f64 * 100.0
        };
        let batch = BatchPriceHistory {
            collection_timestamp: types::iso(start),
            market_count: market_ids.len(),
            fidelity: fidelity.minutes(),
            markets,
            successful_markets,
            failed_markets,
            completion_timestamp: types::iso(end),
            duration_seconds: seconds_between(start, end),
            success_rate,
        };
        self.save(&format!("batch_price_history_{fidelity}_{stamp}.json"), &batch);
        info!(
            succeeded = batch.successful_markets.len(),
            failed = batch.failed_markets.len(),
            "Batch price history finished, success rate {:.1}%",
            batch.success_rate
        );
        batch
    }

    // -----------------------------------------------------------------------
    // Continuous monitoring
    // -----------------------------------------------------------------------

    /// Polls prices every `interval` on a background task until the handle
    /// is stopped or the run shuts down. The task yields its tick count.
    pub fn start_continuous_monitoring(
        self: &Arc<Self>,
        market_ids: Vec<String>,
        interval: Duration,
    ) -> MonitorHandle<usize> {
        info!(markets = market_ids.len(), interval_s = interval.as_secs_f64(), "Starting price monitoring");
        let shutdown = self.shutdown.child();
        let collector = Arc::clone(self);
        let loop_shutdown = Arc::clone(&shutdown);
        let join = tokio::spawn(async move {
            let mut ticks = 0usize;
            while !loop_shutdown.is_shutdown_requested() {
                collector.monitor_tick(&market_ids).await;
                ticks += 1;
                if !loop_shutdown.sleep(interval).await {
                    break;
                }
            }
            info!(ticks, "Price monitoring stopped");
            ticks
        });
        MonitorHandle::new(shutdown, join)
    }

    async fn monitor_tick(&self, market_ids: &[String]) {
        let now = Utc::now();
        let stamp = types::file_stamp(now);
        let Some(current) = self.fetch_market_prices(market_ids).await else {
            return;
        };

        let analysis = self.analyze_price_changes(&current);
        let monitoring = json!({
            "timestamp": types::iso(now),
            "prices": &current,
            "analysis": &analysis,
        });
        self.save(&format!("monitoring_{stamp}.json"), &monitoring);

        self.update_price_history(&current, now);
        if let Some(rel) = &self.relationships {
            if let Err(e) = rel.append_price_snapshot(&current, None).await {
                error!("Failed to append price snapshot: {e}");
            }
        }

        let significant = detect_significant_changes(&analysis);
        if !significant.is_empty() {
            warn!(markets = significant.len(), "Significant price changes detected");
            let alerts = json!({
                "timestamp": types::iso(now),
                "significant_changes": significant,
            });
            self.save(&format!("price_alerts_{stamp}.json"), &alerts);
        }
    }

    pub fn update_price_history(&self, prices: &Map<String, Value>, timestamp: DateTime<Utc>) {
        for (market_id, info) in prices {
            self.history
                .push(market_id, PriceRecord::new(timestamp, info.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // Analysis
    // -----------------------------------------------------------------------

    /// Compares each current price with the last recorded one. Markets with no
    /// history or an unparseable price on either side are left out.
    pub fn analyze_price_changes(&self, current: &Map<String, Value>) -> PriceAnalysis {
        let threshold_pct = self.threshold * 100.0;
        let mut market_changes = BTreeMap::new();
        let mut summary = ChangeSummary {
            total_markets: current.len(),
            ..ChangeSummary::default()
        };

        for (market_id, info) in current {
            let Some(last_price) = self.history.last(market_id).and_then(|r| r.price()) else {
                continue;
            };
            let Some(current_price) = info.get("price").and_then(types::lenient_f64) else {
                continue;
            };
            let change = stats::price_change(last_price, current_price);
            let is_significant = change.percentage_change.abs() >= threshold_pct;
            if change.absolute_change != 0.0 {
                summary.markets_with_changes += 1;
            }
            if is_significant {
                summary.significant_changes += 1;
            }
            market_changes.insert(
                market_id.clone(),
                MarketChange {
                    current_price,
                    last_price,
                    absolute_change: change.absolute_change,
                    percentage_change: change.percentage_change,
                    is_significant,
                },
            );
        }

        PriceAnalysis {
            timestamp: types::now_iso(),
            market_changes,
            summary,
        }
    }

    pub async fn generate_price_report(&self, market_ids: Option<&[String]>, days: i64) -> PriceReport {
        info!(days, "Generating price report");
        let ids = match market_ids {
            Some(ids) if !ids.is_empty() => ids.to_vec(),
            _ => self.known_markets().await,
        };
        self.seed_history_from_store(&ids, days).await;

        let detailed_analysis: BTreeMap<String, MarketHistoryEntry> = ids
            .iter()
            .filter(|id| self.history.len(id) > 0)
            .map(|id| (id.clone(), self.analyze_market_history(id, days)))
            .collect();

        let report = PriceReport {
            report_timestamp: types::now_iso(),
            analysis_period_days: days,
            markets_analyzed: ids,
            summary: summarize_report(&detailed_analysis),
            detailed_analysis,
        };
        self.save(&format!("price_report_{}.json", types::file_stamp(Utc::now())), &report);
        info!(
            markets = report.detailed_analysis.len(),
            valid = report.summary.valid_markets,
            "Price report generated"
        );
        report
    }

    pub fn analyze_market_history(&self, market_id: &str, days: i64) -> MarketHistoryEntry {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let recent: Vec<PriceRecord> = self
            .history
            .records(market_id)
            .into_iter()
            .filter(|r| r.timestamp >= cutoff)
            .collect();
        let (Some(first), Some(last)) = (recent.first(), recent.last()) else {
            return MarketHistoryEntry::Unavailable {
                error: "no data in the requested window".to_string(),
            };
        };
        let prices: Vec<f64> = recent.iter().filter_map(PriceRecord::price).collect();
        let (Some(&first_price), Some(&current)) = (prices.first(), prices.last()) else {
            return MarketHistoryEntry::Unavailable {
                error: "no valid price data".to_string(),
            };
        };

        MarketHistoryEntry::Analyzed(MarketHistory {
            data_points: prices.len(),
            time_range: TimeWindow {
                start: types::iso(first.timestamp),
                end: types::iso(last.timestamp),
            },
            price_statistics: PriceStatistics {
                current,
                min: prices.iter().copied().fold(f64::INFINITY, f64::min),
                max: prices.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                average: stats::mean(&prices),
                volatility: stats::volatility(&prices),
            },
            price_changes: PriceChanges {
                total_change: current - first_price,
                total_change_percent: stats::total_change_percent(&prices),
            },
        })
    }

    async fn known_markets(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self.history.market_ids().into_iter().collect();
        if let Some(rel) = &self.relationships {
            match rel.snapshot_market_ids().await {
                Ok(stored) => ids.extend(stored),
                Err(e) => error!("Failed to list snapshot markets: {e}"),
            }
        }
        ids.into_iter().collect()
    }

    /// Fills empty in-memory histories from stored snapshots of the last `days`.
    async fn seed_history_from_store(&self, market_ids: &[String], days: i64) {
        let Some(rel) = &self.relationships else {
            return;
        };
        let since = types::iso(Utc::now() - chrono::Duration::days(days));
        for market_id in market_ids.iter().filter(|id| self.history.len(id) == 0) {
            let rows = match rel.snapshot_history(market_id, &since).await {
                Ok(rows) => rows,
                Err(e) => {
                    error!(market_id, "Failed to read price snapshots: {e}");
                    continue;
                }
            };
            for row in rows {
                let Ok(ts) = DateTime::parse_from_rfc3339(&row.timestamp) else {
                    continue;
                };
                self.history.push(
                    market_id,
                    PriceRecord::new(ts.with_timezone(&Utc), json!({ "price": row.price })),
                );
            }
        }
    }

    fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) {
        if let Err(e) = self.store.save_json(name, value) {
            warn!(file = name, "Failed to save: {e}");
        }
    }
}

pub fn detect_significant_changes(analysis: &PriceAnalysis) -> Vec<SignificantChange> {
    analysis
        .market_changes
        .iter()
        .filter(|(_, c)| c.is_significant)
        .map(|(market_id, c)| SignificantChange {
            market_id: market_id.clone(),
            current_price: c.current_price,
            last_price: c.last_price,
            percentage_change: c.percentage_change,
            timestamp: analysis.timestamp.clone(),
        })
        .collect()
}

fn history_series(market_id: &str, points: Vec<PricePoint>) -> MarketHistorySeries {
    let prices: Vec<f64> = points.iter().map(|p| p.price).collect();
    let iso_at = |ts: Option<&PricePoint>| {
        ts.and_then(|p| DateTime::from_timestamp(p.timestamp, 0))
            .map(types::iso)
            .unwrap_or_default()
    };
    MarketHistorySeries {
        market_id: market_id.to_string(),
        data_points: points.len(),
        start_time: iso_at(points.first()),
        end_time: iso_at(points.last()),
        price_range: PriceRange {
            min: prices.iter().copied().fold(f64::INFINITY, f64::min),
            max: prices.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean: stats::mean(&prices),
            std: stats::sample_std(&prices),
        },
        data: points,
    }
}

fn summarize_report(detailed: &BTreeMap<String, MarketHistoryEntry>) -> PriceReportSummary {
    let valid: Vec<&MarketHistory> = detailed
        .values()
        .filter_map(|e| match e {
            MarketHistoryEntry::Analyzed(h) => Some(h),
            MarketHistoryEntry::Unavailable { .. } => None,
        })
        .collect();

    let changes: Vec<f64> = valid.iter().map(|h| h.price_changes.total_change_percent).collect();
    let volatilities: Vec<f64> = valid.iter().map(|h| h.price_statistics.volatility).collect();

    let price_change_distribution = ChangeDistribution {
        positive_changes: changes.iter().filter(|c| **c > 0.0).count(),
        negative_changes: changes.iter().filter(|c| **c < 0.0).count(),
        no_change: changes.iter().filter(|c| **c == 0.0).count(),
    };
    let price_change_statistics = (!changes.is_empty()).then(|| ChangeStatistics {
        average_change_percent: stats::mean(&changes),
        max_increase_percent: changes.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        max_decrease_percent: changes.iter().copied().fold(f64::INFINITY, f64::min),
    });
    let volatility_statistics = (!volatilities.is_empty()).then(|| VolatilityStatistics {
        average_volatility: stats::mean(&volatilities),
        max_volatility: volatilities.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        min_volatility: volatilities.iter().copied().fold(f64::INFINITY, f64::min),
    });

    PriceReportSummary {
        total_markets: detailed.len(),
        valid_markets: valid.len(),
        price_change_distribution,
        price_change_statistics,
        volatility_statistics,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{extract::Query, routing::get, Json, Router};

    use super::*;
    use crate::collectors::testing::context;
    use crate::test_support::spawn_server;

    type Params = Query<std::collections::HashMap<String, String>>;

    fn prices(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn offline_collector(dir: &std::path::Path) -> PriceCollector {
        PriceCollector::new(&context("http://127.0.0.1:9", dir)).unwrap()
    }

    #[tokio::test]
    async fn analysis_flags_moves_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let c = offline_collector(dir.path());
        c.update_price_history(
            &prices(json!({"up": {"price": "0.50"}, "flat": {"price": 0.4}, "small": {"price": 1.0}})),
            Utc::now(),
        );

        let analysis = c.analyze_price_changes(&prices(json!({
            "up": {"price": "0.60"},
            "flat": {"price": 0.4},
            "small": {"price": 1.01},
            "new": {"price": 0.3}
        })));

        assert_eq!(analysis.summary.total_markets, 4);
        assert_eq!(analysis.market_changes.len(), 3, "no history for the new market");
        assert_eq!(analysis.summary.markets_with_changes, 2);
        assert_eq!(analysis.summary.significant_changes, 1);
        assert!(analysis.market_changes["up"].is_significant);
        assert!((analysis.market_changes["up"].percentage_change - 20.0).abs() < 1e-9);

        let significant = detect_significant_changes(&analysis);
        assert_eq!(significant.len(), 1);
        assert_eq!(significant[0].market_id, "up");
        assert_eq!(significant[0].last_price, 0.5);
    }

    #[tokio::test]
    async fn price_history_is_sorted_and_deduplicated() {
        let app = Router::new().route(
            "/prices-history",
            get(|Query(q): Params| async move {
                assert_eq!(q.get("fidelity").map(String::as_str), Some("60"));
                Json(json!({"history": [
                    {"t": 300, "p": 0.3},
                    {"t": 100, "p": "0.1"},
                    {"t": 200, "p": 0.2},
                    {"t": 200, "p": 0.25},
                    {"t": 400, "p": "bad"}
                ]}))
            }),
        );
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let c = PriceCollector::new(&context(&base, dir.path())).unwrap();

        let points = c.fetch_price_history("m1", Fidelity::Hour, "max").await.unwrap();
        let ts: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, [100, 200, 300]);
        assert_eq!(points[1].price, 0.25);
    }

    #[tokio::test]
    async fn batch_history_records_failures_and_writes_csv() {
        let app = Router::new().route(
            "/prices-history",
            get(|Query(q): Params| async move {
                match q.get("market").map(String::as_str) {
                    Some("good") => Json(json!({"history": [{"t": 1, "p": 0.2}, {"t": 2, "p": 0.4}]})),
                    _ => Json(json!({"history": []})),
                }
            }),
        );
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let c = PriceCollector::new(&context(&base, dir.path())).unwrap();

        let ids = vec!["good".to_string(), "empty".to_string()];
        let batch = c.collect_batch_price_history(&ids, Fidelity::Day).await;

        assert_eq!(batch.successful_markets, ["good"]);
        assert_eq!(batch.failed_markets[0].market_id, "empty");
        assert_eq!(batch.failed_markets[0].reason, "No data returned");
        assert_eq!(batch.success_rate, 50.0);
        let series = &batch.markets["good"];
        assert_eq!(series.data_points, 2);
        assert!((series.price_range.mean - 0.3).abs() < 1e-9);
        assert!((series.price_range.std - 0.02f64.sqrt()).abs() < 1e-9);
        assert!(dir.path().join("price/market_good_day_history.csv").exists());
    }

    #[tokio::test]
    async fn batch_prices_include_details_when_asked() {
        let app = Router::new()
            .route("/prices", get(|| async { Json(json!({"m1": {"price": "0.5"}})) }))
            .route("/book", get(|| async { Json(json!({"bids": [], "asks": []})) }))
            .route("/midpoint", get(|| async { Json(json!({"mid": "0.5"})) }));
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let c = PriceCollector::new(&context(&base, dir.path())).unwrap();

        let batch = c.collect_batch_prices(&["m1".to_string()], true).await;
        assert_eq!(batch.bulk_prices.unwrap()["m1"]["price"], "0.5");
        let data = &batch.markets["m1"].data;
        assert!(data.contains_key("prices"));
        assert!(data.contains_key("book"));
        assert!(data.contains_key("midpoint"));
        assert!(!data.contains_key("spread"), "spread endpoint is missing");
    }

    #[tokio::test]
    async fn report_summarises_history() {
        let dir = tempfile::tempdir().unwrap();
        let c = offline_collector(dir.path());
        let now = Utc::now();
        for (i, (a, b)) in [(1.0, 2.0), (1.0, 1.1), (2.0, 1.0)].into_iter().enumerate() {
            let t = now - chrono::Duration::minutes(10 - i as i64);
            c.update_price_history(&prices(json!({"rise": {"price": a}, "fall": {"price": b}})), t);
        }

        let report = c.generate_price_report(None, 30).await;
        assert_eq!(report.markets_analyzed, ["fall", "rise"]);
        let MarketHistoryEntry::Analyzed(rise) = &report.detailed_analysis["rise"] else {
            panic!("rise should be analysable");
        };
        assert_eq!(rise.data_points, 3);
        assert_eq!(rise.price_statistics.current, 2.0);
        assert_eq!(rise.price_changes.total_change_percent, 100.0);
        assert!(rise.price_statistics.volatility > 0.0);

        let summary = &report.summary;
        assert_eq!(summary.valid_markets, 2);
        assert_eq!(summary.price_change_distribution.positive_changes, 1);
        assert_eq!(summary.price_change_distribution.negative_changes, 1);
        assert_eq!(summary.price_change_statistics.as_ref().unwrap().max_decrease_percent, -50.0);
    }

    #[tokio::test]
    async fn report_reads_history_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let rel = RelationshipStore::in_memory().await.unwrap();
        rel.append_price_snapshot(&prices(json!({"m1": {"price": 0.4}})), None).await.unwrap();
        rel.append_price_snapshot(&prices(json!({"m1": {"price": 0.5}})), None).await.unwrap();
        let c = offline_collector(dir.path()).with_store(rel);

        let report = c.generate_price_report(None, 30).await;
        let MarketHistoryEntry::Analyzed(m1) = &report.detailed_analysis["m1"] else {
            panic!("m1 should be analysable");
        };
        assert_eq!(m1.data_points, 2);
        assert!((m1.price_changes.total_change_percent - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_window_is_reported_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let c = offline_collector(dir.path());
        c.update_price_history(
            &prices(json!({"old": {"price": 1}})),
            Utc::now() - chrono::Duration::days(60),
        );
        let entry = c.analyze_market_history("old", 30);
        assert!(matches!(entry, MarketHistoryEntry::Unavailable { .. }));
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("error").is_some());
    }

    #[tokio::test]
    async fn continuous_monitoring_records_and_stops() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/prices",
            get({
                let calls = Arc::clone(&calls);
                move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Json(json!({"m1": {"price": 0.5 + n as f64 * 0.1}})) }
                }
            }),
        );
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let rel = RelationshipStore::in_memory().await.unwrap();
        let c = Arc::new(
            PriceCollector::new(&context(&base, dir.path()))
                .unwrap()
                .with_store(rel.clone()),
        );

        let handle = c.start_continuous_monitoring(vec!["m1".to_string()], Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        let ticks = handle.stop().await.unwrap();

        assert!(ticks >= 1);
        assert!(c.history().len("m1") >= 1);
        assert_eq!(rel.totals().await.unwrap().snapshots as usize, c.history().len("m1"));
        let monitoring_files = std::fs::read_dir(dir.path().join("price"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("monitoring_"))
            .count();
        assert!(monitoring_files >= 1);
    }
}
