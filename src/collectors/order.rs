use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::collectors::stats::{self, AmountStats, PriceStats, TimeRange};
use crate::collectors::{page_params, seconds_between, CollectorContext};
use crate::error::Result;
use crate::http::envelope::{items_or_empty, page_outcome, EndpointFamily};
use crate::http::HttpFetcher;
use crate::paginator::{Collected, CollectionKey, PageOutcome, ResumablePaginator};
use crate::shutdown::SharedShutdown;
use crate::storage::BlobStore;
use crate::types::{self, Entity, OrderStatus};

/// Distributions with more buckets than this are folded into `others`.
const TOP_BUCKETS: usize = 10;

/// Orders, active orders and trades from the CLOB API.
pub struct OrderCollector {
    clob: HttpFetcher,
    store: BlobStore,
    page_size: usize,
    shutdown: SharedShutdown,
}

/// Query filters shared by `/orders` and `/trades`. `status` only applies to orders.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter<'a> {
    pub market: Option<&'a str>,
    pub maker: Option<&'a str>,
    pub taker: Option<&'a str>,
    pub status: Option<OrderStatus>,
}

impl<'a> RecordFilter<'a> {
    pub fn market(market: Option<&'a str>) -> Self {
        Self {
            market,
            ..Self::default()
        }
    }

    fn apply(&self, query: &mut Vec<(&'static str, String)>) {
        if let Some(m) = self.market {
            query.push(("market", m.to_string()));
        }
        if let Some(m) = self.maker {
            query.push(("maker", m.to_string()));
        }
        if let Some(t) = self.taker {
            query.push(("taker", t.to_string()));
        }
        if let Some(s) = self.status {
            query.push(("status", s.to_string()));
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct OrderAnalysis {
    pub total_orders: usize,
    pub status_distribution: BTreeMap<String, u64>,
    pub side_distribution: BTreeMap<String, u64>,
    pub market_distribution: BTreeMap<String, u64>,
    pub maker_distribution: BTreeMap<String, u64>,
    pub price_statistics: Option<PriceStats>,
    pub size_statistics: Option<AmountStats>,
    pub time_analysis: Option<TimeRange>,
    pub analysis_timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeAnalysis {
    pub total_trades: usize,
    pub status_distribution: BTreeMap<String, u64>,
    pub market_distribution: BTreeMap<String, u64>,
    pub volume_statistics: Option<AmountStats>,
    pub price_statistics: Option<PriceStats>,
    pub time_analysis: Option<TimeRange>,
    pub analysis_timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisDigest {
    pub total: usize,
    pub status_types: usize,
    pub markets_involved: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderCollectionSummary {
    pub market: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub duration_seconds: f64,
    pub orders_collected: usize,
    pub orders_complete: bool,
    pub active_orders: usize,
    pub trades_collected: usize,
    pub trades_complete: bool,
    pub analysis_included: bool,
    pub data_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_analysis_summary: Option<AnalysisDigest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_analysis_summary: Option<AnalysisDigest>,
}

impl OrderCollector {
    pub fn new(ctx: &CollectorContext) -> Result<Self> {
        Ok(Self {
            clob: ctx.clob()?,
            store: ctx.blob_store("order")?,
            page_size: ctx.config.page_size,
            shutdown: ctx.shutdown.clone(),
        })
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Fetchers
    // -----------------------------------------------------------------------

    pub async fn fetch_order_by_id(&self, order_id: &str) -> Option<Value> {
        let order = self.clob.get(&format!("/order/{order_id}"), &[]).await;
        if order.is_none() {
            warn!(order_id, "Failed to fetch order");
        }
        order
    }

    pub async fn fetch_orders(&self, filter: &RecordFilter<'_>, limit: usize, offset: usize) -> PageOutcome {
        let mut query = page_params(limit, offset);
        filter.apply(&mut query);
        let outcome = page_outcome(self.clob.get("/orders", &query).await, EndpointFamily::Records);
        if let PageOutcome::Page { items: ref orders, .. } = outcome {
            info!(offset, count = orders.len(), "Fetched orders");
        }
        outcome
    }

    pub async fn fetch_active_orders(&self, market: Option<&str>, maker: Option<&str>) -> Vec<Entity> {
        let mut query = Vec::new();
        RecordFilter {
            market,
            maker,
            ..RecordFilter::default()
        }
        .apply(&mut query);
        let orders = items_or_empty(self.clob.get("/orders/active", &query).await, EndpointFamily::Records);
        info!(count = orders.len(), "Fetched active orders");
        orders
    }

    /// `status` in the filter is ignored; trades carry no order status.
    pub async fn fetch_trades(&self, filter: &RecordFilter<'_>, limit: usize, offset: usize) -> PageOutcome {
        let mut query = page_params(limit, offset);
        RecordFilter {
            status: None,
            ..filter.clone()
        }
        .apply(&mut query);
        let outcome = page_outcome(self.clob.get("/trades", &query).await, EndpointFamily::Records);
        if let PageOutcome::Page { items: ref trades, .. } = outcome {
            info!(offset, count = trades.len(), "Fetched trades");
        }
        outcome
    }

    pub async fn fetch_all_orders(&self, market: Option<&str>, status: Option<OrderStatus>) -> Collected {
        let key = CollectionKey::orders(market, status);
        let filter = RecordFilter {
            market,
            status,
            ..RecordFilter::default()
        };
        info!(collection = key.name(), "Collecting all orders");
        self.paginator()
            .run(&key, |offset, limit| {
                let filter = filter.clone();
                async move { self.fetch_orders(&filter, limit, offset).await }
            })
            .await
    }

    pub async fn fetch_all_trades(&self, market: Option<&str>) -> Collected {
        let key = CollectionKey::trades(market);
        let filter = RecordFilter::market(market);
        info!(collection = key.name(), "Collecting all trades");
        self.paginator()
            .run(&key, |offset, limit| {
                let filter = filter.clone();
                async move { self.fetch_trades(&filter, limit, offset).await }
            })
            .await
    }

    fn paginator(&self) -> ResumablePaginator<'_> {
        ResumablePaginator::new(&self.store, self.page_size, self.shutdown.clone())
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    pub async fn run_comprehensive_collection(
        &self,
        market: Option<&str>,
        include_analysis: bool,
    ) -> OrderCollectionSummary {
        let start = Utc::now();
        let label = market.unwrap_or("all");
        info!(market = label, "Starting order collection");

        let orders = self.fetch_all_orders(market, None).await;
        let active = self.fetch_active_orders(market, None).await;
        let trades = self.fetch_all_trades(market).await;

        let mut data_files = vec![
            CollectionKey::orders(market, None).final_file(),
            format!("active_orders_{label}.json"),
            CollectionKey::trades(market).final_file(),
        ];

        let mut order_digest = None;
        let mut trade_digest = None;
        if include_analysis {
            if let Some(a) = analyze_orders(&orders.items) {
                let file = format!("order_analysis_{label}.json");
                self.save(&file, &a);
                data_files.push(file);
                order_digest = Some(AnalysisDigest {
                    total: a.total_orders,
                    status_types: a.status_distribution.len(),
                    markets_involved: a.market_distribution.len(),
                });
            }
            if let Some(a) = analyze_trades(&trades.items) {
                let file = format!("trade_analysis_{label}.json");
                self.save(&file, &a);
                data_files.push(file);
                trade_digest = Some(AnalysisDigest {
                    total: a.total_trades,
                    status_types: a.status_distribution.len(),
                    markets_involved: a.market_distribution.len(),
                });
            }
        }
        if !active.is_empty() {
            self.save(&format!("active_orders_{label}.json"), &active);
        }

        let end = Utc::now();
        let summary = OrderCollectionSummary {
            market: market.map(str::to_string),
            start_time: types::iso(start),
            end_time: types::iso(end),
            duration_seconds: seconds_between(start, end),
            orders_collected: orders.items.len(),
            orders_complete: orders.is_complete(),
            active_orders: active.len(),
            trades_collected: trades.items.len(),
            trades_complete: trades.is_complete(),
            analysis_included: include_analysis,
            data_files,
            order_analysis_summary: order_digest,
            trade_analysis_summary: trade_digest,
        };
        self.save(&format!("collection_summary_{label}.json"), &summary);
        info!(
            market = label,
            orders = summary.orders_collected,
            trades = summary.trades_collected,
            "Order collection finished in {:.2}s",
            summary.duration_seconds
        );
        summary
    }

    /// Deletes the order and trade checkpoints for this filter.
    pub fn reset(&self, market: Option<&str>, status: Option<OrderStatus>) -> bool {
        let paginator = self.paginator();
        let orders = paginator.reset(&CollectionKey::orders(market, status));
        let trades = paginator.reset(&CollectionKey::trades(market));
        orders || trades
    }

    fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) {
        if let Err(e) = self.store.save_json(name, value) {
            warn!(file = name, "Failed to save: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

pub fn analyze_orders(orders: &[Entity]) -> Option<OrderAnalysis> {
    if orders.is_empty() {
        return None;
    }
    Some(OrderAnalysis {
        total_orders: orders.len(),
        status_distribution: stats::distribution(orders, "status"),
        side_distribution: stats::distribution(orders, "side"),
        market_distribution: stats::top_n_with_others(stats::distribution(orders, "market"), TOP_BUCKETS),
        maker_distribution: stats::top_n_with_others(stats::distribution(orders, "maker"), TOP_BUCKETS),
        price_statistics: stats::price_stats(&stats::numeric_field(orders, "price")),
        size_statistics: stats::amount_stats(&stats::numeric_field(orders, "size")),
        time_analysis: stats::time_range(orders, "created_at"),
        analysis_timestamp: types::now_iso(),
    })
}

pub fn analyze_trades(trades: &[Entity]) -> Option<TradeAnalysis> {
    if trades.is_empty() {
        return None;
    }
    Some(TradeAnalysis {
        total_trades: trades.len(),
        status_distribution: stats::distribution(trades, "status"),
        market_distribution: stats::top_n_with_others(stats::distribution(trades, "market"), TOP_BUCKETS),
        volume_statistics: stats::amount_stats(&stats::numeric_field(trades, "volume")),
        price_statistics: stats::price_stats(&stats::numeric_field(trades, "price")),
        time_analysis: stats::time_range(trades, "timestamp"),
        analysis_timestamp: types::now_iso(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{extract::Query, routing::get, Json, Router};
    use serde_json::json;

    use super::*;
    use crate::collectors::testing::context;
    use crate::test_support::spawn_server;

    type Params = Query<HashMap<String, String>>;

    fn ents(v: Value) -> Vec<Entity> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|e| e.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn order_analysis_folds_long_tails() {
        let mut orders: Vec<Entity> = (0..12)
            .map(|i| {
                json!({"id": i, "market": format!("m{i}"), "maker": "0xA", "side": "BUY",
                       "price": "0.5", "size": 10, "status": "LIVE"})
                .as_object()
                .cloned()
                .unwrap()
            })
            .collect();
        orders.extend(ents(json!([
            {"id": "x", "market": "m0", "price": "bad", "size": "5", "created_at": "2024-01-01T00:00:00Z"},
            {"id": "y", "market": "m0", "price": 0.9, "created_at": "2024-01-01T01:00:00Z"}
        ])));

        let a = analyze_orders(&orders).unwrap();
        assert_eq!(a.total_orders, 14);
        assert_eq!(a.market_distribution.len(), 11);
        assert_eq!(a.market_distribution["m0"], 3);
        assert_eq!(a.market_distribution["others"], 2);
        assert_eq!(a.side_distribution["unknown"], 2);
        assert_eq!(a.maker_distribution["0xA"], 12);

        let price = a.price_statistics.unwrap();
        assert_eq!(price.count, 13);
        assert_eq!(price.max, 0.9);
        assert_eq!(price.median, 0.5);
        let size = a.size_statistics.unwrap();
        assert_eq!(size.total, 125.0);
        assert_eq!(a.time_analysis.unwrap().span_seconds, Some(3600));
        assert!(analyze_orders(&[]).is_none());
    }

    #[test]
    fn trade_analysis_statistics() {
        let trades = ents(json!([
            {"market": "m1", "volume": "10", "price": "0.4", "status": "MATCHED", "timestamp": "2024-01-01T00:00:00Z"},
            {"market": "m1", "volume": 30, "price": "0.6"},
            {"market": "m2", "volume": "n/a"}
        ]));
        let a = analyze_trades(&trades).unwrap();
        assert_eq!(a.total_trades, 3);
        assert_eq!(a.market_distribution["m1"], 2);
        assert_eq!(a.status_distribution["unknown"], 2);
        let vol = a.volume_statistics.unwrap();
        assert_eq!(vol.count, 2);
        assert_eq!(vol.average, 20.0);
        assert_eq!(a.price_statistics.unwrap().median, 0.6);
        assert_eq!(a.time_analysis.unwrap().span_seconds, Some(0));
    }

    async fn orders(Query(q): Params) -> Json<Value> {
        assert_eq!(q.get("market").map(String::as_str), Some("m1"));
        let offset: usize = q.get("offset").and_then(|o| o.parse().ok()).unwrap_or(0);
        let page = match offset {
            0 => json!({"data": [{"id": "o1", "market": "m1", "status": "LIVE"}, {"id": "o2", "market": "m1"}]}),
            _ => json!({"data": [{"id": "o2", "market": "m1"}]}),
        };
        Json(page)
    }

    async fn trades(Query(q): Params) -> Json<Value> {
        assert!(!q.contains_key("status"));
        Json(json!([{"id": "t1", "market": "m1", "volume": "3"}]))
    }

    #[tokio::test]
    async fn comprehensive_collection_writes_every_artifact() {
        let app = Router::new()
            .route("/orders", get(orders))
            .route("/orders/active", get(|| async { Json(json!([{"id": "o1"}])) }))
            .route("/trades", get(trades));
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&base, dir.path());
        ctx.config.page_size = 2;
        let collector = OrderCollector::new(&ctx).unwrap();

        let summary = collector.run_comprehensive_collection(Some("m1"), true).await;
        assert_eq!(summary.orders_collected, 2);
        assert!(summary.orders_complete);
        assert_eq!(summary.active_orders, 1);
        assert_eq!(summary.trades_collected, 1);
        assert_eq!(summary.order_analysis_summary.unwrap().markets_involved, 1);

        let order_dir = dir.path().join("order");
        for file in [
            "orders_m1_all_final.json",
            "trades_m1_final.json",
            "active_orders_m1.json",
            "order_analysis_m1.json",
            "trade_analysis_m1.json",
            "collection_summary_m1.json",
        ] {
            assert!(order_dir.join(file).exists(), "{file} missing");
        }

        // checkpoints survive completion until reset
        assert!(collector.reset(Some("m1"), None));
        assert!(!order_dir.join("orders_m1_all_progress.json").exists());
        assert!(!order_dir.join("trades_m1_progress.json").exists());
    }

    #[tokio::test]
    async fn failed_order_listing_leaves_collection_incomplete() {
        let base = spawn_server(Router::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let collector = OrderCollector::new(&context(&base, dir.path())).unwrap();

        let out = collector.fetch_all_orders(None, Some(OrderStatus::Filled)).await;
        assert!(!out.is_complete());
        assert!(out.items.is_empty());
        assert!(!dir.path().join("order/orders_all_FILLED_final.json").exists());
    }
}
