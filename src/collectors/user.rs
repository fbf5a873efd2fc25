use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::collectors::stats::{self, AmountStats};
use crate::collectors::{page_params, seconds_between, CollectorContext};
use crate::db::UserActivitySource;
use crate::error::Result;
use crate::http::envelope::{page_outcome, EndpointFamily};
use crate::http::HttpFetcher;
use crate::paginator::{CollectionKey, PageOutcome, ResumablePaginator};
use crate::shutdown::SharedShutdown;
use crate::storage::BlobStore;
use crate::types::{self, Entity};

const ACTIVE_TRADER_MIN_TRADES: usize = 10;
const PREFERRED_MARKETS: usize = 3;

/// Positions, orders and trades of individual wallets.
pub struct UserCollector {
    clob: HttpFetcher,
    store: BlobStore,
    page_size: usize,
    shutdown: SharedShutdown,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingFrequency {
    High,
    Medium,
    Low,
}

impl TradingFrequency {
    /// From the combined number of orders and trades.
    pub fn from_activity(total: usize) -> Self {
        if total > 100 {
            TradingFrequency::High
        } else if total > 20 {
            TradingFrequency::Medium
        } else {
            TradingFrequency::Low
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
    pub average: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserOrderStats {
    pub total_orders: usize,
    pub status_distribution: BTreeMap<String, u64>,
    pub side_distribution: BTreeMap<String, u64>,
    pub market_distribution: BTreeMap<String, u64>,
    pub price_range: Option<ValueRange>,
    pub size_statistics: Option<AmountStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserTradeStats {
    pub total_trades: usize,
    pub role_distribution: BTreeMap<String, u64>,
    pub market_distribution: BTreeMap<String, u64>,
    pub volume_statistics: Option<AmountStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionStats {
    pub total_positions: usize,
    pub total_value: f64,
    pub market_exposure: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketActivityCount {
    pub market: String,
    pub activity_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityAnalysis {
    pub is_active_trader: bool,
    pub preferred_markets: Vec<MarketActivityCount>,
    pub trading_frequency: TradingFrequency,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStatistics {
    pub generation_timestamp: String,
    pub order_statistics: Option<UserOrderStats>,
    pub trade_statistics: Option<UserTradeStats>,
    pub position_statistics: Option<PositionStats>,
    pub activity_analysis: ActivityAnalysis,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserData {
    pub user_address: String,
    pub collection_timestamp: String,
    /// Raw `/positions` response, `null` when the request failed.
    pub positions: Value,
    pub orders: Vec<Entity>,
    pub trades: Vec<Entity>,
    pub orders_complete: bool,
    pub trades_complete: bool,
    pub statistics: UserStatistics,
    pub completion_timestamp: String,
    pub collection_duration_seconds: f64,
    /// Set when every request for this user failed.
    #[serde(skip)]
    pub failure: Option<String>,
    #[serde(skip)]
    pub data_file: String,
}

impl UserData {
    pub fn activity_source(&self) -> UserActivitySource<'_> {
        UserActivitySource {
            user_address: &self.user_address,
            orders: &self.orders,
            trades: &self.trades,
            positions: &self.positions,
        }
    }

    pub fn positions_count(&self) -> usize {
        position_list(&self.positions).len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserCounts {
    pub orders_count: usize,
    pub trades_count: usize,
    pub positions_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<UserCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivityDistribution {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total_orders: usize,
    pub total_trades: usize,
    pub total_positions: usize,
    pub active_users: usize,
    pub user_activity_distribution: ActivityDistribution,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchUserCollection {
    pub collection_timestamp: String,
    pub total_users: usize,
    pub successful_collections: usize,
    pub failed_collections: usize,
    pub users_data: BTreeMap<String, UserOutcome>,
    pub summary_statistics: BatchSummary,
    pub completion_timestamp: String,
    pub duration_seconds: f64,
    /// Full data of the successfully collected users.
    #[serde(skip)]
    pub collected: Vec<UserData>,
}

impl UserCollector {
    pub fn new(ctx: &CollectorContext) -> Result<Self> {
        Ok(Self {
            clob: ctx.clob()?,
            store: ctx.blob_store("user")?,
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

    pub async fn fetch_user_positions(&self, user_address: &str) -> Option<Value> {
        let positions = self
            .clob
            .get("/positions", &[("user", user_address.to_string())])
            .await;
        if positions.is_none() {
            warn!(user = user_address, "Failed to fetch positions");
        }
        positions
    }

    pub async fn fetch_user_orders(&self, user_address: &str, limit: usize, offset: usize) -> PageOutcome {
        let mut query = page_params(limit, offset);
        query.push(("maker", user_address.to_string()));
        page_outcome(self.clob.get("/orders", &query).await, EndpointFamily::Records)
    }

    /// Trades where the user was maker or taker, tagged with `user_role`.
    /// A trade seen on both sides is kept once, as maker. The page fails if
    /// either side fails, and counts as full if either side was full.
    pub async fn fetch_user_trades(&self, user_address: &str, limit: usize, offset: usize) -> PageOutcome {
        let mut sides = Vec::with_capacity(2);
        for role in ["maker", "taker"] {
            let mut query = page_params(limit, offset);
            query.push((role, user_address.to_string()));
            match page_outcome(self.clob.get("/trades", &query).await, EndpointFamily::Records) {
                PageOutcome::Failed(reason) => {
                    warn!(user = user_address, role, "Trade listing failed: {reason}");
                    return PageOutcome::Failed(format!("{role} trades for {user_address}: {reason}"));
                }
                PageOutcome::EndOfData => sides.push((role, Vec::new(), 0)),
                PageOutcome::Page { items, fetched } => sides.push((role, items, fetched)),
            }
        }

        let fetched = sides.iter().map(|(_, _, n)| *n).max().unwrap_or(0);
        if fetched == 0 {
            return PageOutcome::EndOfData;
        }

        let mut seen = HashSet::new();
        let mut trades = Vec::new();
        for (role, items, _) in sides {
            for mut trade in items {
                if let Some(id) = types::entity_id(&trade) {
                    if !seen.insert(id) {
                        continue;
                    }
                }
                trade.insert("user_role".into(), Value::String(role.to_string()));
                trades.push(trade);
            }
        }
        PageOutcome::Page { items: trades, fetched }
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    pub async fn collect_comprehensive_user_data(&self, user_address: &str) -> UserData {
        let start = Utc::now();
        info!(user = user_address, "Collecting user data");

        let positions = self.fetch_user_positions(user_address).await;
        let paginator = ResumablePaginator::new(&self.store, self.page_size, self.shutdown.clone());
        let orders = paginator
            .run(&CollectionKey::user_orders(user_address), |offset, limit| {
                self.fetch_user_orders(user_address, limit, offset)
            })
            .await;
        let trades = paginator
            .run(&CollectionKey::user_trades(user_address), |offset, limit| {
                self.fetch_user_trades(user_address, limit, offset)
            })
            .await;

        let failure = (positions.is_none()
            && orders.items.is_empty()
            && trades.items.is_empty()
            && !orders.is_complete()
            && !trades.is_complete())
        .then(|| "every request for this user failed".to_string());

        let positions = positions.unwrap_or(Value::Null);
        let statistics = generate_user_statistics(&orders.items, &trades.items, &positions);
        let end = Utc::now();
        let data_file = format!("user_data_{user_address}_{}.json", types::file_stamp(start));

        let data = UserData {
            user_address: user_address.to_string(),
            collection_timestamp: types::iso(start),
            positions,
            orders_complete: orders.is_complete(),
            trades_complete: trades.is_complete(),
            orders: orders.items,
            trades: trades.items,
            statistics,
            completion_timestamp: types::iso(end),
            collection_duration_seconds: seconds_between(start, end),
            failure,
            data_file,
        };
        if data.failure.is_none() {
            if let Err(e) = self.store.save_json(&data.data_file, &data) {
                warn!(file = %data.data_file, "Failed to save user data: {e}");
            }
        }
        info!(
            user = user_address,
            orders = data.orders.len(),
            trades = data.trades.len(),
            "User data collected"
        );
        data
    }

    pub async fn batch_collect_users(&self, user_addresses: &[String]) -> BatchUserCollection {
        let start = Utc::now();
        info!(users = user_addresses.len(), "Starting batch user collection");

        let mut users_data = BTreeMap::new();
        let mut collected = Vec::new();
        let mut successful = 0usize;
        let mut failed = 0usize;

        for (i, address) in user_addresses.iter().enumerate() {
            if self.shutdown.is_shutdown_requested() {
                warn!(completed = i, "Batch user collection interrupted");
                break;
            }
            info!("Processing user {}/{}: {address}", i + 1, user_addresses.len());
            let data = self.collect_comprehensive_user_data(address).await;
            let outcome = match &data.failure {
                Some(reason) => {
                    error!(user = %address, "User collection failed: {reason}");
                    failed += 1;
                    UserOutcome {
                        success: false,
                        data_file: None,
                        summary: None,
                        error: Some(reason.clone()),
                    }
                }
                None => {
                    successful += 1;
                    UserOutcome {
                        success: true,
                        data_file: Some(data.data_file.clone()),
                        summary: Some(UserCounts {
                            orders_count: data.orders.len(),
                            trades_count: data.trades.len(),
                            positions_count: data.positions_count(),
                        }),
                        error: None,
                    }
                }
            };
            users_data.insert(address.clone(), outcome);
            if data.failure.is_none() {
                collected.push(data);
            }
        }

        let end = Utc::now();
        let batch = BatchUserCollection {
            collection_timestamp: types::iso(start),
            total_users: user_addresses.len(),
            successful_collections: successful,
            failed_collections: failed,
            summary_statistics: batch_summary(&users_data),
            users_data,
            completion_timestamp: types::iso(end),
            duration_seconds: seconds_between(start, end),
            collected,
        };
        let file = format!("batch_user_collection_{}.json", types::file_stamp(start));
        if let Err(e) = self.store.save_json(&file, &batch) {
            warn!(file = %file, "Failed to save batch summary: {e}");
        }
        info!(successful, failed, "Batch user collection finished");
        batch
    }
}

pub fn generate_user_statistics(orders: &[Entity], trades: &[Entity], positions: &Value) -> UserStatistics {
    let order_statistics = (!orders.is_empty()).then(|| {
        let prices = stats::numeric_field(orders, "price");
        UserOrderStats {
            total_orders: orders.len(),
            status_distribution: stats::distribution(orders, "status"),
            side_distribution: stats::distribution(orders, "side"),
            market_distribution: stats::distribution(orders, "market"),
            price_range: stats::amount_stats(&prices).map(|s| ValueRange {
                min: s.min,
                max: s.max,
                average: s.average,
            }),
            size_statistics: stats::amount_stats(&stats::numeric_field(orders, "size")),
        }
    });

    let trade_statistics = (!trades.is_empty()).then(|| UserTradeStats {
        total_trades: trades.len(),
        role_distribution: stats::distribution(trades, "user_role"),
        market_distribution: stats::distribution(trades, "market"),
        volume_statistics: stats::amount_stats(&stats::numeric_field(trades, "volume")),
    });

    let position_statistics = (!positions.is_null()).then(|| {
        let list = position_list(positions);
        let mut market_exposure = BTreeMap::new();
        let mut total_value = 0.0;
        for p in &list {
            if let Some(v) = types::field_f64(p, "value") {
                total_value += v;
                *market_exposure.entry(types::field_label(p, "market")).or_insert(0.0) += v;
            }
        }
        PositionStats {
            total_positions: list.len(),
            total_value,
            market_exposure,
        }
    });

    let mut activity = stats::distribution(orders, "market");
    for (market, n) in stats::distribution(trades, "market") {
        *activity.entry(market).or_insert(0) += n;
    }
    let mut ranked: Vec<(String, u64)> = activity.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    UserStatistics {
        generation_timestamp: types::now_iso(),
        order_statistics,
        trade_statistics,
        position_statistics,
        activity_analysis: ActivityAnalysis {
            is_active_trader: trades.len() > ACTIVE_TRADER_MIN_TRADES,
            preferred_markets: ranked
                .into_iter()
                .take(PREFERRED_MARKETS)
                .map(|(market, activity_count)| MarketActivityCount {
                    market,
                    activity_count,
                })
                .collect(),
            trading_frequency: TradingFrequency::from_activity(orders.len() + trades.len()),
        },
    }
}

/// Position objects from `{"positions": [...]}` or a bare array.
fn position_list(positions: &Value) -> Vec<&Entity> {
    let list = match positions {
        Value::Object(o) => o.get("positions").and_then(Value::as_array),
        Value::Array(a) => Some(a),
        _ => None,
    };
    list.into_iter().flatten().filter_map(Value::as_object).collect()
}

fn batch_summary(users: &BTreeMap<String, UserOutcome>) -> BatchSummary {
    let mut summary = BatchSummary::default();
    for counts in users.values().filter_map(|u| u.summary.as_ref()) {
        summary.total_orders += counts.orders_count;
        summary.total_trades += counts.trades_count;
        summary.total_positions += counts.positions_count;
        let activity = counts.orders_count + counts.trades_count;
        if activity > 0 {
            summary.active_users += 1;
        }
        match TradingFrequency::from_activity(activity) {
            TradingFrequency::High => summary.user_activity_distribution.high += 1,
            TradingFrequency::Medium => summary.user_activity_distribution.medium += 1,
            TradingFrequency::Low => summary.user_activity_distribution.low += 1,
        }
    }
    summary
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

    async fn trades(Query(q): Params) -> Json<Value> {
        if q.get("offset").map(String::as_str) != Some("0") {
            return Json(json!([]));
        }
        if q.contains_key("maker") {
            Json(json!({"data": [{"id": "t1", "market": "m1", "volume": "4"}, {"id": "t2", "market": "m2"}]}))
        } else {
            Json(json!([{"id": "t2", "market": "m2"}, {"id": "t3", "market": "m1", "volume": 6}]))
        }
    }

    async fn orders(Query(q): Params) -> Json<Value> {
        assert_eq!(q.get("maker").map(String::as_str), Some("0xA"));
        Json(json!([{"id": "o1", "market": "m1", "side": "BUY", "price": "0.4", "size": "10"}]))
    }

    fn app() -> Router {
        Router::new()
            .route("/trades", get(trades))
            .route("/orders", get(orders))
            .route(
                "/positions",
                get(|| async { Json(json!({"positions": [{"market": "m1", "value": "12.5"}]})) }),
            )
    }

    #[tokio::test]
    async fn user_trades_are_tagged_and_deduplicated() {
        let base = spawn_server(app()).await;
        let dir = tempfile::tempdir().unwrap();
        let collector = UserCollector::new(&context(&base, dir.path())).unwrap();

        let PageOutcome::Page { items: trades, fetched } = collector.fetch_user_trades("0xA", 100, 0).await else {
            panic!("expected a page");
        };
        let tagged: Vec<(String, String)> = trades
            .iter()
            .map(|t| (types::field_label(t, "id"), types::field_label(t, "user_role")))
            .collect();
        assert_eq!(
            tagged,
            [
                ("t1".to_string(), "maker".to_string()),
                ("t2".to_string(), "maker".to_string()),
                ("t3".to_string(), "taker".to_string())
            ]
        );
        assert_eq!(fetched, 2);
    }

    #[tokio::test]
    async fn one_failing_trade_side_fails_the_page() {
        let app = Router::new()
            .route(
                "/trades",
                get(|Query(q): Params| async move {
                    if q.contains_key("taker") {
                        Err(axum::http::StatusCode::SERVICE_UNAVAILABLE)
                    } else {
                        Ok(Json(json!([{"id": "t1", "market": "m1"}])))
                    }
                }),
            )
            .route("/orders", get(|| async { Json(json!([])) }))
            .route("/positions", get(|| async { Json(json!([])) }));
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let collector = UserCollector::new(&context(&base, dir.path())).unwrap();

        let outcome = collector.fetch_user_trades("0xA", 100, 0).await;
        assert!(matches!(outcome, PageOutcome::Failed(_)));

        let data = collector.collect_comprehensive_user_data("0xA").await;
        assert!(!data.trades_complete);
        assert!(data.orders_complete);
        let key = CollectionKey::user_trades("0xA");
        assert!(!dir.path().join("user").join(key.final_file()).exists());
    }

    #[tokio::test]
    async fn comprehensive_user_data_and_batch_summary() {
        let base = spawn_server(app()).await;
        let dir = tempfile::tempdir().unwrap();
        let collector = UserCollector::new(&context(&base, dir.path())).unwrap();

        let batch = collector.batch_collect_users(&["0xA".to_string()]).await;
        assert_eq!(batch.successful_collections, 1);
        assert_eq!(batch.failed_collections, 0);

        let data = &batch.collected[0];
        assert_eq!(data.orders.len(), 1);
        assert_eq!(data.trades.len(), 3);
        assert!(data.orders_complete && data.trades_complete);
        assert_eq!(data.positions_count(), 1);
        assert!(dir.path().join("user").join(&data.data_file).exists());

        let stats = &data.statistics;
        assert_eq!(stats.position_statistics.as_ref().unwrap().total_value, 12.5);
        assert_eq!(stats.trade_statistics.as_ref().unwrap().role_distribution["maker"], 2);
        assert_eq!(stats.activity_analysis.preferred_markets[0].market, "m1");
        assert_eq!(stats.activity_analysis.preferred_markets[0].activity_count, 3);

        let summary = &batch.summary_statistics;
        assert_eq!(summary.total_trades, 3);
        assert_eq!(summary.active_users, 1);
        assert_eq!(summary.user_activity_distribution.low, 1);

        let source = data.activity_source();
        assert_eq!(source.user_address, "0xA");
        assert_eq!(source.trades.len(), 3);
    }

    #[tokio::test]
    async fn unreachable_user_counts_as_failure() {
        let base = spawn_server(Router::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let collector = UserCollector::new(&context(&base, dir.path())).unwrap();

        let batch = collector.batch_collect_users(&["0xB".to_string()]).await;
        assert_eq!(batch.failed_collections, 1);
        assert!(batch.collected.is_empty());
        assert!(!batch.users_data["0xB"].success);
        assert!(batch.users_data["0xB"].error.is_some());
    }

    #[test]
    fn activity_thresholds() {
        assert_eq!(TradingFrequency::from_activity(101), TradingFrequency::High);
        assert_eq!(TradingFrequency::from_activity(100), TradingFrequency::Medium);
        assert_eq!(TradingFrequency::from_activity(21), TradingFrequency::Medium);
        assert_eq!(TradingFrequency::from_activity(20), TradingFrequency::Low);

        let trades: Vec<Entity> = (0..11)
            .map(|i| json!({"id": i, "market": if i < 6 { "a" } else { "b" }}).as_object().cloned().unwrap())
            .collect();
        let orders = ents(json!([{"market": "c"}, {"market": "d"}, {"market": "d"}]));
        let s = generate_user_statistics(&orders, &trades, &Value::Null);
        assert!(s.activity_analysis.is_active_trader);
        assert!(s.position_statistics.is_none());
        let preferred: Vec<&str> = s
            .activity_analysis
            .preferred_markets
            .iter()
            .map(|m| m.market.as_str())
            .collect();
        assert_eq!(preferred, ["a", "b", "d"]);
    }
}
