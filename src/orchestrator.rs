//! Multi-phase collection runs that feed every collector's output into the
//! relationship store, plus the cross-cutting views built on top of it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::collectors::fluctuation::MonitoringReport;
use crate::collectors::history::MonitorHandle;
use crate::collectors::order::RecordFilter;
use crate::collectors::user::BatchUserCollection;
use crate::collectors::{
    seconds_between, CollectorContext, FluctuationMonitor, MarketInfoCollector, OrderCollector,
    PriceCollector, UserCollector,
};
use crate::config;
use crate::db::models::{ComprehensiveReport, MarketCorrelation, MarketView, StoreTotals, UserView};
use crate::db::RelationshipStore;
use crate::error::Result;
use crate::paginator::PageOutcome;
use crate::shutdown::SharedShutdown;
use crate::storage::BlobStore;
use crate::types::{self, Entity, Fidelity, MarketType};

const STRONG_CORRELATION_USERS: i64 = 10;
const CORRELATION_ANALYSIS_LIMIT: i64 = 50;
const VIEW_ORDERS_LIMIT: usize = 10;
const TEST_RECORDS_PER_MARKET: usize = 20;
const STATUS_MARKET_IDS: i64 = 20;
const STATUS_USER_ADDRESSES: i64 = 10;

pub struct ComprehensiveOrchestrator {
    market_info: MarketInfoCollector,
    prices: PriceCollector,
    orders: OrderCollector,
    users: UserCollector,
    fluctuation: Arc<FluctuationMonitor>,
    store: RelationshipStore,
    blob: BlobStore,
    page_size: usize,
    shutdown: SharedShutdown,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EcosystemOptions {
    /// Restricts the run to these markets. Empty means every active market.
    pub market_ids: Vec<String>,
    pub include_users: bool,
    /// Runs fluctuation monitoring alongside the rest of the run for this long.
    pub monitoring: Option<Duration>,
}

impl Default for EcosystemOptions {
    fn default() -> Self {
        Self {
            market_ids: Vec::new(),
            include_users: true,
            monitoring: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestOptions {
    pub max_markets: usize,
    pub max_users: usize,
    pub monitoring: Option<Duration>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            max_markets: 3,
            max_users: 10,
            monitoring: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RecordScope {
    All,
    FirstPage(usize),
}

// ---------------------------------------------------------------------------
// Phase results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MarketInfoPhase {
    pub success: bool,
    pub events_count: usize,
    pub markets_count: usize,
    pub events_complete: bool,
    pub relationships_written: usize,
    #[serde(skip)]
    pub events: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PricePhase {
    pub success: bool,
    pub markets_count: usize,
    pub successful_count: usize,
    pub failed_count: usize,
    pub success_rate: f64,
    pub snapshots_appended: usize,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderPhase {
    pub success: bool,
    pub orders_count: usize,
    pub trades_count: usize,
    /// Markets whose order or trade listing stopped before the end.
    pub incomplete_markets: Vec<String>,
    #[serde(skip)]
    pub orders: Vec<Entity>,
    #[serde(skip)]
    pub trades: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPhase {
    pub success: bool,
    pub users_count: usize,
    pub activities_written: usize,
    pub batch_result: BatchUserCollection,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringPhase {
    pub success: bool,
    pub markets_count: usize,
    pub duration_seconds: f64,
    pub report: Option<MonitoringReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Phases {
    pub market_info: Option<MarketInfoPhase>,
    pub price_data: Option<PricePhase>,
    pub order_data: Option<OrderPhase>,
    pub user_data: Option<UserPhase>,
    pub price_monitoring: Option<MonitoringPhase>,
}

impl Phases {
    fn outcomes(&self) -> Vec<bool> {
        [
            self.market_info.as_ref().map(|p| p.success),
            self.price_data.as_ref().map(|p| p.success),
            self.order_data.as_ref().map(|p| p.success),
            self.user_data.as_ref().map(|p| p.success),
            self.price_monitoring.as_ref().map(|p| p.success),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn completed(&self) -> usize {
        self.outcomes().into_iter().filter(|ok| *ok).count()
    }

    pub fn total(&self) -> usize {
        self.outcomes().len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationshipStatistics {
    pub markets_processed: usize,
    pub users_processed: usize,
    pub price_snapshots: usize,
    pub store_totals: Option<StoreTotals>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EcosystemSummary {
    pub start_time: String,
    pub market_ids: Vec<String>,
    pub include_users: bool,
    pub include_price_monitoring: bool,
    pub phases: Phases,
    pub data_relationships: RelationshipStatistics,
    pub comprehensive_report: Option<ComprehensiveReport>,
    pub errors: Vec<String>,
    pub end_time: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthGrade {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl HealthGrade {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            HealthGrade::Excellent
        } else if score >= 0.6 {
            HealthGrade::Good
        } else if score >= 0.4 {
            HealthGrade::Fair
        } else {
            HealthGrade::Poor
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestCounts {
    pub total_duration: f64,
    pub markets_processed: usize,
    pub phases_completed: usize,
    pub total_phases: usize,
    pub errors_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DataCollected {
    pub markets: usize,
    pub events: usize,
    pub price_markets: usize,
    pub orders: usize,
    pub trades: usize,
    pub users: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub test_summary: TestCounts,
    pub data_collected: DataCollected,
    pub system_status: HealthGrade,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestSummary {
    pub test_mode: bool,
    pub start_time: String,
    pub max_markets: usize,
    pub max_users: usize,
    pub include_monitoring: bool,
    pub test_market_ids: Vec<String>,
    pub phases: Phases,
    pub data_relationships: RelationshipStatistics,
    pub test_report: TestReport,
    pub errors: Vec<String>,
    pub end_time: String,
    pub duration_seconds: f64,
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MarketOverview {
    #[serde(flatten)]
    pub view: MarketView,
    pub current_price: Option<Value>,
    pub active_orders_count: usize,
    pub active_orders: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserOverview {
    #[serde(flatten)]
    pub view: UserView,
    pub current_positions: Option<Value>,
    pub recent_orders: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationAnalysis {
    pub correlations: Vec<MarketCorrelation>,
    pub total_correlations: usize,
    pub strong_correlations: Vec<MarketCorrelation>,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub collected_markets: i64,
    pub collected_users: i64,
    pub market_ids: Vec<String>,
    pub user_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EcosystemHealth {
    pub market_activity_score: f64,
    pub user_engagement_score: f64,
    pub liquidity_score: f64,
    pub overall_health: HealthGrade,
}

#[derive(Debug, Clone, Serialize)]
pub struct EcosystemAnalysis {
    pub data_collection_status: CollectionStatus,
    pub market_correlations: CorrelationAnalysis,
    pub ecosystem_health: EcosystemHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct EcosystemReport {
    #[serde(flatten)]
    pub report: ComprehensiveReport,
    pub ecosystem_analysis: EcosystemAnalysis,
}

impl ComprehensiveOrchestrator {
    pub fn new(ctx: &CollectorContext, store: RelationshipStore) -> Result<Self> {
        Ok(Self {
            market_info: MarketInfoCollector::new(ctx)?,
            prices: PriceCollector::new(ctx)?.with_store(store.clone()),
            orders: OrderCollector::new(ctx)?,
            users: UserCollector::new(ctx)?,
            fluctuation: Arc::new(FluctuationMonitor::new(ctx)?),
            store,
            blob: ctx.blob_store("relationships")?,
            page_size: ctx.config.page_size,
            shutdown: ctx.shutdown.clone(),
        })
    }

    pub fn store(&self) -> &RelationshipStore {
        &self.store
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blob
    }

    // -----------------------------------------------------------------------
    // Collection runs
    // -----------------------------------------------------------------------

    pub async fn collect_market_ecosystem(&self, options: &EcosystemOptions) -> EcosystemSummary {
        let start = Utc::now();
        info!(
            markets = options.market_ids.len(),
            include_users = options.include_users,
            "Starting market ecosystem collection"
        );
        let mut errors = Vec::new();
        let mut phases = Phases::default();

        info!("Phase 1: market info");
        let events = self.market_info.fetch_all_events(MarketType::Active).await;
        let events_complete = events.is_complete();
        let mut events = events.items;
        let mut markets = self
            .market_info
            .fetch_markets(self.page_size, 0, Some(true), None)
            .await;
        if !options.market_ids.is_empty() {
            let wanted = &options.market_ids;
            events.retain(|e| event_market_ids(e).iter().any(|id| wanted.contains(id)));
            markets.retain(|m| types::entity_id(m).is_some_and(|id| wanted.contains(&id)));
        }
        let market_info = self
            .record_market_info(events, markets, events_complete, &mut errors)
            .await;

        info!("Phase 2: market ids");
        let market_ids = if options.market_ids.is_empty() {
            let ids: BTreeSet<String> = market_info.events.iter().flat_map(event_market_ids).collect();
            ids.into_iter().collect()
        } else {
            options.market_ids.clone()
        };
        phases.market_info = Some(market_info);

        if !market_ids.is_empty() {
            info!(markets = market_ids.len(), "Phase 3: prices");
            phases.price_data = Some(self.collect_prices(&market_ids, &mut errors).await);

            info!("Phase 4: orders and trades");
            phases.order_data = Some(self.collect_records(&market_ids, RecordScope::All).await);
        } else {
            warn!("No market ids to collect prices and orders for");
        }

        if options.include_users {
            if let Some(orders) = &phases.order_data {
                info!("Phase 5: users");
                phases.user_data = Some(
                    self.collect_users(orders, config::MAX_ECOSYSTEM_USERS, &mut errors)
                        .await,
                );
            }
        }

        info!("Phase 6: relationship statistics");
        let data_relationships = self.relationship_statistics(&phases, &mut errors).await;

        let monitor = options
            .monitoring
            .filter(|_| !market_ids.is_empty())
            .map(|d| {
                info!("Phase 7: fluctuation monitoring");
                self.fluctuation
                    .start_background_monitoring(market_ids.clone(), Some(d))
            });

        info!("Phase 8: comprehensive report");
        let comprehensive_report = self.save_comprehensive_report(&mut errors).await;

        if let Some(handle) = monitor {
            phases.price_monitoring = Some(self.finish_monitoring(handle, market_ids.len()).await);
        }

        let end = Utc::now();
        let summary = EcosystemSummary {
            start_time: types::iso(start),
            market_ids,
            include_users: options.include_users,
            include_price_monitoring: options.monitoring.is_some(),
            phases,
            data_relationships,
            comprehensive_report,
            errors,
            end_time: types::iso(end),
            duration_seconds: seconds_between(start, end),
        };
        self.save(
            &format!("ecosystem_collection_summary_{}.json", types::file_stamp(start)),
            &summary,
        );
        info!(duration_s = summary.duration_seconds, "Market ecosystem collection finished");
        summary
    }

    /// A small end-to-end run: the first market of each of the first events,
    /// one page of orders and trades per market, and a capped set of users.
    pub async fn collect_test_data(&self, options: &TestOptions) -> TestSummary {
        let start = Utc::now();
        info!(
            max_markets = options.max_markets,
            max_users = options.max_users,
            "Starting test data collection"
        );
        let mut errors = Vec::new();
        let mut phases = Phases::default();

        let events = self.market_info.fetch_all_events(MarketType::Active).await;
        let events_complete = events.is_complete();
        let mut events = events.items;
        events.truncate(options.max_markets);
        let mut markets = self
            .market_info
            .fetch_markets(self.page_size, 0, Some(true), None)
            .await;
        markets.truncate(options.max_markets * 2);
        let market_info = self
            .record_market_info(events, markets, events_complete, &mut errors)
            .await;

        let mut test_market_ids: Vec<String> = Vec::new();
        for event in &market_info.events {
            if test_market_ids.len() >= options.max_markets {
                break;
            }
            if let Some(id) = event_market_ids(event).into_iter().next() {
                if !test_market_ids.contains(&id) {
                    test_market_ids.push(id);
                }
            }
        }
        phases.market_info = Some(market_info);

        let mut monitor = None;
        if !test_market_ids.is_empty() {
            phases.price_data = Some(self.collect_prices(&test_market_ids, &mut errors).await);
            let records = self
                .collect_records(&test_market_ids, RecordScope::FirstPage(TEST_RECORDS_PER_MARKET))
                .await;
            phases.user_data = Some(self.collect_users(&records, options.max_users, &mut errors).await);
            phases.order_data = Some(records);
            monitor = options.monitoring.map(|d| {
                self.fluctuation
                    .start_background_monitoring(test_market_ids.clone(), Some(d))
            });
        }

        let data_relationships = self.relationship_statistics(&phases, &mut errors).await;
        if let Some(handle) = monitor {
            phases.price_monitoring = Some(self.finish_monitoring(handle, test_market_ids.len()).await);
        }

        let end = Utc::now();
        let duration_seconds = seconds_between(start, end);
        let test_report = test_report(&phases, test_market_ids.len(), errors.len(), duration_seconds);
        let summary = TestSummary {
            test_mode: true,
            start_time: types::iso(start),
            max_markets: options.max_markets,
            max_users: options.max_users,
            include_monitoring: options.monitoring.is_some(),
            test_market_ids,
            phases,
            data_relationships,
            test_report,
            errors,
            end_time: types::iso(end),
            duration_seconds,
        };
        self.save(
            &format!("test_collection_summary_{}.json", types::file_stamp(start)),
            &summary,
        );
        info!(
            duration_s = duration_seconds,
            status = ?summary.test_report.system_status,
            "Test data collection finished"
        );
        summary
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn record_market_info(
        &self,
        events: Vec<Entity>,
        markets: Vec<Entity>,
        events_complete: bool,
        errors: &mut Vec<String>,
    ) -> MarketInfoPhase {
        let relationships_written = match self.store.upsert_market_relationships(&events, &markets).await {
            Ok(n) => n,
            Err(e) => {
                error!("Failed to update market relationships: {e}");
                errors.push(format!("market relationships: {e}"));
                0
            }
        };
        MarketInfoPhase {
            success: events_complete,
            events_count: events.len(),
            markets_count: markets.len(),
            events_complete,
            relationships_written,
            events,
        }
    }

    async fn collect_prices(&self, market_ids: &[String], errors: &mut Vec<String>) -> PricePhase {
        let history = self
            .prices
            .collect_batch_price_history(market_ids, Fidelity::Hour)
            .await;
        let current = self.prices.collect_batch_prices(market_ids, false).await;

        let snapshots_appended = match &current.bulk_prices {
            Some(prices) => match self.store.append_price_snapshot(prices, None).await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to append price snapshots: {e}");
                    errors.push(format!("price snapshots: {e}"));
                    0
                }
            },
            None => {
                warn!("No current prices, skipping snapshots");
                0
            }
        };

        PricePhase {
            success: !history.successful_markets.is_empty() || current.bulk_prices.is_some(),
            markets_count: market_ids.len(),
            successful_count: history.successful_markets.len(),
            failed_count: history.failed_markets.len(),
            success_rate: history.success_rate,
            snapshots_appended,
            duration_seconds: history.duration_seconds + current.duration_seconds,
        }
    }

    async fn collect_records(&self, market_ids: &[String], scope: RecordScope) -> OrderPhase {
        let mut orders = Vec::new();
        let mut trades = Vec::new();
        let mut incomplete_markets = Vec::new();

        for market_id in market_ids {
            if self.shutdown.is_shutdown_requested() {
                warn!("Shutdown requested, skipping remaining markets");
                incomplete_markets.push(market_id.clone());
                continue;
            }
            let complete = match scope {
                RecordScope::All => {
                    let o = self.orders.fetch_all_orders(Some(market_id.as_str()), None).await;
                    let t = self.orders.fetch_all_trades(Some(market_id.as_str())).await;
                    let complete = o.is_complete() && t.is_complete();
                    orders.extend(o.items);
                    trades.extend(t.items);
                    complete
                }
                RecordScope::FirstPage(limit) => {
                    let filter = RecordFilter::market(Some(market_id.as_str()));
                    let o = self.orders.fetch_orders(&filter, limit, 0).await;
                    let t = self.orders.fetch_trades(&filter, limit, 0).await;
                    let complete = !matches!(o, PageOutcome::Failed(_)) && !matches!(t, PageOutcome::Failed(_));
                    orders.extend(o.items().into_iter().take(limit));
                    trades.extend(t.items().into_iter().take(limit));
                    complete
                }
            };
            if !complete {
                incomplete_markets.push(market_id.clone());
            }
        }

        info!(
            orders = orders.len(),
            trades = trades.len(),
            incomplete = incomplete_markets.len(),
            "Orders and trades collected"
        );
        OrderPhase {
            success: incomplete_markets.is_empty(),
            orders_count: orders.len(),
            trades_count: trades.len(),
            incomplete_markets,
            orders,
            trades,
        }
    }

    async fn collect_users(&self, records: &OrderPhase, cap: usize, errors: &mut Vec<String>) -> UserPhase {
        let addresses = participant_addresses(&records.orders, &records.trades, cap);
        info!(users = addresses.len(), "Collecting participants");
        let batch = self.users.batch_collect_users(&addresses).await;

        let mut activities_written = 0;
        for data in &batch.collected {
            match self
                .store
                .upsert_user_market_activity(data.activity_source(), Some(&records.orders), Some(&records.trades))
                .await
            {
                Ok(n) => activities_written += n,
                Err(e) => {
                    error!(user = %data.user_address, "Failed to update user activity: {e}");
                    errors.push(format!("user activity {}: {e}", data.user_address));
                }
            }
        }

        UserPhase {
            success: batch.failed_collections == 0,
            users_count: addresses.len(),
            activities_written,
            batch_result: batch,
        }
    }

    async fn relationship_statistics(&self, phases: &Phases, errors: &mut Vec<String>) -> RelationshipStatistics {
        let store_totals = match self.store.totals().await {
            Ok(t) => Some(t),
            Err(e) => {
                error!("Failed to read store totals: {e}");
                errors.push(format!("store totals: {e}"));
                None
            }
        };
        RelationshipStatistics {
            markets_processed: phases.market_info.as_ref().map_or(0, |p| p.markets_count),
            users_processed: phases.user_data.as_ref().map_or(0, |p| p.users_count),
            price_snapshots: phases.price_data.as_ref().map_or(0, |p| p.snapshots_appended),
            store_totals,
        }
    }

    async fn finish_monitoring(
        &self,
        handle: MonitorHandle<MonitoringReport>,
        markets_count: usize,
    ) -> MonitoringPhase {
        let report = handle.join().await;
        MonitoringPhase {
            success: report.is_some(),
            markets_count,
            duration_seconds: report
                .as_ref()
                .map_or(0.0, |r| r.monitoring_period.duration_seconds),
            report,
        }
    }

    async fn save_comprehensive_report(&self, errors: &mut Vec<String>) -> Option<ComprehensiveReport> {
        match self.store.comprehensive_report().await {
            Ok(report) => {
                self.save(
                    &format!("comprehensive_report_{}.json", types::file_stamp(Utc::now())),
                    &report,
                );
                Some(report)
            }
            Err(e) => {
                error!("Failed to build comprehensive report: {e}");
                errors.push(format!("comprehensive report: {e}"));
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    pub async fn market_view(&self, market_id: &str) -> Result<MarketOverview> {
        info!(market_id, "Building market view");
        let view = self.store.market_view(market_id).await?;
        let current_price = self
            .prices
            .fetch_market_prices(&[market_id.to_string()])
            .await
            .and_then(|mut prices| prices.remove(market_id));
        let active = self.orders.fetch_active_orders(Some(market_id), None).await;
        Ok(MarketOverview {
            view,
            current_price,
            active_orders_count: active.len(),
            active_orders: active.into_iter().take(VIEW_ORDERS_LIMIT).collect(),
        })
    }

    pub async fn user_view(&self, user_address: &str) -> Result<UserOverview> {
        info!(user = user_address, "Building user view");
        let view = self.store.user_view(user_address).await?;
        let current_positions = self.users.fetch_user_positions(user_address).await;
        let recent_orders = self
            .users
            .fetch_user_orders(user_address, VIEW_ORDERS_LIMIT, 0)
            .await
            .items();
        Ok(UserOverview {
            view,
            current_positions,
            recent_orders,
        })
    }

    pub async fn correlations_analysis(&self) -> Result<CorrelationAnalysis> {
        let correlations = self.store.market_correlations(CORRELATION_ANALYSIS_LIMIT).await?;
        let strong_correlations = correlations
            .iter()
            .filter(|c| c.common_users >= STRONG_CORRELATION_USERS)
            .cloned()
            .collect();
        Ok(CorrelationAnalysis {
            total_correlations: correlations.len(),
            correlations,
            strong_correlations,
            generated_at: types::now_iso(),
        })
    }

    pub async fn ecosystem_report(&self) -> Result<EcosystemReport> {
        info!("Building ecosystem report");
        let report = self.store.comprehensive_report().await?;
        let totals = self.store.totals().await?;
        let data_collection_status = CollectionStatus {
            collected_markets: totals.markets,
            collected_users: totals.users,
            market_ids: self.store.list_market_ids(STATUS_MARKET_IDS).await?,
            user_addresses: self.store.list_user_addresses(STATUS_USER_ADDRESSES).await?,
        };
        let ecosystem = EcosystemReport {
            report,
            ecosystem_analysis: EcosystemAnalysis {
                data_collection_status,
                market_correlations: self.correlations_analysis().await?,
                ecosystem_health: ecosystem_health(&totals),
            },
        };
        self.save(
            &format!("ecosystem_report_{}.json", types::file_stamp(Utc::now())),
            &ecosystem,
        );
        Ok(ecosystem)
    }

    /// Deletes price snapshots older than `days`.
    pub async fn cleanup(&self, days: i64) -> Result<u64> {
        self.store.purge_snapshots_older_than(days).await
    }

    fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) {
        if let Err(e) = self.blob.save_json(name, value) {
            warn!(file = name, "Failed to save: {e}");
        }
    }
}

/// Ids of the markets nested in an event.
fn event_market_ids(event: &Entity) -> Vec<String> {
    event
        .get("markets")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter_map(types::entity_id)
        .collect()
}

/// Makers and takers of the given orders and trades, sorted, at most `cap`.
pub fn participant_addresses(orders: &[Entity], trades: &[Entity], cap: usize) -> Vec<String> {
    let addresses: BTreeSet<String> = orders
        .iter()
        .chain(trades)
        .flat_map(|e| [types::field_string(e, "maker"), types::field_string(e, "taker")])
        .flatten()
        .collect();
    addresses.into_iter().take(cap).collect()
}

/// Market and user scores saturate at 100 markets and 1000 users.
/// Liquidity is not measured and always scores 0.
pub fn ecosystem_health(totals: &StoreTotals) -> EcosystemHealth {
    let market_activity_score = (totals.markets as f64 / 100.0).min(1.0);
    let user_engagement_score = (totals.users as f64 / 1000.0).min(1.0);
    let liquidity_score = 0.0;
    let average = (market_activity_score + user_engagement_score + liquidity_score) / 3.0;
    EcosystemHealth {
        market_activity_score,
        user_engagement_score,
        liquidity_score,
        overall_health: HealthGrade::from_score(average),
    }
}

fn test_report(phases: &Phases, markets_processed: usize, errors_count: usize, total_duration: f64) -> TestReport {
    let counts = TestCounts {
        total_duration,
        markets_processed,
        phases_completed: phases.completed(),
        total_phases: phases.total(),
        errors_count,
    };

    let mut data_collected = DataCollected::default();
    if let Some(p) = phases.market_info.as_ref().filter(|p| p.success) {
        data_collected.markets = p.markets_count;
        data_collected.events = p.events_count;
    }
    if let Some(p) = phases.price_data.as_ref().filter(|p| p.success) {
        data_collected.price_markets = p.markets_count;
    }
    if let Some(p) = phases.order_data.as_ref().filter(|p| p.success) {
        data_collected.orders = p.orders_count;
        data_collected.trades = p.trades_count;
    }
    if let Some(p) = phases.user_data.as_ref().filter(|p| p.success) {
        data_collected.users = p.users_count;
    }

    let success_rate = counts.phases_completed as f64 / counts.total_phases.max(1) as f64;
    let (system_status, first) = if success_rate >= 0.8 && errors_count == 0 {
        (HealthGrade::Excellent, "System is healthy, a full collection can be run")
    } else if success_rate >= 0.6 {
        (HealthGrade::Good, "System mostly works, check the failed phases")
    } else if success_rate >= 0.4 {
        (HealthGrade::Fair, "Several phases failed, fix the errors before a large collection")
    } else {
        (HealthGrade::Poor, "Most phases failed, check configuration and connectivity")
    };
    let mut recommendations = vec![first.to_string()];
    if errors_count > 0 {
        recommendations.push("Check the error log for details".to_string());
    }
    if data_collected.users == 0 {
        recommendations.push("No users were collected, check order data and the user endpoints".to_string());
    }
    if total_duration > 300.0 {
        recommendations.push("The test run was slow, a full collection will take considerably longer".to_string());
    }

    TestReport {
        test_summary: counts,
        data_collected,
        system_status,
        recommendations,
    }
}
