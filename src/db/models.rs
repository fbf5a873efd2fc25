//! Row and view types of the relationship store. Rows derive `FromRow` for
//! `sqlx::query_as`; views are what the store hands to callers and the API.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct MarketRelationshipRow {
    pub market_id: String,
    pub event_id: Option<String>,
    pub market_name: Option<String>,
    pub market_status: Option<String>,
    pub created_at: Option<String>,
    pub last_updated: Option<String>,
}

/// Aggregated activity of one user in one market, before it is written.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketActivity {
    pub total_orders: i64,
    pub total_trades: i64,
    pub total_volume: f64,
    pub first_activity: Option<String>,
    pub last_activity: Option<String>,
    pub position_value: f64,
}

impl MarketActivity {
    /// Widens the first/last window with `ts` (string order).
    pub fn touch(&mut self, ts: &str) {
        if self.first_activity.as_deref().map_or(true, |f| ts < f) {
            self.first_activity = Some(ts.to_string());
        }
        if self.last_activity.as_deref().map_or(true, |l| ts > l) {
            self.last_activity = Some(ts.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct UserMarketActivityRow {
    pub user_address: String,
    pub market_id: String,
    pub total_orders: i64,
    pub total_trades: i64,
    pub total_volume: f64,
    pub first_activity: Option<String>,
    pub last_activity: Option<String>,
    pub position_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PriceSnapshotRow {
    pub timestamp: String,
    pub price: f64,
    pub volume_24h: f64,
    pub price_change_24h: f64,
    pub volatility: f64,
}

/// Snapshot enrichment; all zero when no analysis is supplied.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SnapshotEnrichment {
    pub volume_24h: f64,
    pub price_change_24h: f64,
    pub volatility: f64,
}

// ---------------------------------------------------------------------------
// Market view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ActiveUserRow {
    pub user_address: String,
    pub total_orders: i64,
    pub total_trades: i64,
    pub total_volume: f64,
    pub position_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct TradingStatistics {
    pub total_users: i64,
    pub total_orders: i64,
    pub total_trades: i64,
    pub total_volume: f64,
    pub avg_volume_per_user: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketView {
    pub market_id: String,
    pub market_info: Option<MarketRelationshipRow>,
    pub recent_prices: Vec<PriceSnapshotRow>,
    pub active_users: Vec<ActiveUserRow>,
    pub trading_statistics: TradingStatistics,
    pub generated_at: String,
}

// ---------------------------------------------------------------------------
// User view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct UserMarketRow {
    pub market_id: String,
    pub market_name: Option<String>,
    pub market_status: Option<String>,
    pub total_orders: i64,
    pub total_trades: i64,
    pub total_volume: f64,
    pub first_activity: Option<String>,
    pub last_activity: Option<String>,
    pub position_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct TradingSummary {
    pub active_markets: i64,
    pub total_orders: i64,
    pub total_trades: i64,
    pub total_volume: f64,
    pub total_position_value: f64,
    pub first_activity: Option<String>,
    pub last_activity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PositionEntry {
    pub market_id: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortfolioOverview {
    pub positions_count: usize,
    pub positions: Vec<PositionEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub user_address: String,
    pub market_activities: Vec<UserMarketRow>,
    pub trading_summary: TradingSummary,
    pub portfolio_overview: PortfolioOverview,
    pub generated_at: String,
}

// ---------------------------------------------------------------------------
// Correlations and report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct MarketCorrelation {
    pub market1_id: String,
    pub market1_name: String,
    pub market2_id: String,
    pub market2_name: String,
    pub common_users: i64,
    pub avg_combined_volume: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportSummary {
    pub total_markets: i64,
    pub total_users: i64,
    pub total_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TopMarket {
    pub market_id: String,
    pub market_name: Option<String>,
    pub user_count: i64,
    pub total_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TopUser {
    pub user_address: String,
    pub markets_count: i64,
    pub total_volume: f64,
    pub total_trades: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveReport {
    pub generated_at: String,
    pub summary: ReportSummary,
    pub top_markets: Vec<TopMarket>,
    pub top_users: Vec<TopUser>,
    pub market_correlations: Vec<MarketCorrelation>,
}

/// Row counts used for ecosystem health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StoreTotals {
    pub markets: i64,
    pub users: i64,
    pub activities: i64,
    pub snapshots: i64,
}
