//! Read-side joins over the relationship store.
//!
//! SQLite reports `SUM`/`COUNT` with whatever affinity the data had, so every
//! aggregate is CAST to the column type the row struct decodes.

use crate::db::models::{
    ActiveUserRow, ComprehensiveReport, MarketCorrelation, MarketRelationshipRow, MarketView,
    PortfolioOverview, PositionEntry, PriceSnapshotRow, ReportSummary, TopMarket, TopUser,
    TradingStatistics, TradingSummary, UserMarketRow, UserView,
};
use crate::db::store::RelationshipStore;
use crate::error::Result;
use crate::types;

const RECENT_PRICES_LIMIT: i64 = 100;
const ACTIVE_USERS_LIMIT: i64 = 50;
const REPORT_TOP_LIMIT: i64 = 10;
const MIN_COMMON_USERS: i64 = 2;

impl RelationshipStore {
    pub async fn market_view(&self, market_id: &str) -> Result<MarketView> {
        let market_info = sqlx::query_as::<_, MarketRelationshipRow>(
            r#"
            SELECT market_id, event_id, market_name, market_status, created_at, last_updated
            FROM market_relationships
            WHERE market_id = ?
            "#,
        )
        .bind(market_id)
        .fetch_optional(self.pool())
        .await?;

        let recent_prices = sqlx::query_as::<_, PriceSnapshotRow>(
            r#"
            SELECT timestamp, price, volume_24h, price_change_24h, volatility
            FROM market_price_snapshots
            WHERE market_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(market_id)
        .bind(RECENT_PRICES_LIMIT)
        .fetch_all(self.pool())
        .await?;

        let active_users = sqlx::query_as::<_, ActiveUserRow>(
            r#"
            SELECT user_address, total_orders, total_trades, total_volume, position_value
            FROM user_market_activities
            WHERE market_id = ? AND (total_orders > 0 OR total_trades > 0)
            ORDER BY total_volume DESC, user_address ASC
            LIMIT ?
            "#,
        )
        .bind(market_id)
        .bind(ACTIVE_USERS_LIMIT)
        .fetch_all(self.pool())
        .await?;

        let trading_statistics = sqlx::query_as::<_, TradingStatistics>(
            r#"
            SELECT
                CAST(COUNT(DISTINCT user_address) AS INTEGER)       AS total_users,
                CAST(COALESCE(SUM(total_orders), 0) AS INTEGER)     AS total_orders,
                CAST(COALESCE(SUM(total_trades), 0) AS INTEGER)     AS total_trades,
                CAST(COALESCE(SUM(total_volume), 0) AS REAL)        AS total_volume,
                CAST(AVG(total_volume) AS REAL)                     AS avg_volume_per_user
            FROM user_market_activities
            WHERE market_id = ?
            "#,
        )
        .bind(market_id)
        .fetch_one(self.pool())
        .await?;

        Ok(MarketView {
            market_id: market_id.to_string(),
            market_info,
            recent_prices,
            active_users,
            trading_statistics,
            generated_at: types::now_iso(),
        })
    }

    pub async fn user_view(&self, user_address: &str) -> Result<UserView> {
        let market_activities = sqlx::query_as::<_, UserMarketRow>(
            r#"
            SELECT uma.market_id, mr.market_name, mr.market_status,
                   uma.total_orders, uma.total_trades, uma.total_volume,
                   uma.first_activity, uma.last_activity, uma.position_value
            FROM user_market_activities uma
            LEFT JOIN market_relationships mr ON uma.market_id = mr.market_id
            WHERE uma.user_address = ?
            ORDER BY uma.total_volume DESC, uma.market_id ASC
            "#,
        )
        .bind(user_address)
        .fetch_all(self.pool())
        .await?;

        let trading_summary = sqlx::query_as::<_, TradingSummary>(
            r#"
            SELECT
                CAST(COUNT(DISTINCT market_id) AS INTEGER)          AS active_markets,
                CAST(COALESCE(SUM(total_orders), 0) AS INTEGER)     AS total_orders,
                CAST(COALESCE(SUM(total_trades), 0) AS INTEGER)     AS total_trades,
                CAST(COALESCE(SUM(total_volume), 0) AS REAL)        AS total_volume,
                CAST(COALESCE(SUM(position_value), 0) AS REAL)      AS total_position_value,
                MIN(first_activity)                                 AS first_activity,
                MAX(last_activity)                                  AS last_activity
            FROM user_market_activities
            WHERE user_address = ?
            "#,
        )
        .bind(user_address)
        .fetch_one(self.pool())
        .await?;

        let positions = sqlx::query_as::<_, PositionEntry>(
            r#"
            SELECT market_id, position_value AS value
            FROM user_market_activities
            WHERE user_address = ? AND position_value > 0
            ORDER BY position_value DESC
            "#,
        )
        .bind(user_address)
        .fetch_all(self.pool())
        .await?;

        Ok(UserView {
            user_address: user_address.to_string(),
            market_activities,
            trading_summary,
            portfolio_overview: PortfolioOverview {
                positions_count: positions.len(),
                positions,
            },
            generated_at: types::now_iso(),
        })
    }

    /// Market pairs sharing at least two users. Each pair appears once with
    /// `market1_id < market2_id`.
    pub async fn market_correlations(&self, limit: i64) -> Result<Vec<MarketCorrelation>> {
        let rows = sqlx::query_as::<_, MarketCorrelation>(
            r#"
            SELECT
                pairs.market1_id,
                COALESCE(mr1.market_name, 'Unknown') AS market1_name,
                pairs.market2_id,
                COALESCE(mr2.market_name, 'Unknown') AS market2_name,
                pairs.common_users,
                pairs.avg_combined_volume
            FROM (
                SELECT
                    uma1.market_id AS market1_id,
                    uma2.market_id AS market2_id,
                    CAST(COUNT(DISTINCT uma1.user_address) AS INTEGER)          AS common_users,
                    CAST(AVG(uma1.total_volume + uma2.total_volume) AS REAL)    AS avg_combined_volume
                FROM user_market_activities uma1
                JOIN user_market_activities uma2
                  ON uma1.user_address = uma2.user_address
                 AND uma1.market_id < uma2.market_id
                GROUP BY uma1.market_id, uma2.market_id
                HAVING COUNT(DISTINCT uma1.user_address) >= ?
            ) AS pairs
            LEFT JOIN market_relationships mr1 ON pairs.market1_id = mr1.market_id
            LEFT JOIN market_relationships mr2 ON pairs.market2_id = mr2.market_id
            ORDER BY pairs.common_users DESC, pairs.avg_combined_volume DESC
            LIMIT ?
            "#,
        )
        .bind(MIN_COMMON_USERS)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn comprehensive_report(&self) -> Result<ComprehensiveReport> {
        let (total_markets, total_users, total_volume) = sqlx::query_as::<_, (i64, i64, f64)>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM market_relationships),
                (SELECT COUNT(DISTINCT user_address) FROM user_market_activities),
                (SELECT CAST(COALESCE(SUM(total_volume), 0) AS REAL) FROM user_market_activities)
            "#,
        )
        .fetch_one(self.pool())
        .await?;

        let top_markets = sqlx::query_as::<_, TopMarket>(
            r#"
            SELECT
                mr.market_id,
                mr.market_name,
                CAST(COUNT(DISTINCT uma.user_address) AS INTEGER)   AS user_count,
                CAST(COALESCE(SUM(uma.total_volume), 0) AS REAL)    AS total_volume
            FROM market_relationships mr
            LEFT JOIN user_market_activities uma ON mr.market_id = uma.market_id
            GROUP BY mr.market_id, mr.market_name
            ORDER BY user_count DESC, total_volume DESC
            LIMIT ?
            "#,
        )
        .bind(REPORT_TOP_LIMIT)
        .fetch_all(self.pool())
        .await?;

        let top_users = sqlx::query_as::<_, TopUser>(
            r#"
            SELECT
                user_address,
                CAST(COUNT(DISTINCT market_id) AS INTEGER)          AS markets_count,
                CAST(COALESCE(SUM(total_volume), 0) AS REAL)        AS total_volume,
                CAST(COALESCE(SUM(total_trades), 0) AS INTEGER)     AS total_trades
            FROM user_market_activities
            GROUP BY user_address
            ORDER BY total_volume DESC
            LIMIT ?
            "#,
        )
        .bind(REPORT_TOP_LIMIT)
        .fetch_all(self.pool())
        .await?;

        let market_correlations = self.market_correlations(REPORT_TOP_LIMIT).await?;

        Ok(ComprehensiveReport {
            generated_at: types::now_iso(),
            summary: ReportSummary {
                total_markets,
                total_users,
                total_volume,
            },
            top_markets,
            top_users,
            market_correlations,
        })
    }

    /// Known market ids in ascending order.
    pub async fn list_market_ids(&self, limit: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT market_id FROM market_relationships ORDER BY market_id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Distinct addresses with recorded activity, in ascending order.
    pub async fn list_user_addresses(&self, limit: i64) -> Result<Vec<String>> {
        let addresses = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT user_address FROM user_market_activities ORDER BY user_address LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::{json, Map, Value};

    use crate::db::store::UserActivitySource;
    use crate::types::Entity;

    use super::*;

    fn ents(v: Value) -> Vec<Entity> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|e| e.as_object().cloned().unwrap())
            .collect()
    }

    /// Each user trades `volume` in each listed market.
    async fn seed_activity(store: &RelationshipStore, user: &str, markets: &[&str], volume: f64) {
        let trades: Vec<Entity> = markets
            .iter()
            .map(|m| {
                json!({"maker": user, "market": m, "volume": volume, "timestamp": "2024-01-01T00:00:00Z"})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect();
        let positions = json!([{"market": markets[0], "value": volume}]);
        let source = UserActivitySource {
            user_address: user,
            orders: &[],
            trades: &trades,
            positions: &positions,
        };
        store.upsert_user_market_activity(source, None, None).await.unwrap();
    }

    async fn seeded() -> RelationshipStore {
        let store = RelationshipStore::in_memory().await.unwrap();
        let events = ents(json!([{"id": "e1", "markets": [
            {"id": "m1", "question": "Market one"},
            {"id": "m2", "question": "Market two"}
        ]}]));
        store.upsert_market_relationships(&events, &[]).await.unwrap();

        seed_activity(&store, "0xA", &["m1", "m2", "m3"], 10.0).await;
        seed_activity(&store, "0xB", &["m1", "m2", "m3"], 20.0).await;
        seed_activity(&store, "0xC", &["m2", "m3"], 5.0).await;
        seed_activity(&store, "0xD", &["m1"], 1.0).await;
        store
    }

    #[tokio::test]
    async fn correlations_are_canonical_pairs() {
        let store = seeded().await;
        let pairs = store.market_correlations(50).await.unwrap();

        let mut seen = HashSet::new();
        for p in &pairs {
            assert!(p.market1_id < p.market2_id, "self pair or swapped order: {p:?}");
            assert!(seen.insert((p.market1_id.clone(), p.market2_id.clone())));
            assert!(p.common_users >= 2);
        }
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].market1_id, "m2");
        assert_eq!(pairs[0].market2_id, "m3");
        assert_eq!(pairs[0].common_users, 3);
        assert_eq!(pairs[0].market2_name, "Unknown");
        // m1/m2 and m1/m3 tie on users and volume
        assert!(pairs[1..].iter().all(|p| p.common_users == 2 && p.avg_combined_volume == 30.0));
        let m1m2 = pairs.iter().find(|p| p.market2_id == "m2").unwrap();
        assert_eq!(m1m2.market1_name, "Market one");
        assert_eq!(m1m2.market2_name, "Market two");
    }

    #[tokio::test]
    async fn correlation_limit_truncates() {
        let store = seeded().await;
        assert_eq!(store.market_correlations(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn market_view_aggregates() {
        let store = seeded().await;
        let mut price = Map::new();
        price.insert("m1".into(), json!({"price": 0.25}));
        store.append_price_snapshot(&price, None).await.unwrap();
        price.insert("m1".into(), json!({"price": 0.3}));
        store.append_price_snapshot(&price, None).await.unwrap();

        let view = store.market_view("m1").await.unwrap();
        assert_eq!(view.market_info.as_ref().unwrap().market_name.as_deref(), Some("Market one"));
        assert_eq!(view.recent_prices.len(), 2);
        assert_eq!(view.recent_prices[0].price, 0.3, "newest first");
        assert_eq!(
            view.active_users.iter().map(|u| u.user_address.as_str()).collect::<Vec<_>>(),
            ["0xB", "0xA", "0xD"]
        );
        let stats = &view.trading_statistics;
        assert_eq!(stats.total_users, 3);
        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.total_orders, 0);
        assert_eq!(stats.total_volume, 31.0);
        assert!((stats.avg_volume_per_user.unwrap() - 31.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn market_view_of_unknown_market_is_empty() {
        let store = RelationshipStore::in_memory().await.unwrap();
        let view = store.market_view("nope").await.unwrap();
        assert!(view.market_info.is_none());
        assert!(view.recent_prices.is_empty());
        assert_eq!(view.trading_statistics.total_users, 0);
        assert_eq!(view.trading_statistics.total_volume, 0.0);
        assert_eq!(view.trading_statistics.avg_volume_per_user, None);
    }

    #[tokio::test]
    async fn user_view_joins_names_and_positions() {
        let store = seeded().await;
        let view = store.user_view("0xA").await.unwrap();

        assert_eq!(view.market_activities.len(), 3);
        let m3 = view.market_activities.iter().find(|r| r.market_id == "m3").unwrap();
        assert_eq!(m3.market_name, None);
        let m1 = view.market_activities.iter().find(|r| r.market_id == "m1").unwrap();
        assert_eq!(m1.market_name.as_deref(), Some("Market one"));

        let summary = &view.trading_summary;
        assert_eq!(summary.active_markets, 3);
        assert_eq!(summary.total_trades, 3);
        assert_eq!(summary.total_volume, 30.0);
        assert_eq!(summary.total_position_value, 10.0);
        assert_eq!(summary.first_activity.as_deref(), Some("2024-01-01T00:00:00Z"));

        assert_eq!(view.portfolio_overview.positions_count, 1);
        assert_eq!(view.portfolio_overview.positions[0].market_id, "m1");
    }

    #[tokio::test]
    async fn report_ranks_markets_and_users() {
        let store = seeded().await;
        let report = store.comprehensive_report().await.unwrap();

        assert_eq!(report.summary.total_markets, 2);
        assert_eq!(report.summary.total_users, 4);
        assert_eq!(report.summary.total_volume, 30.0 + 60.0 + 10.0 + 1.0);
        assert_eq!(report.top_markets.len(), 2, "only markets known to market_relationships");
        assert_eq!(report.top_markets[0].market_id, "m2");
        assert_eq!(report.top_markets[0].user_count, 3);
        assert_eq!(report.top_users[0].user_address, "0xB");
        assert_eq!(report.top_users[0].markets_count, 3);
        assert_eq!(report.market_correlations.len(), 3);
    }

    #[tokio::test]
    async fn listings_are_sorted_and_limited() {
        let store = seeded().await;
        assert_eq!(store.list_market_ids(10).await.unwrap(), ["m1", "m2"]);
        assert_eq!(store.list_user_addresses(10).await.unwrap(), ["0xA", "0xB", "0xC", "0xD"]);
        assert_eq!(store.list_user_addresses(2).await.unwrap(), ["0xA", "0xB"]);
    }

    #[tokio::test]
    async fn report_on_empty_store() {
        let store = RelationshipStore::in_memory().await.unwrap();
        let report = store.comprehensive_report().await.unwrap();
        assert_eq!(report.summary, ReportSummary::default());
        assert!(report.top_markets.is_empty());
        assert!(report.market_correlations.is_empty());
    }
}
