//! Local relational store linking markets, users and price snapshots that
//! the collectors gather independently.
//!
//! Every write is a single statement on the pool; there is no transaction
//! spanning several rows or tables.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db::models::{MarketActivity, PriceSnapshotRow, SnapshotEnrichment, StoreTotals};
use crate::error::Result;
use crate::types::{self, Entity};

#[derive(Debug, Clone)]
pub struct RelationshipStore {
    pool: SqlitePool,
}

/// What the store needs from one user's collected data.
#[derive(Debug, Clone, Copy)]
pub struct UserActivitySource<'a> {
    pub user_address: &'a str,
    pub orders: &'a [Entity],
    pub trades: &'a [Entity],
    /// `{"positions": [...]}` as returned by the API, or a bare array.
    pub positions: &'a Value,
}

impl RelationshipStore {
    /// Opens (creating if needed) the database file and applies migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Relationship store ready at {}", path.display());
        Ok(Self { pool })
    }

    /// Private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Markets
    // -----------------------------------------------------------------------

    /// Markets nested in events are replace-upserted with the event's id and
    /// creation time. Standalone markets are inserted only when absent, so
    /// they never overwrite an event-derived row.
    pub async fn upsert_market_relationships(&self, events: &[Entity], markets: &[Entity]) -> Result<usize> {
        let now = types::now_iso();
        let mut written = 0usize;

        for event in events {
            let event_id = types::entity_id(event);
            let event_created = types::field_string(event, "created_at");
            let Some(Value::Array(nested)) = event.get("markets") else {
                continue;
            };
            for market in nested.iter().filter_map(Value::as_object) {
                let Some(market_id) = types::entity_id(market) else {
                    continue;
                };
                sqlx::query(
                    r#"
                    INSERT INTO market_relationships
                        (market_id, event_id, market_name, market_status, created_at, last_updated)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(market_id) DO UPDATE SET
                        event_id      = excluded.event_id,
                        market_name   = excluded.market_name,
                        market_status = excluded.market_status,
                        created_at    = excluded.created_at,
                        last_updated  = excluded.last_updated
                    "#,
                )
                .bind(&market_id)
                .bind(&event_id)
                .bind(types::field_string(market, "question").unwrap_or_default())
                .bind(types::field_string(market, "status").unwrap_or_default())
                .bind(&event_created)
                .bind(&now)
                .execute(&self.pool)
                .await?;
                written += 1;
            }
        }

        for market in markets {
            let Some(market_id) = types::entity_id(market) else {
                continue;
            };
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO market_relationships
                    (market_id, event_id, market_name, market_status, created_at, last_updated)
                VALUES (?, NULL, ?, ?, ?, ?)
                "#,
            )
            .bind(&market_id)
            .bind(types::field_string(market, "question").unwrap_or_default())
            .bind(types::field_string(market, "status").unwrap_or_default())
            .bind(types::field_string(market, "created_at"))
            .bind(&now)
            .execute(&self.pool)
            .await?;
            written += result.rows_affected() as usize;
        }

        info!(events = events.len(), rows = written, "Market relationships updated");
        Ok(written)
    }

    // -----------------------------------------------------------------------
    // User activity
    // -----------------------------------------------------------------------

    /// Replaces the user's row for every market touched by this call's input.
    /// Empty or absent `orders`/`trades` fall back to the user's own lists.
    pub async fn upsert_user_market_activity(
        &self,
        user: UserActivitySource<'_>,
        orders: Option<&[Entity]>,
        trades: Option<&[Entity]>,
    ) -> Result<usize> {
        if user.user_address.is_empty() {
            return Ok(0);
        }
        let orders = orders.filter(|o| !o.is_empty()).unwrap_or(user.orders);
        let trades = trades.filter(|t| !t.is_empty()).unwrap_or(user.trades);
        let activities = aggregate_user_activity(user.user_address, orders, trades, user.positions);

        for (market_id, a) in &activities {
            sqlx::query(
                r#"
                INSERT INTO user_market_activities
                    (user_address, market_id, total_orders, total_trades, total_volume,
                     first_activity, last_activity, position_value)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_address, market_id) DO UPDATE SET
                    total_orders   = excluded.total_orders,
                    total_trades   = excluded.total_trades,
                    total_volume   = excluded.total_volume,
                    first_activity = excluded.first_activity,
                    last_activity  = excluded.last_activity,
                    position_value = excluded.position_value
                "#,
            )
            .bind(user.user_address)
            .bind(market_id)
            .bind(a.total_orders)
            .bind(a.total_trades)
            .bind(a.total_volume)
            .bind(&a.first_activity)
            .bind(&a.last_activity)
            .bind(a.position_value)
            .execute(&self.pool)
            .await?;
        }

        info!(
            user = user.user_address,
            markets = activities.len(),
            "User market activity updated"
        );
        Ok(activities.len())
    }

    // -----------------------------------------------------------------------
    // Price snapshots
    // -----------------------------------------------------------------------

    /// Appends one row per market in `price_data` (`{market_id: {price, ..}}`).
    /// Enrichment comes from `analysis[market_id]` when present.
    pub async fn append_price_snapshot(
        &self,
        price_data: &Map<String, Value>,
        analysis: Option<&Map<String, Value>>,
    ) -> Result<usize> {
        let timestamp = types::now_iso();
        let mut inserted = 0usize;

        for (market_id, info) in price_data {
            if market_id == "timestamp" {
                continue;
            }
            let Some(info) = info.as_object() else {
                continue;
            };
            let price = match info.get("price") {
                None => 0.0,
                Some(v) => match types::lenient_f64(v) {
                    Some(p) => p,
                    None => continue,
                },
            };
            let enrich = analysis
                .and_then(|a| a.get(market_id))
                .and_then(Value::as_object)
                .map(|a| SnapshotEnrichment {
                    volume_24h: types::field_f64(a, "volume_24h").unwrap_or(0.0),
                    price_change_24h: types::field_f64(a, "price_change_24h").unwrap_or(0.0),
                    volatility: types::field_f64(a, "volatility").unwrap_or(0.0),
                })
                .unwrap_or_default();

            sqlx::query(
                r#"
                INSERT INTO market_price_snapshots
                    (market_id, timestamp, price, volume_24h, price_change_24h, volatility)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(market_id)
            .bind(&timestamp)
            .bind(price)
            .bind(enrich.volume_24h)
            .bind(enrich.price_change_24h)
            .bind(enrich.volatility)
            .execute(&self.pool)
            .await?;
            inserted += 1;
        }

        debug!(rows = inserted, "Price snapshots appended");
        Ok(inserted)
    }

    /// Snapshots of one market at or after `since` (ISO-8601), oldest first.
    pub async fn snapshot_history(&self, market_id: &str, since: &str) -> Result<Vec<PriceSnapshotRow>> {
        let rows = sqlx::query_as::<_, PriceSnapshotRow>(
            r#"
            SELECT timestamp, price, volume_24h, price_change_24h, volatility
            FROM market_price_snapshots
            WHERE market_id = ? AND timestamp >= ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(market_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn snapshot_market_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT market_id FROM market_price_snapshots ORDER BY market_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Deletes snapshots whose timestamp sorts before `now - days`.
    pub async fn purge_snapshots_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = types::iso(Utc::now() - chrono::Duration::days(days));
        let deleted = sqlx::query("DELETE FROM market_price_snapshots WHERE timestamp < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(deleted, cutoff = %cutoff, "Old price snapshots purged");
        Ok(deleted)
    }

    pub async fn totals(&self) -> Result<StoreTotals> {
        let (markets, users, activities, snapshots) = sqlx::query_as::<_, (i64, i64, i64, i64)>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM market_relationships),
                (SELECT COUNT(DISTINCT user_address) FROM user_market_activities),
                (SELECT COUNT(*) FROM user_market_activities),
                (SELECT COUNT(*) FROM market_price_snapshots)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreTotals {
            markets,
            users,
            activities,
            snapshots,
        })
    }
}

/// Per-market totals of one user from one call's orders, trades and positions.
///
/// An order is attributed to the user when its `maker` (or `owner`) is the
/// user, or when it names no maker/owner at all. A trade is attributed when
/// the user is its maker or taker, or when it names neither.
pub fn aggregate_user_activity(
    user_address: &str,
    orders: &[Entity],
    trades: &[Entity],
    positions: &Value,
) -> BTreeMap<String, MarketActivity> {
    let mut activities: BTreeMap<String, MarketActivity> = BTreeMap::new();

    for order in orders.iter().filter(|o| involves(o, user_address, &["maker", "owner"])) {
        let Some(market_id) = types::field_string(order, "market") else {
            continue;
        };
        let a = activities.entry(market_id).or_default();
        a.total_orders += 1;
        if let Some(ts) = types::field_string(order, "created_at") {
            a.touch(&ts);
        }
    }

    for trade in trades.iter().filter(|t| involves(t, user_address, &["maker", "taker"])) {
        let Some(market_id) = types::field_string(trade, "market") else {
            continue;
        };
        let a = activities.entry(market_id).or_default();
        a.total_trades += 1;
        if let Some(v) = types::field_f64(trade, "volume") {
            a.total_volume += v;
        }
        if let Some(ts) = types::field_string(trade, "timestamp") {
            a.touch(&ts);
        }
    }

    let position_list = match positions {
        Value::Object(o) => o.get("positions").and_then(Value::as_array),
        Value::Array(a) => Some(a),
        _ => None,
    };
    for position in position_list.into_iter().flatten().filter_map(Value::as_object) {
        let Some(market_id) = types::field_string(position, "market") else {
            continue;
        };
        activities.entry(market_id).or_default().position_value =
            types::field_f64(position, "value").unwrap_or(0.0);
    }

    activities
}

fn involves(e: &Entity, user: &str, roles: &[&str]) -> bool {
    let mut named = false;
    for role in roles {
        if let Some(addr) = types::field_string(e, role) {
            named = true;
            if addr.eq_ignore_ascii_case(user) {
                return true;
            }
        }
    }
    !named
}
