//! Short-interval price and volume watch over a fixed set of markets.
//!
//! Each tick records the current price per market, compares it with the
//! previous record, looks for a run of same-direction moves over the last
//! few records, and checks the trailing hour of trade volume. Alerts are
//! rate limited per (market, kind) by a cooldown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::collectors::history::{MonitorHandle, PriceHistoryBook, PriceRecord};
use crate::collectors::{seconds_between, stats, CollectorContext};
use crate::config::{self, severity_thresholds};
use crate::error::Result;
use crate::http::envelope::{EndpointFamily, ResponseEnvelope};
use crate::http::HttpFetcher;
use crate::shutdown::SharedShutdown;
use crate::storage::BlobStore;
use crate::types;

const TREND_WINDOW: usize = 5;
const TREND_MIN_STRENGTH: f64 = 0.8;
const TREND_MIN_MOVES: usize = 3;
const VOLUME_TRADE_LIMIT: usize = 100;

pub struct FluctuationMonitor {
    clob: HttpFetcher,
    store: BlobStore,
    history: PriceHistoryBook,
    last_alert: DashMap<(String, AlertKind), DateTime<Utc>>,
    alerts_sent: DashMap<AlertKind, u64>,
    threshold: f64,
    check_interval: Duration,
    shutdown: SharedShutdown,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PriceChange,
    Trend,
    VolumeSpike,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::PriceChange => "price_change",
            AlertKind::Trend => "trend",
            AlertKind::VolumeSpike => "volume_spike",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// From an absolute percentage change.
    pub fn classify(percentage_change: f64) -> Self {
        if percentage_change >= severity_thresholds::CRITICAL_MIN {
            Severity::Critical
        } else if percentage_change >= severity_thresholds::HIGH_MIN {
            Severity::High
        } else if percentage_change >= severity_thresholds::MEDIUM_MIN {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Upward,
    Downward,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceSpan {
    pub start: f64,
    pub end: f64,
    pub min: f64,
    pub max: f64,
}

impl PriceSpan {
    fn of(prices: &[f64]) -> Option<Self> {
        Some(Self {
            start: *prices.first()?,
            end: *prices.last()?,
            min: prices.iter().copied().fold(f64::INFINITY, f64::min),
            max: prices.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    PriceChange {
        market_id: String,
        current_price: f64,
        last_price: f64,
        absolute_change: f64,
        percentage_change: f64,
        severity: Severity,
        timestamp: String,
    },
    Trend {
        market_id: String,
        trend_direction: TrendDirection,
        trend_strength: f64,
        price_range: PriceSpan,
        timestamp: String,
    },
    VolumeSpike {
        market_id: String,
        current_volume: f64,
        severity: Severity,
        timestamp: String,
    },
}

impl Alert {
    pub fn kind(&self) -> AlertKind {
        match self {
            Alert::PriceChange { .. } => AlertKind::PriceChange,
            Alert::Trend { .. } => AlertKind::Trend,
            Alert::VolumeSpike { .. } => AlertKind::VolumeSpike,
        }
    }

    pub fn market_id(&self) -> &str {
        match self {
            Alert::PriceChange { market_id, .. }
            | Alert::Trend { market_id, .. }
            | Alert::VolumeSpike { market_id, .. } => market_id,
        }
    }

    fn severity_label(&self) -> &'static str {
        match self {
            Alert::PriceChange { severity, .. } | Alert::VolumeSpike { severity, .. } => severity.as_str(),
            Alert::Trend { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trend {
    pub direction: TrendDirection,
    pub strength: f64,
    pub increases: usize,
    pub decreases: usize,
}

impl Trend {
    pub fn is_significant(&self) -> bool {
        self.strength >= TREND_MIN_STRENGTH && self.increases + self.decreases >= TREND_MIN_MOVES
    }
}

/// Direction of the majority of non-flat moves. `None` with fewer than 3
/// prices or when every step is flat. Ties count as downward.
pub fn detect_trend(prices: &[f64]) -> Option<Trend> {
    if prices.len() < 3 {
        return None;
    }
    let (mut increases, mut decreases) = (0usize, 0usize);
    for w in prices.windows(2) {
        if w[1] > w[0] {
            increases += 1;
        } else if w[1] < w[0] {
            decreases += 1;
        }
    }
    let moves = increases + decreases;
    if moves == 0 {
        return None;
    }
    let (direction, majority) = if increases > decreases {
        (TrendDirection::Upward, increases)
    } else {
        (TrendDirection::Downward, decreases)
    };
    Some(Trend {
        direction,
        strength: majority as f64 / moves as f64,
        increases,
        decreases,
    })
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct VolumeReading {
    pub market_id: String,
    pub recent_volume_1h: f64,
    pub trade_count: usize,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringTick {
    pub timestamp: String,
    pub monitored_markets: Vec<String>,
    pub price_data: Map<String, Value>,
    pub fluctuations_detected: usize,
    pub volume_spikes_detected: usize,
    pub fluctuations: Vec<Alert>,
    pub volume_spikes: Vec<Alert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringPeriod {
    pub start_time: String,
    pub end_time: String,
    pub duration_seconds: f64,
    pub duration_hours: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStatistics {
    pub total_price_records: usize,
    pub markets_with_data: usize,
    pub alert_types_triggered: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketFluctuation {
    pub data_points: usize,
    pub price_range: PriceSpan,
    pub volatility: f64,
    pub total_change_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringReport {
    pub monitoring_period: MonitoringPeriod,
    pub monitored_markets: Vec<String>,
    pub market_count: usize,
    pub statistics: MonitoringStatistics,
    /// Alerts sent during the run, per kind.
    pub alert_summary: BTreeMap<String, u64>,
    pub market_analysis: BTreeMap<String, MarketFluctuation>,
}

impl FluctuationMonitor {
    pub fn new(ctx: &CollectorContext) -> Result<Self> {
        Ok(Self {
            clob: ctx.clob()?,
            store: ctx.blob_store("fluctuation")?,
            history: PriceHistoryBook::new(config::MAX_HISTORY_LENGTH),
            last_alert: DashMap::new(),
            alerts_sent: DashMap::new(),
            threshold: config::PRICE_CHANGE_THRESHOLD,
            check_interval: Duration::from_secs(config::FLUCTUATION_CHECK_INTERVAL_SECS),
            shutdown: ctx.shutdown.clone(),
        })
    }

    /// Fractional price move that raises a `price_change` alert.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
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

    /// Current prices keyed by market id. Empty on failure.
    pub async fn fetch_current_prices(&self, market_ids: &[String]) -> Map<String, Value> {
        let mut query = Vec::new();
        if !market_ids.is_empty() {
            query.push(("market_ids", market_ids.join(",")));
        }
        match self.clob.get("/prices", &query).await {
            Some(Value::Object(prices)) => prices,
            Some(_) => {
                warn!("Price response was not an object");
                Map::new()
            }
            None => {
                error!("Failed to fetch current prices");
                Map::new()
            }
        }
    }

    /// Volume of the latest trades that happened within the last hour.
    pub async fn fetch_market_volume(&self, market_id: &str) -> Option<VolumeReading> {
        let query = [
            ("market", market_id.to_string()),
            ("limit", VOLUME_TRADE_LIMIT.to_string()),
        ];
        let body = self.clob.get("/trades", &query).await?;
        let trades = ResponseEnvelope::decode(body, EndpointFamily::Records)
            .into_items()
            .unwrap_or_default();

        let now = Utc::now();
        let hour_ago = now - chrono::Duration::hours(1);
        let recent_volume_1h = trades
            .iter()
            .filter(|t| {
                t.get("timestamp")
                    .and_then(types::parse_timestamp)
                    .is_some_and(|ts| ts >= hour_ago)
            })
            .map(|t| types::field_f64(t, "volume").unwrap_or(0.0))
            .sum();

        Some(VolumeReading {
            market_id: market_id.to_string(),
            recent_volume_1h,
            trade_count: trades.len(),
            timestamp: types::iso(now),
        })
    }

    // -----------------------------------------------------------------------
    // Detection
    // -----------------------------------------------------------------------

    pub fn update_price_history(&self, market_id: &str, price_data: &Value, timestamp: DateTime<Utc>) {
        self.history
            .push(market_id, PriceRecord::new(timestamp, price_data.clone()));
    }

    /// Expects `current` to already be the latest record of `market_id`.
    pub fn detect_price_fluctuations(&self, market_id: &str, current: &Value) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if self.history.len(market_id) < 2 {
            return alerts;
        }

        let last_price = self.history.previous(market_id).and_then(|r| r.price());
        let current_price = current.get("price").and_then(types::lenient_f64);
        if let (Some(last_price), Some(current_price)) = (last_price, current_price) {
            let change = stats::price_change(last_price, current_price);
            let magnitude = change.percentage_change.abs();
            if magnitude >= self.threshold * 100.0 {
                alerts.push(Alert::PriceChange {
                    market_id: market_id.to_string(),
                    current_price,
                    last_price,
                    absolute_change: change.absolute_change,
                    percentage_change: change.percentage_change,
                    severity: Severity::classify(magnitude),
                    timestamp: types::now_iso(),
                });
            }
        }

        if self.history.len(market_id) >= TREND_WINDOW {
            let recent = self.history.recent_prices(market_id, TREND_WINDOW);
            if recent.len() == TREND_WINDOW {
                if let (Some(trend), Some(span)) = (detect_trend(&recent), PriceSpan::of(&recent)) {
                    if trend.is_significant() {
                        alerts.push(Alert::Trend {
                            market_id: market_id.to_string(),
                            trend_direction: trend.direction,
                            trend_strength: trend.strength,
                            price_range: span,
                            timestamp: types::now_iso(),
                        });
                    }
                }
            }
        }
        alerts
    }

    pub fn detect_volume_spikes(&self, reading: &VolumeReading) -> Vec<Alert> {
        let volume = reading.recent_volume_1h;
        if volume <= config::VOLUME_SPIKE_THRESHOLD {
            return Vec::new();
        }
        let severity = if volume > config::VOLUME_SPIKE_HIGH {
            Severity::High
        } else {
            Severity::Medium
        };
        vec![Alert::VolumeSpike {
            market_id: reading.market_id.clone(),
            current_volume: volume,
            severity,
            timestamp: types::now_iso(),
        }]
    }

    /// `false` while the cooldown of (market, kind) is running. A `true`
    /// answer starts a new cooldown.
    pub fn should_send_alert(&self, market_id: &str, kind: AlertKind) -> bool {
        self.should_send_alert_at(market_id, kind, Utc::now())
    }

    fn should_send_alert_at(&self, market_id: &str, kind: AlertKind, now: DateTime<Utc>) -> bool {
        let key = (market_id.to_string(), kind);
        if let Some(last) = self.last_alert.get(&key) {
            if (now - *last).num_seconds() < config::ALERT_COOLDOWN_SECS {
                return false;
            }
        }
        self.last_alert.insert(key, now);
        true
    }

    /// Drops alerts still in cooldown, saves and logs the rest.
    pub fn process_alerts(&self, alerts: Vec<Alert>) -> Vec<Alert> {
        let sent: Vec<Alert> = alerts
            .into_iter()
            .filter(|a| self.should_send_alert(a.market_id(), a.kind()))
            .collect();
        if sent.is_empty() {
            return sent;
        }

        let now = Utc::now();
        let record = serde_json::json!({
            "timestamp": types::iso(now),
            "alerts": &sent,
            "alert_count": sent.len(),
        });
        self.save(&format!("alerts_{}.json", types::file_stamp(now)), &record);

        for alert in &sent {
            *self.alerts_sent.entry(alert.kind()).or_insert(0) += 1;
            warn!(
                market_id = alert.market_id(),
                severity = alert.severity_label(),
                "{} detected",
                alert.kind().as_str()
            );
            match alert {
                Alert::PriceChange { percentage_change, .. } => {
                    warn!("Price change: {percentage_change:.2}%");
                }
                Alert::VolumeSpike { current_volume, .. } => {
                    warn!("Volume spike: {current_volume}");
                }
                Alert::Trend { .. } => {}
            }
        }
        sent
    }

    // -----------------------------------------------------------------------
    // Monitoring loop
    // -----------------------------------------------------------------------

    /// Ticks every check interval until `duration` elapses or shutdown is
    /// requested, then writes the monitoring report.
    pub async fn monitor_markets(&self, market_ids: &[String], duration: Option<Duration>) -> MonitoringReport {
        let shutdown = Arc::clone(&self.shutdown);
        self.run_monitor(market_ids, duration, &shutdown).await
    }

    /// Runs [`Self::monitor_markets`] on a background task with its own stop signal.
    pub fn start_background_monitoring(
        self: &Arc<Self>,
        market_ids: Vec<String>,
        duration: Option<Duration>,
    ) -> MonitorHandle<MonitoringReport> {
        let shutdown = self.shutdown.child();
        let monitor = Arc::clone(self);
        let loop_shutdown = Arc::clone(&shutdown);
        let join = tokio::spawn(async move { monitor.run_monitor(&market_ids, duration, &loop_shutdown).await });
        info!("Background fluctuation monitoring started");
        MonitorHandle::new(shutdown, join)
    }

    async fn run_monitor(
        &self,
        market_ids: &[String],
        duration: Option<Duration>,
        shutdown: &SharedShutdown,
    ) -> MonitoringReport {
        info!(markets = market_ids.len(), "Starting fluctuation monitoring");
        let start = Utc::now();
        let deadline = duration.and_then(|d| chrono::Duration::from_std(d).ok()).map(|d| start + d);

        loop {
            if shutdown.is_shutdown_requested() {
                info!("Shutdown requested, stopping fluctuation monitoring");
                break;
            }
            if deadline.is_some_and(|end| Utc::now() >= end) {
                info!("Monitoring duration reached");
                break;
            }
            self.monitor_tick(market_ids).await;
            if !shutdown.sleep(self.check_interval).await {
                break;
            }
        }

        self.generate_monitoring_report(start, Utc::now(), market_ids)
    }

    async fn monitor_tick(&self, market_ids: &[String]) -> MonitoringTick {
        let now = Utc::now();
        info!(at = %types::iso(now), "Running fluctuation check");
        let price_data = self.fetch_current_prices(market_ids).await;

        let mut fluctuations = Vec::new();
        let mut volume_spikes = Vec::new();
        for market_id in market_ids {
            let Some(current) = price_data.get(market_id) else {
                continue;
            };
            self.update_price_history(market_id, current, now);
            fluctuations.extend(self.detect_price_fluctuations(market_id, current));
            if let Some(reading) = self.fetch_market_volume(market_id).await {
                volume_spikes.extend(self.detect_volume_spikes(&reading));
            }
        }

        let mut alerts = fluctuations.clone();
        alerts.extend(volume_spikes.iter().cloned());
        self.process_alerts(alerts);

        let tick = MonitoringTick {
            timestamp: types::iso(now),
            monitored_markets: market_ids.to_vec(),
            price_data,
            fluctuations_detected: fluctuations.len(),
            volume_spikes_detected: volume_spikes.len(),
            fluctuations,
            volume_spikes,
        };
        self.save(&format!("monitoring_{}.json", types::file_stamp(now)), &tick);
        tick
    }

    pub fn generate_monitoring_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        market_ids: &[String],
    ) -> MonitoringReport {
        let duration_seconds = seconds_between(start, end);
        let market_analysis = market_ids
            .iter()
            .filter_map(|id| {
                let prices: Vec<f64> = self.history.records(id).iter().filter_map(PriceRecord::price).collect();
                let span = PriceSpan::of(&prices)?;
                Some((
                    id.clone(),
                    MarketFluctuation {
                        data_points: prices.len(),
                        price_range: span,
                        volatility: stats::volatility(&prices),
                        total_change_percent: stats::total_change_percent(&prices),
                    },
                ))
            })
            .collect();
        let alert_summary: BTreeMap<String, u64> = self
            .alerts_sent
            .iter()
            .map(|e| (e.key().as_str().to_string(), *e.value()))
            .collect();

        let report = MonitoringReport {
            monitoring_period: MonitoringPeriod {
                start_time: types::iso(start),
                end_time: types::iso(end),
                duration_seconds,
                duration_hours: duration_seconds / 3600.0,
            },
            monitored_markets: market_ids.to_vec(),
            market_count: market_ids.len(),
            statistics: MonitoringStatistics {
                total_price_records: self.history.total_records(),
                markets_with_data: self.history.market_ids().len(),
                alert_types_triggered: alert_summary.len(),
            },
            alert_summary,
            market_analysis,
        };
        let file = format!("monitoring_report_{}.json", types::file_stamp(start));
        self.save(&file, &report);
        info!(file = %file, "Monitoring report generated");
        report
    }

    fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) {
        if let Err(e) = self.store.save_json(name, value) {
            warn!(file = name, "Failed to save: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{routing::get, Json, Router};
    use serde_json::json;

    use super::*;
    use crate::collectors::testing::context;
    use crate::test_support::spawn_server;

    fn offline_monitor(dir: &std::path::Path) -> FluctuationMonitor {
        FluctuationMonitor::new(&context("http://127.0.0.1:9", dir)).unwrap()
    }

    fn feed(monitor: &FluctuationMonitor, market_id: &str, prices: &[f64]) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for p in prices {
            let data = json!({ "price": p });
            monitor.update_price_history(market_id, &data, Utc::now());
            alerts = monitor.detect_price_fluctuations(market_id, &data);
        }
        alerts
    }

    #[test]
    fn severity_bands() {
        assert_eq!(Severity::classify(25.0), Severity::Critical);
        assert_eq!(Severity::classify(20.0), Severity::Critical);
        assert_eq!(Severity::classify(12.0), Severity::High);
        assert_eq!(Severity::classify(5.0), Severity::Medium);
        assert_eq!(Severity::classify(4.99), Severity::Low);
    }

    #[test]
    fn trend_needs_strength_and_moves() {
        let up = detect_trend(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(up.direction, TrendDirection::Upward);
        assert!(up.is_significant());

        let mixed = detect_trend(&[1.0, 2.0, 1.0, 2.0, 1.0]).unwrap();
        assert!(!mixed.is_significant());

        // Two non-flat moves are not enough.
        let short = detect_trend(&[1.0, 1.0, 1.0, 0.9, 0.8]).unwrap();
        assert_eq!(short.direction, TrendDirection::Downward);
        assert!(!short.is_significant());

        assert!(detect_trend(&[1.0, 1.0, 1.0]).is_none());
        assert!(detect_trend(&[1.0, 2.0]).is_none());
    }

    #[test]
    fn price_change_alert_against_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = offline_monitor(dir.path());

        assert!(feed(&monitor, "m1", &[0.5]).is_empty());
        let alerts = feed(&monitor, "m1", &[0.625]);
        assert_eq!(alerts.len(), 1);
        let Alert::PriceChange {
            last_price,
            severity,
            percentage_change,
            ..
        } = &alerts[0]
        else {
            panic!("expected a price change alert");
        };
        assert_eq!(*last_price, 0.5);
        assert_eq!(*percentage_change, 25.0);
        assert_eq!(*severity, Severity::Critical);

        assert!(feed(&monitor, "m1", &[0.63]).is_empty());
    }

    #[test]
    fn steady_climb_raises_a_trend() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = offline_monitor(dir.path()).with_threshold(0.5);
        let alerts = feed(&monitor, "m1", &[0.50, 0.51, 0.52, 0.53, 0.54]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind(), AlertKind::Trend);
        let value = serde_json::to_value(&alerts[0]).unwrap();
        assert_eq!(value["type"], "trend");
        assert_eq!(value["trend_direction"], "upward");
        assert_eq!(value["price_range"]["max"], 0.54);
    }

    #[test]
    fn volume_spike_bands() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = offline_monitor(dir.path());
        let reading = |v: f64| VolumeReading {
            market_id: "m1".into(),
            recent_volume_1h: v,
            trade_count: 1,
            timestamp: types::now_iso(),
        };
        assert!(monitor.detect_volume_spikes(&reading(10_000.0)).is_empty());
        let medium = monitor.detect_volume_spikes(&reading(20_000.0));
        assert!(matches!(medium[0], Alert::VolumeSpike { severity: Severity::Medium, .. }));
        let high = monitor.detect_volume_spikes(&reading(60_000.0));
        assert!(matches!(high[0], Alert::VolumeSpike { severity: Severity::High, .. }));
    }

    #[test]
    fn cooldown_is_per_market_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = offline_monitor(dir.path());
        let t0 = Utc::now();
        assert!(monitor.should_send_alert_at("m1", AlertKind::PriceChange, t0));
        assert!(!monitor.should_send_alert_at("m1", AlertKind::PriceChange, t0 + chrono::Duration::seconds(299)));
        assert!(monitor.should_send_alert_at("m1", AlertKind::Trend, t0));
        assert!(monitor.should_send_alert_at("m2", AlertKind::PriceChange, t0));
        assert!(monitor.should_send_alert_at("m1", AlertKind::PriceChange, t0 + chrono::Duration::seconds(300)));
    }

    #[tokio::test]
    async fn volume_counts_only_the_last_hour() {
        let recent = types::iso(Utc::now() - chrono::Duration::minutes(5));
        let old = types::iso(Utc::now() - chrono::Duration::hours(3));
        let app = Router::new().route(
            "/trades",
            get(move || {
                let (recent, old) = (recent.clone(), old.clone());
                async move {
                    Json(json!({"data": [
                        {"id": "a", "volume": "300", "timestamp": recent},
                        {"id": "b", "volume": 50, "timestamp": recent},
                        {"id": "c", "volume": 999, "timestamp": old},
                        {"id": "d", "volume": 1, "timestamp": "garbage"}
                    ]}))
                }
            }),
        );
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let monitor = FluctuationMonitor::new(&context(&base, dir.path())).unwrap();

        let reading = monitor.fetch_market_volume("m1").await.unwrap();
        assert_eq!(reading.recent_volume_1h, 350.0);
        assert_eq!(reading.trade_count, 4);
    }

    #[tokio::test]
    async fn background_monitoring_reports_on_stop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let app = Router::new()
            .route(
                "/prices",
                get(move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let price = if n == 0 { 0.5 } else { 0.8 };
                    async move { Json(json!({"m1": {"price": price}})) }
                }),
            )
            .route("/trades", get(|| async { Json(json!([])) }));
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let monitor = Arc::new(
            FluctuationMonitor::new(&context(&base, dir.path()))
                .unwrap()
                .with_interval(Duration::from_millis(20)),
        );

        let handle = monitor.start_background_monitoring(vec!["m1".to_string()], None);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = handle.stop().await.unwrap();

        assert_eq!(report.market_count, 1);
        assert!(report.statistics.total_price_records >= 2);
        let analysis = &report.market_analysis["m1"];
        assert_eq!(analysis.price_range.start, 0.5);
        assert_eq!(analysis.price_range.end, 0.8);
        assert_eq!(report.alert_summary["price_change"], 1);

        let written: Vec<String> = std::fs::read_dir(monitor.store().dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(written.iter().any(|f| f.starts_with("monitoring_report_")));
        assert!(written.iter().any(|f| f.starts_with("alerts_")));
    }

    #[tokio::test]
    async fn monitoring_stops_after_duration() {
        let app = Router::new().route("/prices", get(|| async { Json(json!({})) }));
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let monitor = FluctuationMonitor::new(&context(&base, dir.path()))
            .unwrap()
            .with_interval(Duration::from_millis(10));

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            monitor.monitor_markets(&["m1".to_string()], Some(Duration::from_millis(50))),
        )
        .await
        .unwrap();
        assert!(report.market_analysis.is_empty());
        assert!(report.monitoring_period.duration_seconds >= 0.05);
    }
}
