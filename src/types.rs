use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A record returned by the remote APIs (event, market, order, trade, position).
/// Kept as a JSON object: the upstream schemas drift and only a handful of
/// fields are interpreted by this crate.
pub type Entity = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Market type filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    All,
    Active,
    Closed,
    Archived,
}

impl MarketType {
    /// Query flag sent to `/events` for this type; `All` sends none.
    pub fn query_flag(self) -> Option<(&'static str, &'static str)> {
        match self {
            MarketType::All => None,
            MarketType::Active => Some(("active", "true")),
            MarketType::Closed => Some(("closed", "true")),
            MarketType::Archived => Some(("archived", "true")),
        }
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketType::All => "all",
            MarketType::Active => "active",
            MarketType::Closed => "closed",
            MarketType::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Live,
    Filled,
    Cancelled,
    PartiallyFilled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Live => "LIVE",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Price history fidelity
// ---------------------------------------------------------------------------

/// Bucket size of `/prices-history`, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fidelity {
    Minute,
    Hour,
    Day,
}

impl Fidelity {
    pub fn minutes(self) -> u32 {
        match self {
            Fidelity::Minute => 1,
            Fidelity::Hour => 60,
            Fidelity::Day => 1440,
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        match minutes {
            1 => Some(Fidelity::Minute),
            60 => Some(Fidelity::Hour),
            1440 => Some(Fidelity::Day),
            _ => None,
        }
    }
}

impl std::fmt::Display for Fidelity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Fidelity::Minute => "minute",
            Fidelity::Hour => "hour",
            Fidelity::Day => "day",
        };
        write!(f, "{s}")
    }
}

/// One `/prices-history` sample. `timestamp` is unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: i64,
    pub price: f64,
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Dedup key of an entity. String and numeric ids are both accepted; null,
/// empty or missing ids mean "no reliable key".
pub fn entity_id(e: &Entity) -> Option<String> {
    match e.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric field that may arrive as a JSON number or a numeric string.
pub fn lenient_f64(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

pub fn field_f64(e: &Entity, key: &str) -> Option<f64> {
    e.get(key).and_then(lenient_f64)
}

/// String view of a scalar field. Numbers are rendered, everything else is `None`.
pub fn field_string(e: &Entity, key: &str) -> Option<String> {
    match e.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Like `field_string` but with the `"unknown"` bucket used by distributions.
pub fn field_label(e: &Entity, key: &str) -> String {
    field_string(e, key).unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// ISO-8601 UTC with a fixed microsecond precision so that stored timestamps
/// compare correctly as strings.
pub fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

pub fn now_iso() -> String {
    iso(Utc::now())
}

/// Timestamp fragment used in artifact names: `20240131_235959`.
pub fn file_stamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d_%H%M%S").to_string()
}

/// Parses RFC 3339 strings and unix epoch values (seconds or milliseconds,
/// as numbers or numeric strings).
pub fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = v.as_str() {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(&s.replacen(' ', "T", 1)) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    let epoch = lenient_f64(v)?;
    let secs = if epoch > 1e12 { epoch / 1000.0 } else { epoch };
    Utc.timestamp_opt(secs.trunc() as i64, 0).single()
}
