//! Small statistics shared by the collectors' analysis outputs.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{self, Entity};

/// Value counts of one entity field; missing values count as `"unknown"`.
pub fn distribution<'a, I>(items: I, key: &str) -> BTreeMap<String, u64>
where
    I: IntoIterator<Item = &'a Entity>,
{
    let mut dist = BTreeMap::new();
    for e in items {
        *dist.entry(types::field_label(e, key)).or_insert(0) += 1;
    }
    dist
}

/// Keeps the `n` largest buckets and folds the rest into `"others"`.
/// Distributions with at most `n` buckets are returned unchanged.
pub fn top_n_with_others(dist: BTreeMap<String, u64>, n: usize) -> BTreeMap<String, u64> {
    if dist.len() <= n {
        return dist;
    }
    let mut sorted: Vec<(String, u64)> = dist.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let others: u64 = sorted[n..].iter().map(|(_, c)| c).sum();
    let mut top: BTreeMap<String, u64> = sorted.into_iter().take(n).collect();
    top.insert("others".to_string(), others);
    top
}

/// Parseable numeric values of `key` across `items`.
pub fn numeric_field<'a, I>(items: I, key: &str) -> Vec<f64>
where
    I: IntoIterator<Item = &'a Entity>,
{
    items
        .into_iter()
        .filter_map(|e| types::field_f64(e, key))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub median: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmountStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub total: f64,
}

/// Upper median (`sorted[n / 2]`).
pub fn price_stats(values: &[f64]) -> Option<PriceStats> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(PriceStats {
        count: values.len(),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        average: mean(values),
        median: sorted[sorted.len() / 2],
    })
}

pub fn amount_stats(values: &[f64]) -> Option<AmountStats> {
    if values.is_empty() {
        return None;
    }
    let total: f64 = values.iter().sum();
    Some(AmountStats {
        count: values.len(),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        average: total / values.len() as f64,
        total,
    })
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Sample standard deviation; 0 below two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceChange {
    pub absolute_change: f64,
    /// Infinite when moving away from a zero price.
    pub percentage_change: f64,
}

pub fn price_change(old: f64, new: f64) -> PriceChange {
    let absolute_change = new - old;
    let percentage_change = if old == 0.0 {
        if new == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        absolute_change / old * 100.0
    };
    PriceChange {
        absolute_change,
        percentage_change,
    }
}

/// Population standard deviation of simple returns. Steps from a zero
/// price are skipped.
pub fn volatility(prices: &[f64]) -> f64 {
    if prices.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let m = mean(&returns);
    let var = returns.iter().map(|r| (r - m).powi(2)).sum::<f64>() / returns.len() as f64;
    var.sqrt()
}

/// Percent change from first to last, 0 when the first price is 0.
pub fn total_change_percent(prices: &[f64]) -> f64 {
    match (prices.first(), prices.last()) {
        (Some(&first), Some(&last)) if first != 0.0 => (last - first) / first * 100.0,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRange {
    pub earliest: String,
    pub latest: String,
    /// Present when both ends parse as timestamps.
    pub span_seconds: Option<i64>,
}

/// Earliest/latest of a timestamp field, compared as strings.
pub fn time_range<'a, I>(items: I, key: &str) -> Option<TimeRange>
where
    I: IntoIterator<Item = &'a Entity>,
{
    let stamps: Vec<String> = items
        .into_iter()
        .filter_map(|e| types::field_string(e, key))
        .collect();
    let earliest = stamps.iter().min()?.clone();
    let latest = stamps.iter().max()?.clone();
    let span_seconds = match (
        types::parse_timestamp(&serde_json::Value::String(earliest.clone())),
        types::parse_timestamp(&serde_json::Value::String(latest.clone())),
    ) {
        (Some(a), Some(b)) => Some((b - a).num_seconds()),
        _ => None,
    };
    Some(TimeRange {
        earliest,
        latest,
        span_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ents(v: serde_json::Value) -> Vec<Entity> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|e| e.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn distribution_counts_unknowns() {
        let items = ents(json!([{"side": "BUY"}, {"side": "BUY"}, {"side": "SELL"}, {}]));
        let d = distribution(&items, "side");
        assert_eq!(d["BUY"], 2);
        assert_eq!(d["SELL"], 1);
        assert_eq!(d["unknown"], 1);
    }

    #[test]
    fn top_n_folds_remainder_into_others() {
        let mut d = BTreeMap::new();
        for i in 0..12u64 {
            d.insert(format!("m{i:02}"), i + 1);
        }
        let top = top_n_with_others(d, 10);
        assert_eq!(top.len(), 11);
        assert_eq!(top["others"], 1 + 2);
        assert!(!top.contains_key("m00"));
        assert_eq!(top["m11"], 12);
    }

    #[test]
    fn top_n_leaves_small_distributions_alone() {
        let d: BTreeMap<String, u64> = [("a".to_string(), 1)].into();
        assert_eq!(top_n_with_others(d.clone(), 10), d);
    }

    #[test]
    fn price_stats_uses_upper_median() {
        let s = price_stats(&[0.4, 0.1, 0.3, 0.2]).unwrap();
        assert_eq!(s.median, 0.3);
        assert_eq!(s.min, 0.1);
        assert_eq!(s.max, 0.4);
        assert!((s.average - 0.25).abs() < 1e-12);
        assert!(price_stats(&[]).is_none());
    }

    #[test]
    fn numeric_field_skips_unparseable() {
        let items = ents(json!([{"size": "10"}, {"size": "abc"}, {"size": 5}, {}]));
        let sizes = numeric_field(&items, "size");
        assert_eq!(sizes, [10.0, 5.0]);
        assert_eq!(amount_stats(&sizes).unwrap().total, 15.0);
    }

    #[test]
    fn price_change_from_zero_is_infinite() {
        let c = price_change(0.0, 0.5);
        assert_eq!(c.absolute_change, 0.5);
        assert!(c.percentage_change.is_infinite());
        let c = price_change(0.5, 0.55);
        assert!((c.percentage_change - 10.0).abs() < 1e-9);
    }

    #[test]
    fn volatility_is_population_std_of_returns() {
        assert_eq!(volatility(&[1.0]), 0.0);
        assert_eq!(volatility(&[1.0, 1.0, 1.0]), 0.0);
        // returns +100% and -50%: mean 0.25, deviations 0.75
        assert!((volatility(&[1.0, 2.0, 1.0]) - 0.75).abs() < 1e-12);
        // the zero base step is skipped, leaving a single return
        assert_eq!(volatility(&[0.0, 1.0, 2.0]), 0.0);
    }

    #[test]
    fn time_range_over_iso_strings() {
        let items = ents(json!([
            {"created_at": "2024-01-01T00:00:10Z"},
            {"created_at": "2024-01-01T00:00:00Z"},
            {"other": 1}
        ]));
        let r = time_range(&items, "created_at").unwrap();
        assert_eq!(r.earliest, "2024-01-01T00:00:00Z");
        assert_eq!(r.span_seconds, Some(10));
        assert!(time_range(&items[2..], "created_at").is_none());
    }
}
