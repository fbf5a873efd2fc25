use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::collectors::{page_params, seconds_between, stats, CollectorContext};
use crate::error::Result;
use crate::http::envelope::{items_or_empty, page_outcome, EndpointFamily, ResponseEnvelope};
use crate::http::HttpFetcher;
use crate::paginator::{Collected, CollectionKey, PageOutcome, ResumablePaginator};
use crate::shutdown::SharedShutdown;
use crate::storage::BlobStore;
use crate::types::{self, Entity, MarketType};

/// Events and market metadata: Gamma for events, markets and timeseries,
/// CLOB for the sampling and simplified market listings.
pub struct MarketInfoCollector {
    gamma: HttpFetcher,
    clob: HttpFetcher,
    store: BlobStore,
    page_size: usize,
    shutdown: SharedShutdown,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DateRange {
    pub earliest: String,
    pub latest: String,
    pub span_days: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventAnalysis {
    pub total_events: usize,
    pub event_types: BTreeMap<String, u64>,
    pub status_distribution: BTreeMap<String, u64>,
    pub date_range: Option<DateRange>,
    pub markets_per_event: BTreeMap<String, u64>,
    pub analysis_timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataTypeBlock {
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    pub data: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveSummary {
    pub total_data_types: usize,
    pub total_items_collected: usize,
    pub include_timeseries: bool,
    pub errors_count: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComprehensiveMarketData {
    pub collection_timestamp: String,
    pub completion_timestamp: String,
    pub duration_seconds: f64,
    pub data_types: BTreeMap<String, DataTypeBlock>,
    pub summary: ComprehensiveSummary,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub total_events: usize,
    pub event_types_count: usize,
    pub status_types_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub collection_type: MarketType,
    pub start_time: String,
    pub end_time: String,
    pub duration_seconds: f64,
    pub events_collected: usize,
    pub events_complete: bool,
    pub markets_collected: usize,
    pub analysis_included: bool,
    pub data_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_summary: Option<AnalysisSummary>,
}

impl MarketInfoCollector {
    pub fn new(ctx: &CollectorContext) -> Result<Self> {
        Ok(Self {
            gamma: ctx.gamma()?,
            clob: ctx.clob()?,
            store: ctx.blob_store("info")?,
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

    pub async fn fetch_events(&self, market_type: MarketType, offset: usize, limit: usize) -> PageOutcome {
        let mut query = page_params(limit, offset);
        if let Some((k, v)) = market_type.query_flag() {
            query.push((k, v.to_string()));
        }
        let outcome = page_outcome(self.gamma.get("/events", &query).await, EndpointFamily::Events);
        if let PageOutcome::Page { items: ref events, .. } = outcome {
            info!(%market_type, offset, count = events.len(), "Fetched events");
        }
        outcome
    }

    pub async fn fetch_all_events(&self, market_type: MarketType) -> Collected {
        let key = CollectionKey::events(market_type);
        info!(%market_type, "Collecting all events");
        ResumablePaginator::new(&self.store, self.page_size, self.shutdown.clone())
            .run(&key, |offset, limit| self.fetch_events(market_type, offset, limit))
            .await
    }

    pub async fn fetch_markets(
        &self,
        limit: usize,
        offset: usize,
        active: Option<bool>,
        closed: Option<bool>,
    ) -> Vec<Entity> {
        self.try_fetch_markets(limit, offset, active, closed)
            .await
            .unwrap_or_default()
    }

    async fn try_fetch_markets(
        &self,
        limit: usize,
        offset: usize,
        active: Option<bool>,
        closed: Option<bool>,
    ) -> Option<Vec<Entity>> {
        let query = with_flags(page_params(limit, offset), active, closed);
        let markets = decode_list(self.gamma.get("/markets", &query).await, EndpointFamily::Markets, "markets")?;
        info!(count = markets.len(), offset, "Fetched markets");
        Some(markets)
    }

    pub async fn fetch_single_market(&self, market_id: &str) -> Option<Value> {
        let market = self.gamma.get(&format!("/markets/{market_id}"), &[]).await;
        if market.is_none() {
            warn!(market_id, "Failed to fetch market details");
        }
        market
    }

    pub async fn fetch_sampling_markets(&self, limit: usize, offset: usize) -> Vec<Entity> {
        self.try_list(&self.clob, "/sampling-markets", page_params(limit, offset))
            .await
            .unwrap_or_default()
    }

    pub async fn fetch_simplified_markets(
        &self,
        limit: usize,
        offset: usize,
        active: Option<bool>,
        closed: Option<bool>,
    ) -> Vec<Entity> {
        let query = with_flags(page_params(limit, offset), active, closed);
        self.try_list(&self.clob, "/simplified-markets", query)
            .await
            .unwrap_or_default()
    }

    pub async fn fetch_sampling_simplified_markets(&self, limit: usize, offset: usize) -> Vec<Entity> {
        self.try_list(&self.clob, "/sampling-simplified-markets", page_params(limit, offset))
            .await
            .unwrap_or_default()
    }

    /// `interval` is one of `1m, 5m, 15m, 1h, 4h, 1d`.
    pub async fn fetch_timeseries(
        &self,
        market_id: Option<&str>,
        interval: &str,
        start_time: Option<&str>,
        end_time: Option<&str>,
    ) -> Vec<Entity> {
        let query = timeseries_query(market_id, interval, start_time, end_time);
        items_or_empty(self.gamma.get("/timeseries", &query).await, EndpointFamily::Records)
    }

    async fn try_list(
        &self,
        fetcher: &HttpFetcher,
        path: &str,
        query: Vec<(&'static str, String)>,
    ) -> Option<Vec<Entity>> {
        let items = decode_list(fetcher.get(path, &query).await, EndpointFamily::Markets, path)?;
        info!(path, count = items.len(), "Fetched market listing");
        Some(items)
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// One pass over every market listing flavour. Each listing is saved
    /// to its own file; failures are counted rather than aborting the pass.
    pub async fn collect_comprehensive_market_data(
        &self,
        include_timeseries: bool,
        timeseries_interval: &str,
    ) -> ComprehensiveMarketData {
        let start = Utc::now();
        let mut data_types = BTreeMap::new();
        let mut errors = Vec::new();
        let limit = self.page_size;

        let markets = self.try_fetch_markets(limit, 0, Some(true), None).await;
        self.record_block(&mut data_types, &mut errors, "standard_markets", markets.clone(), Some(100), None);

        let sampling = self.try_list(&self.clob, "/sampling-markets", page_params(limit, 0)).await;
        self.record_block(&mut data_types, &mut errors, "sampling_markets", sampling, None, None);

        let simplified = self
            .try_list(
                &self.clob,
                "/simplified-markets",
                with_flags(page_params(limit, 0), Some(true), None),
            )
            .await;
        self.record_block(&mut data_types, &mut errors, "simplified_markets", simplified, Some(100), None);

        let sampling_simplified = self
            .try_list(&self.clob, "/sampling-simplified-markets", page_params(limit, 0))
            .await;
        self.record_block(
            &mut data_types,
            &mut errors,
            "sampling_simplified_markets",
            sampling_simplified,
            None,
            None,
        );

        let events = match self.fetch_events(MarketType::Active, 0, 200).await {
            PageOutcome::Failed(_) => None,
            other => Some(other.items()),
        };
        self.record_block(&mut data_types, &mut errors, "events", events, None, None);

        if include_timeseries {
            let query = timeseries_query(None, timeseries_interval, None, None);
            let series = decode_list(
                self.gamma.get("/timeseries", &query).await,
                EndpointFamily::Records,
                "timeseries",
            );
            self.record_block(
                &mut data_types,
                &mut errors,
                "timeseries",
                series,
                Some(50),
                Some(timeseries_interval.to_string()),
            );
        }

        if let Some(markets) = markets.filter(|m| !m.is_empty()) {
            let mut details = Vec::new();
            for id in markets.iter().take(5).filter_map(types::entity_id) {
                if let Some(Value::Object(d)) = self.fetch_single_market(&id).await {
                    details.push(d);
                }
            }
            self.record_block(&mut data_types, &mut errors, "market_details_samples", Some(details), None, None);
        }

        let end = Utc::now();
        let total_items = data_types.values().map(|b| b.count).sum();
        let types_count = data_types.len();
        let success_rate =
            (types_count.saturating_sub(errors.len())) as f64 / types_count.max(1) as f64 * 100.0;

        let result = ComprehensiveMarketData {
            collection_timestamp: types::iso(start),
            completion_timestamp: types::iso(end),
            duration_seconds: seconds_between(start, end),
            summary: ComprehensiveSummary {
                total_data_types: types_count,
                total_items_collected: total_items,
                include_timeseries,
                errors_count: errors.len(),
                success_rate,
            },
            data_types,
            errors,
        };

        self.save(
            &format!("comprehensive_collection_{}.json", types::file_stamp(start)),
            &result,
        );
        info!(
            items = total_items,
            data_types = types_count,
            duration_s = result.duration_seconds,
            "Comprehensive market collection finished"
        );
        result
    }

    fn record_block(
        &self,
        data_types: &mut BTreeMap<String, DataTypeBlock>,
        errors: &mut Vec<String>,
        name: &str,
        items: Option<Vec<Entity>>,
        keep: Option<usize>,
        interval: Option<String>,
    ) {
        let items = match items {
            Some(items) => items,
            None => {
                errors.push(format!("{name}: request failed"));
                Vec::new()
            }
        };
        if !items.is_empty() {
            let file = match &interval {
                Some(i) => format!("comprehensive_{name}_{i}.json"),
                None => format!("comprehensive_{name}.json"),
            };
            self.save(&file, &items);
        }
        let count = items.len();
        let data = match keep {
            Some(n) => items.into_iter().take(n).collect(),
            None => items,
        };
        data_types.insert(name.to_string(), DataTypeBlock { count, interval, data });
    }

    /// Paginated events for `market_type` plus the first page of markets,
    /// with an optional event analysis.
    pub async fn run_collection(&self, market_type: MarketType, include_analysis: bool) -> CollectionSummary {
        let start = Utc::now();
        info!(%market_type, "Starting market info collection");

        let events = self.fetch_all_events(market_type).await;
        let markets = self.fetch_markets(self.page_size, 0, None, None).await;

        if !markets.is_empty() {
            self.save(&format!("markets_{market_type}.json"), &markets);
        }

        let mut data_files = vec![
            CollectionKey::events(market_type).final_file(),
            format!("markets_{market_type}.json"),
        ];

        let analysis = if include_analysis {
            analyze_events(&events.items)
        } else {
            None
        };
        if let Some(a) = &analysis {
            let file = format!("events_{market_type}_analysis.json");
            self.save(&file, a);
            data_files.push(file);
        }

        let end = Utc::now();
        let summary = CollectionSummary {
            collection_type: market_type,
            start_time: types::iso(start),
            end_time: types::iso(end),
            duration_seconds: seconds_between(start, end),
            events_collected: events.items.len(),
            events_complete: events.is_complete(),
            markets_collected: markets.len(),
            analysis_included: include_analysis,
            data_files,
            analysis_summary: analysis.as_ref().map(|a| AnalysisSummary {
                total_events: a.total_events,
                event_types_count: a.event_types.len(),
                status_types_count: a.status_distribution.len(),
            }),
        };
        self.save(&format!("collection_summary_{market_type}.json"), &summary);
        info!(
            %market_type,
            events = summary.events_collected,
            markets = summary.markets_collected,
            "Market info collection finished"
        );
        summary
    }

    pub fn reset(&self, market_type: MarketType) -> bool {
        ResumablePaginator::new(&self.store, self.page_size, self.shutdown.clone())
            .reset(&CollectionKey::events(market_type))
    }

    fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) {
        if let Err(e) = self.store.save_json(name, value) {
            warn!(file = name, "Failed to save: {e}");
        }
    }
}

/// `None` when there are no events to analyse.
pub fn analyze_events(events: &[Entity]) -> Option<EventAnalysis> {
    if events.is_empty() {
        return None;
    }

    let mut markets_per_event = BTreeMap::new();
    for e in events {
        let n = match e.get("markets") {
            Some(Value::Array(m)) => m.len(),
            _ => 0,
        };
        *markets_per_event.entry(n.to_string()).or_insert(0) += 1;
    }

    let date_range = stats::time_range(events, "created_at").map(|r| DateRange {
        span_days: r.span_seconds.map(|s| s as f64 / 86_400.0).unwrap_or(0.0),
        earliest: r.earliest,
        latest: r.latest,
    });

    Some(EventAnalysis {
        total_events: events.len(),
        event_types: stats::distribution(events, "type"),
        status_distribution: stats::distribution(events, "status"),
        date_range,
        markets_per_event,
        analysis_timestamp: types::now_iso(),
    })
}

fn with_flags(
    mut query: Vec<(&'static str, String)>,
    active: Option<bool>,
    closed: Option<bool>,
) -> Vec<(&'static str, String)> {
    if let Some(a) = active {
        query.push(("active", a.to_string()));
    }
    if let Some(c) = closed {
        query.push(("closed", c.to_string()));
    }
    query
}

fn timeseries_query(
    market_id: Option<&str>,
    interval: &str,
    start_time: Option<&str>,
    end_time: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut query = vec![("interval", interval.to_string())];
    if let Some(m) = market_id {
        query.push(("market_id", m.to_string()));
    }
    if let Some(s) = start_time {
        query.push(("start_time", s.to_string()));
    }
    if let Some(e) = end_time {
        query.push(("end_time", e.to_string()));
    }
    query
}

/// `None` for a failed request or an unrecognized shape.
fn decode_list(body: Option<Value>, family: EndpointFamily, what: &str) -> Option<Vec<Entity>> {
    let items = ResponseEnvelope::decode(body?, family).into_items();
    if items.is_none() {
        warn!(what, "Unrecognized response shape");
    }
    items
}

#[cfg(test)]
mod tests {
    use axum::{extract::Query, routing::get, Json, Router};
    use serde_json::json;

    use super::*;
    use crate::collectors::testing::context;
    use crate::test_support::spawn_server;

    fn ents(v: Value) -> Vec<Entity> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|e| e.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn analyze_events_distributions() {
        let events = ents(json!([
            {"id": "1", "type": "sports", "status": "open", "markets": [{}, {}], "created_at": "2024-01-01T00:00:00Z"},
            {"id": "2", "type": "sports", "markets": [{}], "created_at": "2024-01-03T00:00:00Z"},
            {"id": "3", "type": "politics", "status": "open"}
        ]));
        let a = analyze_events(&events).unwrap();
        assert_eq!(a.total_events, 3);
        assert_eq!(a.event_types["sports"], 2);
        assert_eq!(a.status_distribution["unknown"], 1);
        assert_eq!(a.markets_per_event["0"], 1);
        assert_eq!(a.markets_per_event["2"], 1);
        let range = a.date_range.unwrap();
        assert_eq!(range.earliest, "2024-01-01T00:00:00Z");
        assert!((range.span_days - 2.0).abs() < 1e-9);
        assert!(analyze_events(&[]).is_none());
    }

    async fn events(Query(q): Query<std::collections::HashMap<String, String>>) -> Json<Value> {
        let offset: usize = q.get("offset").and_then(|o| o.parse().ok()).unwrap_or(0);
        assert_eq!(q.get("closed").map(String::as_str), Some("true"));
        let page = match offset {
            0 => json!({"events": [{"id": "e1"}, {"id": "e2"}]}),
            2 => json!({"events": [{"id": "e2"}, {"id": "e3"}]}),
            _ => json!({"events": []}),
        };
        Json(page)
    }

    #[tokio::test]
    async fn fetch_all_events_paginates_and_dedups() {
        let base = spawn_server(Router::new().route("/events", get(events))).await;
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&base, dir.path());
        ctx.config.page_size = 2;
        let collector = MarketInfoCollector::new(&ctx).unwrap();

        let out = collector.fetch_all_events(MarketType::Closed).await;
        assert!(out.is_complete());
        let ids: Vec<_> = out.items.iter().filter_map(types::entity_id).collect();
        assert_eq!(ids, ["e1", "e2", "e3"]);
        assert!(dir.path().join("info/events_closed_final.json").exists());
    }

    #[tokio::test]
    async fn run_collection_writes_summary_and_analysis() {
        let app = Router::new()
            .route(
                "/events",
                get(|| async { Json(json!([{"id": "e1", "type": "t", "markets": []}])) }),
            )
            .route("/markets", get(|| async { Json(json!({"data": [{"id": "m1"}]})) }));
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let collector = MarketInfoCollector::new(&context(&base, dir.path())).unwrap();

        let summary = collector.run_collection(MarketType::All, true).await;
        assert_eq!(summary.events_collected, 1);
        assert_eq!(summary.markets_collected, 1);
        assert_eq!(summary.analysis_summary.unwrap().event_types_count, 1);
        let info = dir.path().join("info");
        assert!(info.join("markets_all.json").exists());
        assert!(info.join("events_all_analysis.json").exists());
        assert!(info.join("collection_summary_all.json").exists());
    }

    #[tokio::test]
    async fn comprehensive_collection_counts_failures() {
        // Only /markets and /markets/:id exist; every other listing 404s.
        let app = Router::new()
            .route("/markets", get(|| async { Json(json!([{"id": "m1"}, {"id": "m2"}])) }))
            .route(
                "/markets/:id",
                get(|axum::extract::Path(id): axum::extract::Path<String>| async move {
                    Json(json!({"id": id, "question": "q"}))
                }),
            );
        let base = spawn_server(app).await;
        let dir = tempfile::tempdir().unwrap();
        let collector = MarketInfoCollector::new(&context(&base, dir.path())).unwrap();

        let data = collector.collect_comprehensive_market_data(false, "1h").await;
        assert_eq!(data.data_types["standard_markets"].count, 2);
        assert_eq!(data.data_types["market_details_samples"].count, 2);
        // sampling, simplified, sampling_simplified and events failed
        assert_eq!(data.summary.errors_count, 4);
        assert_eq!(data.summary.total_data_types, 6);
        assert!((data.summary.success_rate - 2.0 / 6.0 * 100.0).abs() < 1e-9);
    }
}
