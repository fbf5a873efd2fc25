use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{self, Config};
use crate::error::Result;
use crate::http::latency::LatencyStats;
use crate::http::rate_limit::RateLimiter;

/// Rate-limited GET client bound to one API base URL.
///
/// Every attempt waits on the rate limiter. Transport errors and non-2xx
/// statuses are retried with exponential backoff; after the last attempt the
/// caller gets `None` rather than an error.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
    max_retries: u32,
    backoff_base: Duration,
    latency: Arc<LatencyStats>,
}

impl HttpFetcher {
    pub fn new(base_url: &str, cfg: &Config, latency: Arc<LatencyStats>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(config::USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(cfg.rate_limit_delay),
            max_retries: cfg.max_retries.max(1),
            backoff_base: cfg.retry_backoff_base,
            latency,
        })
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Option<Value> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 0..self.max_retries {
            self.limiter.wait().await;

            let started = Instant::now();
            let result = self.attempt(&url, query).await;
            self.latency.record(started.elapsed());

            match result {
                Ok(body) => return Some(body),
                Err(e) => {
                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        "Request failed: {e}"
                    );
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        warn!(url = %url, "Giving up after {} attempts", self.max_retries);
        None
    }

    async fn attempt(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        let text = resp.text().await?;
        match serde_json::from_str::<Value>(&text) {
            Ok(v) => Ok(v),
            Err(_) => {
                debug!(url = %url, "Non-JSON response body, wrapping as raw_response");
                Ok(json!({ "raw_response": text }))
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt + 1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{extract::State, http::StatusCode, routing::get, Json, Router};

    use super::*;
    use crate::test_support::spawn_server;

    fn fetcher(base: &str) -> HttpFetcher {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::for_tests(base, dir.path());
        HttpFetcher::new(base, &cfg, Arc::new(LatencyStats::new())).unwrap()
    }

    async fn flaky(State(hits): State<Arc<AtomicUsize>>) -> (StatusCode, Json<Value>) {
        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})))
        } else {
            (StatusCode::OK, Json(json!([{"id": "a"}])))
        }
    }

    async fn always_404(State(hits): State<Arc<AtomicUsize>>) -> StatusCode {
        hits.fetch_add(1, Ordering::SeqCst);
        StatusCode::NOT_FOUND
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/orders", get(flaky))
            .with_state(Arc::clone(&hits));
        let base = spawn_server(app).await;

        let body = fetcher(&base).get("/orders", &[("limit", "10".into())]).await;
        assert_eq!(body, Some(json!([{"id": "a"}])));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_status_is_retried_then_absent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/missing", get(always_404))
            .with_state(Arc::clone(&hits));
        let base = spawn_server(app).await;

        assert!(fetcher(&base).get("/missing", &[]).await.is_none());
        // Config::for_tests allows two attempts
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_json_body_is_wrapped() {
        let app = Router::new().route("/text", get(|| async { "not json" }));
        let base = spawn_server(app).await;

        let body = fetcher(&base).get("/text", &[]).await;
        assert_eq!(body, Some(json!({"raw_response": "not json"})));
    }

    #[tokio::test]
    async fn unreachable_host_yields_none() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        assert!(fetcher(&base).get("/anything", &[]).await.is_none());
    }

    #[tokio::test]
    async fn records_latency_per_attempt() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/orders", get(flaky))
            .with_state(Arc::clone(&hits));
        let base = spawn_server(app).await;

        let latency = Arc::new(LatencyStats::new());
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::for_tests(&base, dir.path());
        let f = HttpFetcher::new(&base, &cfg, Arc::clone(&latency)).unwrap();
        f.get("/orders", &[]).await;
        assert_eq!(latency.summary().samples, 2);
    }

    #[test]
    fn backoff_doubles_from_twice_the_base() {
        let f = fetcher("http://127.0.0.1:1");
        assert_eq!(f.backoff(0), Duration::from_millis(2));
        assert_eq!(f.backoff(1), Duration::from_millis(4));
        assert_eq!(f.backoff(2), Duration::from_millis(8));
    }
}
