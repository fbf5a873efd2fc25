pub mod client;
pub mod envelope;
pub mod latency;
pub mod rate_limit;

pub use client::HttpFetcher;
pub use latency::LatencyStats;
