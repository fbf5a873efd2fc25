//! Normalisation of the two response shapes the remote APIs use: a bare
//! array, or an object wrapping the array under a family-specific key.

use serde_json::Value;
use tracing::warn;

use crate::paginator::PageOutcome;
use crate::types::Entity;

/// Endpoint families and the wrapper keys each one may use, in lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointFamily {
    Events,
    Markets,
    /// Orders and trades
    Records,
    History,
}

impl EndpointFamily {
    fn wrapper_keys(self) -> &'static [&'static str] {
        match self {
            EndpointFamily::Events => &["events", "data"],
            EndpointFamily::Markets => &["data", "markets"],
            EndpointFamily::Records => &["data"],
            EndpointFamily::History => &["history"],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEnvelope {
    Array(Vec<Entity>),
    Wrapped { key: &'static str, items: Vec<Entity> },
    Unrecognized,
}

impl ResponseEnvelope {
    pub fn decode(body: Value, family: EndpointFamily) -> Self {
        match locate(body, family) {
            Some(Located { key: None, raw }) => ResponseEnvelope::Array(objects_only(raw, family)),
            Some(Located { key: Some(key), raw }) => ResponseEnvelope::Wrapped {
                key,
                items: objects_only(raw, family),
            },
            None => ResponseEnvelope::Unrecognized,
        }
    }

    /// Canonical item sequence. `None` for an unrecognized shape.
    pub fn into_items(self) -> Option<Vec<Entity>> {
        match self {
            ResponseEnvelope::Array(items) | ResponseEnvelope::Wrapped { items, .. } => Some(items),
            ResponseEnvelope::Unrecognized => None,
        }
    }
}

/// The raw list inside a body, before element filtering.
struct Located {
    key: Option<&'static str>,
    raw: Vec<Value>,
}

fn locate(body: Value, family: EndpointFamily) -> Option<Located> {
    match body {
        Value::Array(raw) => Some(Located { key: None, raw }),
        Value::Object(mut obj) => family.wrapper_keys().iter().find_map(|key| match obj.remove(*key) {
            Some(Value::Array(raw)) => Some(Located { key: Some(*key), raw }),
            _ => None,
        }),
        _ => None,
    }
}

fn objects_only(arr: Vec<Value>, family: EndpointFamily) -> Vec<Entity> {
    let total = arr.len();
    let items: Vec<Entity> = arr
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(o) => Some(o),
            _ => None,
        })
        .collect();
    if items.len() < total {
        warn!(
            ?family,
            dropped = total - items.len(),
            "Dropped non-object elements from response"
        );
    }
    items
}

/// Decodes a list response, treating an absent body as an empty list.
/// For one-shot (non-paginated) fetches where failure means "nothing collected".
pub fn items_or_empty(body: Option<Value>, family: EndpointFamily) -> Vec<Entity> {
    body.and_then(|b| ResponseEnvelope::decode(b, family).into_items())
        .unwrap_or_default()
}

/// Maps a fetcher result onto the paginator's three-way page outcome.
pub fn page_outcome(body: Option<Value>, family: EndpointFamily) -> PageOutcome {
    let Some(body) = body else {
        return PageOutcome::Failed("request failed after retries".to_string());
    };
    match locate(body, family) {
        Some(Located { raw, .. }) if raw.is_empty() => PageOutcome::EndOfData,
        Some(Located { raw, .. }) => {
            let fetched = raw.len();
            PageOutcome::Page {
                items: objects_only(raw, family),
                fetched,
            }
        }
        None => PageOutcome::Failed(format!("unrecognized {family:?} response shape")),
    }
}
