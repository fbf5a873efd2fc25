//! Checkpointed offset pagination.
//!
//! A collection is identified by a [`CollectionKey`]. Each applied page is
//! persisted as `<key>_progress.json`; a later run with the same key resumes
//! from that checkpoint. The committed result `<key>_final.json` is written
//! only when the server signals the end of the collection.

use std::collections::HashSet;
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::shutdown::SharedShutdown;
use crate::storage::BlobStore;
use crate::types::{self, Entity, MarketType, OrderStatus};

/// Result of fetching one page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// `fetched` is the element count the server sent, before malformed
    /// elements were dropped. The short-page check uses it.
    Page { items: Vec<Entity>, fetched: usize },
    EndOfData,
    Failed(String),
}

impl PageOutcome {
    /// A page whose every server element survived decoding.
    pub fn page(items: Vec<Entity>) -> Self {
        let fetched = items.len();
        PageOutcome::Page { items, fetched }
    }

    /// Items of a page, empty for the other variants.
    pub fn items(self) -> Vec<Entity> {
        match self {
            PageOutcome::Page { items, .. } => items,
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Collection identity
// ---------------------------------------------------------------------------

/// Checkpoint identity: entity kind plus filter signature.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionKey {
    name: String,
    filters: Map<String, Value>,
}

impl CollectionKey {
    pub fn events(market_type: MarketType) -> Self {
        let mut filters = Map::new();
        filters.insert("market_type".into(), Value::String(market_type.to_string()));
        Self {
            name: format!("events_{market_type}"),
            filters,
        }
    }

    pub fn orders(market: Option<&str>, status: Option<OrderStatus>) -> Self {
        let mut filters = Map::new();
        filters.insert("market".into(), opt_value(market));
        filters.insert(
            "status".into(),
            opt_value(status.map(|s| s.to_string()).as_deref()),
        );
        Self {
            name: format!(
                "orders_{}_{}",
                market.unwrap_or("all"),
                status.map(|s| s.to_string()).unwrap_or_else(|| "all".into())
            ),
            filters,
        }
    }

    pub fn trades(market: Option<&str>) -> Self {
        let mut filters = Map::new();
        filters.insert("market".into(), opt_value(market));
        Self {
            name: format!("trades_{}", market.unwrap_or("all")),
            filters,
        }
    }

    pub fn user_orders(address: &str) -> Self {
        Self::user("user_orders", address)
    }

    pub fn user_trades(address: &str) -> Self {
        Self::user("user_trades", address)
    }

    fn user(kind: &str, address: &str) -> Self {
        let mut filters = Map::new();
        filters.insert("user_address".into(), Value::String(address.to_string()));
        Self {
            name: format!("{kind}_{address}"),
            filters,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn progress_file(&self) -> String {
        format!("{}_progress.json", self.name)
    }

    pub fn final_file(&self) -> String {
        format!("{}_final.json", self.name)
    }
}

fn opt_value(v: Option<&str>) -> Value {
    v.map(|s| Value::String(s.to_string())).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Checkpoint and run result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub items: Vec<Entity>,
    /// Request cursor: pages issued times page size, not the retained item count.
    pub offset: usize,
    pub collection_key: String,
    #[serde(flatten)]
    pub filters: Map<String, Value>,
    pub last_update: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Complete,
    Interrupted,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Collected {
    pub items: Vec<Entity>,
    pub offset: usize,
    pub completion: Completion,
}

impl Collected {
    pub fn is_complete(&self) -> bool {
        self.completion == Completion::Complete
    }
}

// ---------------------------------------------------------------------------
// Paginator
// ---------------------------------------------------------------------------

pub struct ResumablePaginator<'a> {
    store: &'a BlobStore,
    page_size: usize,
    shutdown: SharedShutdown,
}

impl<'a> ResumablePaginator<'a> {
    pub fn new(store: &'a BlobStore, page_size: usize, shutdown: SharedShutdown) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            shutdown,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Deletes the checkpoint so the next run starts at offset 0.
    pub fn reset(&self, key: &CollectionKey) -> bool {
        match self.store.delete(&key.progress_file()) {
            Ok(removed) => {
                if removed {
                    info!(collection = key.name(), "Checkpoint deleted");
                }
                removed
            }
            Err(e) => {
                error!(collection = key.name(), "Failed to delete checkpoint: {e}");
                false
            }
        }
    }

    /// Fetches pages in increasing offset order until the server runs out,
    /// a page fails, or shutdown is requested.
    pub async fn run<F, Fut>(&self, key: &CollectionKey, mut fetch_page: F) -> Collected
    where
        F: FnMut(usize, usize) -> Fut,
        Fut: Future<Output = PageOutcome>,
    {
        let (mut items, mut offset) = self.resume(key);
        let mut seen: HashSet<String> = items.iter().filter_map(types::entity_id).collect();

        let completion = loop {
            if self.shutdown.is_shutdown_requested() {
                info!(collection = key.name(), offset, "Shutdown requested, saving progress");
                self.checkpoint(key, &items, offset);
                break Completion::Interrupted;
            }

            match fetch_page(offset, self.page_size).await {
                PageOutcome::EndOfData => {
                    debug!(collection = key.name(), offset, "No more data");
                    break Completion::Complete;
                }
                PageOutcome::Failed(reason) => {
                    warn!(collection = key.name(), offset, "Page fetch failed: {reason}");
                    self.checkpoint(key, &items, offset);
                    break Completion::Failed(reason);
                }
                PageOutcome::Page { items: page, fetched } => {
                    let received = page.len();
                    let before = items.len();
                    for entity in page {
                        if let Some(id) = types::entity_id(&entity) {
                            if !seen.insert(id) {
                                continue;
                            }
                        }
                        items.push(entity);
                    }
                    let added = items.len() - before;
                    offset += self.page_size;

                    info!(
                        collection = key.name(),
                        fetched,
                        added,
                        duplicates = received - added,
                        total = items.len(),
                        offset,
                        "Page applied"
                    );
                    self.checkpoint(key, &items, offset);

                    if fetched < self.page_size {
                        break Completion::Complete;
                    }
                }
            }
        };

        if completion == Completion::Complete {
            if let Err(e) = self.store.save_json(&key.final_file(), &items) {
                error!(collection = key.name(), "Failed to save final result: {e}");
            }
            info!(collection = key.name(), total = items.len(), "Collection complete");
        }

        Collected {
            items,
            offset,
            completion,
        }
    }

    fn resume(&self, key: &CollectionKey) -> (Vec<Entity>, usize) {
        match self.store.load_progress::<Checkpoint>(&key.progress_file()) {
            Ok(Some(cp)) => {
                info!(
                    collection = key.name(),
                    items = cp.items.len(),
                    offset = cp.offset,
                    "Resuming from checkpoint"
                );
                (cp.items, cp.offset)
            }
            Ok(None) => (Vec::new(), 0),
            Err(e) => {
                warn!(collection = key.name(), "Unreadable checkpoint, starting over: {e}");
                (Vec::new(), 0)
            }
        }
    }

    fn checkpoint(&self, key: &CollectionKey, items: &[Entity], offset: usize) {
        let cp = Checkpoint {
            items: items.to_vec(),
            offset,
            collection_key: key.name().to_string(),
            filters: key.filters.clone(),
            last_update: types::now_iso(),
        };
        if let Err(e) = self.store.save_progress(&key.progress_file(), &cp) {
            error!(collection = key.name(), "Failed to save checkpoint: {e}");
        }
    }
}
