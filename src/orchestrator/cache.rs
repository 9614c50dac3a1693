//! Result cache for retrieval outputs
//!
//! Keyed by (normalized query, filters, reranker flag). Entries are
//! immutable snapshots behind Arc; TTL plus a capacity bound keep the cache
//! from growing with query volume.

use crate::config::CacheConfig;
use crate::retrieval::{SearchFilters, SearchOutput};
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query: String,
    pub filters: SearchFilters,
    pub use_reranker: bool,
}

pub struct ResultCache {
    entries: Cache<CacheKey, Arc<SearchOutput>>,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        // A zero TTL would make every entry dead on arrival
        let ttl = Duration::from_secs(config.ttl_sec.max(1));
        Self {
            entries: Cache::builder()
                .max_capacity(config.max)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<SearchOutput>> {
        self.entries.get(key)
    }

    pub fn insert(&self, key: CacheKey, output: Arc<SearchOutput>) {
        self.entries.insert(key, output);
    }

    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }
}
