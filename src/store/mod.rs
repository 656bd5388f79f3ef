//! Listing storage and the search-spec catalog.

pub mod config_store;

pub use config_store::{ConfigStore, JsonFileConfigStore, MemoryConfigStore};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StoreError;
use crate::model::{ListingRecord, SearchSpec, SearchSpecId};

/// Append-only listing storage keyed by search identity.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn save(&self, spec: &SearchSpecId, listings: Vec<ListingRecord>) -> Result<(), StoreError>;

    /// Listings created strictly after `after`, ascending by creation time.
    async fn get_after(
        &self,
        spec: &SearchSpecId,
        after: DateTime<Utc>,
    ) -> Result<Vec<ListingRecord>, StoreError>;

    /// The listing with the latest creation time, if any.
    async fn get_most_recent(&self, spec: &SearchSpecId) -> Result<Option<ListingRecord>, StoreError>;
}

/// In-process listing store.
///
/// With a retention window, each save drops rows created before
/// `now - retention`, except the newest row of the search, which polls
/// resume from.
#[derive(Default)]
pub struct MemoryListingStore {
    inner: RwLock<HashMap<SearchSpecId, Vec<ListingRecord>>>,
    retention: Option<chrono::Duration>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: chrono::Duration) -> Self {
        Self {
            retention: Some(retention),
            ..Self::default()
        }
    }

    pub fn len(&self, spec: &SearchSpecId) -> usize {
        self.inner
            .read()
            .map(|m| m.get(spec).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn save(&self, spec: &SearchSpecId, listings: Vec<ListingRecord>) -> Result<(), StoreError> {
        if listings.is_empty() {
            return Ok(());
        }
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let rows = map.entry(spec.clone()).or_default();
        rows.extend(listings);
        // stable, so equal creation times keep arrival order
        rows.sort_by_key(|r| r.creation_time);
        if let Some(cutoff) = self.retention.and_then(|r| Utc::now().checked_sub_signed(r)) {
            let expired = rows
                .partition_point(|r| r.creation_time < cutoff)
                .min(rows.len().saturating_sub(1));
            if expired > 0 {
                rows.drain(..expired);
                tracing::debug!(search_spec = %spec, expired, kept = rows.len(), "pruned expired listings");
            }
        }
        Ok(())
    }

    async fn get_after(
        &self,
        spec: &SearchSpecId,
        after: DateTime<Utc>,
    ) -> Result<Vec<ListingRecord>, StoreError> {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        Ok(map
            .get(spec)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.creation_time > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_most_recent(&self, spec: &SearchSpecId) -> Result<Option<ListingRecord>, StoreError> {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        Ok(map.get(spec).and_then(|rows| rows.last().cloned()))
    }
}

/// Interns search specs so every subscriber asking for the same
/// (plugin, parameters) pair shares one `Arc<SearchSpec>`.
#[derive(Default)]
pub struct SearchSpecCatalog {
    specs: RwLock<HashMap<SearchSpecId, Arc<SearchSpec>>>,
}

impl SearchSpecCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared spec and whether it was newly created.
    pub fn intern(&self, plugin_path: &str, params: &Value) -> (Arc<SearchSpec>, bool) {
        let candidate = SearchSpec::new(plugin_path, params);
        let mut specs = self.specs.write().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = specs.get(&candidate.id) {
            return (existing.clone(), false);
        }
        let spec = Arc::new(candidate);
        specs.insert(spec.id.clone(), spec.clone());
        (spec, true)
    }

    /// Adds a previously persisted spec; an existing entry wins.
    pub fn insert(&self, spec: SearchSpec) -> Arc<SearchSpec> {
        let mut specs = self.specs.write().unwrap_or_else(|p| p.into_inner());
        specs
            .entry(spec.id.clone())
            .or_insert_with(|| Arc::new(spec))
            .clone()
    }

    pub fn get(&self, id: &SearchSpecId) -> Option<Arc<SearchSpec>> {
        self.specs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.specs.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
