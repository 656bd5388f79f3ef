//! Listing source plugins and the registry that resolves them by path.

pub mod json_feed;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{MonitorError, SourceFetchError};
use crate::filters::{FieldKind, FieldSchema};
use crate::model::NewListing;

/// One marketplace integration.
///
/// `fetch_listings` must tolerate overlapping time ranges: the monitor may ask
/// for a start time slightly earlier than what it already stored.
#[async_trait::async_trait]
pub trait SourcePlugin: Send + Sync {
    /// Stable identifier persisted in search specs.
    fn path(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Recommended polling interval for these search parameters.
    fn polling_interval(&self, params: &Value) -> Duration;

    /// Listing fields this source produces, with their filter kinds.
    fn listing_fields(&self) -> Vec<(String, FieldKind)>;

    /// Listings created after `after`, in any order.
    async fn fetch_listings(
        &self,
        params: &Value,
        after: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<NewListing>, SourceFetchError>;
}

/// Explicitly constructed plugin lookup; no global plugin list.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn SourcePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn SourcePlugin>) -> Result<()> {
        let path = plugin.path().to_string();
        if self.plugins.contains_key(&path) {
            bail!("source plugin {path:?} already registered");
        }
        tracing::info!(plugin = %path, name = plugin.display_name(), "registered source plugin");
        self.plugins.insert(path, plugin);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<Arc<dyn SourcePlugin>, MonitorError> {
        self.plugins
            .get(path)
            .cloned()
            .ok_or_else(|| MonitorError::MissingPlugin(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.plugins.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Union of all declared listing fields.
    pub fn field_schema(&self) -> FieldSchema {
        let mut schema = FieldSchema::new();
        for plugin in self.plugins.values() {
            for (name, kind) in plugin.listing_fields() {
                if !schema.declare(name.clone(), kind) {
                    tracing::warn!(
                        plugin = plugin.path(),
                        field = %name,
                        "field declared with a conflicting kind; keeping the first declaration"
                    );
                }
            }
        }
        schema
    }
}
