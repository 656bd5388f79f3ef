// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod error;
pub mod filters;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod notifier;
pub mod rules;
pub mod scheduler;
pub mod service;
pub mod sink;
pub mod source;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::config::Settings;
pub use crate::error::{DeliveryError, FilterError, MonitorError, NotifierError, SourceFetchError, StoreError};
pub use crate::model::{Filter, ListingRecord, NotifierSearch, RuleType, SearchSpec, SubscriberConfig, SubscriberId};
pub use crate::monitor::SearchMonitor;
pub use crate::notifier::{DeliveryReport, ListingNotifier};
pub use crate::rules::ParseError;
pub use crate::service::NotifierService;

use std::sync::Arc;

use anyhow::Result;

use crate::source::{json_feed::JsonFeedPlugin, PluginRegistry};

/// Registry with one JSON-feed plugin per configured feed.
pub fn plugins_from_settings(settings: &Settings) -> Result<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    for feed in &settings.feeds {
        registry.register(Arc::new(JsonFeedPlugin::from_config(feed)))?;
    }
    Ok(registry)
}
