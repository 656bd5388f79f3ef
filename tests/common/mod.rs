// tests/common/mod.rs
// Shared doubles: a scripted listing source and a recording sink.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use listing_notifier::error::{DeliveryError, SourceFetchError};
use listing_notifier::filters::FieldKind;
use listing_notifier::model::NewListing;
use listing_notifier::scheduler::JobHandle;
use listing_notifier::sink::DeliverySink;
use listing_notifier::source::{PluginRegistry, SourcePlugin};
use listing_notifier::{ListingRecord, SubscriberId};

pub const PLUGIN: &str = "feeds.scripted";

/// Serves canned listings per `q` parameter.
#[derive(Default)]
pub struct ScriptedSource {
    by_query: Mutex<HashMap<String, Vec<NewListing>>>,
    pub calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn add(&self, query: &str, listing: NewListing) {
        self.by_query
            .lock()
            .unwrap()
            .entry(query.to_string())
            .or_default()
            .push(listing);
    }
}

#[async_trait]
impl SourcePlugin for ScriptedSource {
    fn path(&self) -> &str {
        PLUGIN
    }

    fn display_name(&self) -> &str {
        "Scripted"
    }

    fn polling_interval(&self, _params: &Value) -> Duration {
        Duration::from_secs(600)
    }

    fn listing_fields(&self) -> Vec<(String, FieldKind)> {
        vec![
            ("title".to_string(), FieldKind::String),
            ("price".to_string(), FieldKind::Numeric),
        ]
    }

    async fn fetch_listings(
        &self,
        params: &Value,
        after: DateTime<Utc>,
        _limit: Option<usize>,
    ) -> Result<Vec<NewListing>, SourceFetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let q = params["q"].as_str().unwrap_or_default();
        Ok(self
            .by_query
            .lock()
            .unwrap()
            .get(q)
            .map(|ls| ls.iter().filter(|l| l.creation_time > after).cloned().collect())
            .unwrap_or_default())
    }
}

pub fn registry(source: Arc<ScriptedSource>) -> Arc<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    registry.register(source).unwrap();
    Arc::new(registry)
}

pub fn listing(title: &str, price: i64, created: DateTime<Utc>) -> NewListing {
    let mut fields = Map::new();
    fields.insert("title".into(), json!(title));
    fields.insert("price".into(), json!(price));
    NewListing::new(created, fields)
}

/// Records delivered titles; optionally cancels a job after the n-th delivery.
#[derive(Default)]
pub struct RecordingSink {
    pub seen: Mutex<Vec<String>>,
    cancel_after: Option<usize>,
    job: OnceLock<JobHandle>,
}

impl RecordingSink {
    pub fn cancelling_after(n: usize) -> Self {
        Self {
            cancel_after: Some(n),
            ..Self::default()
        }
    }

    pub fn arm(&self, job: JobHandle) {
        let _ = self.job.set(job);
    }

    pub fn titles(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, _subscriber: &SubscriberId, listing: &ListingRecord) -> Result<(), DeliveryError> {
        let n = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(listing.fields["title"].as_str().unwrap_or_default().to_string());
            seen.len()
        };
        if self.cancel_after == Some(n) {
            if let Some(job) = self.job.get() {
                job.cancel();
            }
        }
        // give the cancellation a chance to be observed mid-batch
        tokio::task::yield_now().await;
        Ok(())
    }
}
