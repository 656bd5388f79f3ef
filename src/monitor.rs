//! Deduplicated, reference-counted polling of search specs.
//!
//! One poll job exists per distinct [`SearchSpec`] no matter how many
//! subscribers watch it. Polled listings go to the [`ListingStore`]; readers
//! only ever query the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};

use crate::config::Settings;
use crate::error::{MonitorError, StoreError};
use crate::model::{ListingRecord, SearchSpec, SearchSpecId};
use crate::scheduler::{JobHandle, Scheduler};
use crate::source::PluginRegistry;
use crate::store::ListingStore;

#[derive(Clone)]
pub struct SearchMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    scheduler: Scheduler,
    poller: Arc<Poller>,
    jobs: Mutex<HashMap<SearchSpecId, Monitored>>,
}

struct Monitored {
    handle: JobHandle,
    refs: usize,
}

/// Everything a poll job needs; shared with the job closures so they never
/// keep the monitor itself alive.
struct Poller {
    plugins: Arc<PluginRegistry>,
    store: Arc<dyn ListingStore>,
    backdate: chrono::Duration,
    disabled: bool,
    fetch_limit: Option<usize>,
}

impl SearchMonitor {
    pub fn new(
        scheduler: Scheduler,
        plugins: Arc<PluginRegistry>,
        store: Arc<dyn ListingStore>,
        settings: &Settings,
    ) -> Self {
        let poller = Poller {
            plugins,
            store,
            backdate: settings.backdate(),
            disabled: settings.disable_search_polling,
            fetch_limit: settings.poll_fetch_limit,
        };
        Self {
            inner: Arc::new(MonitorInner {
                scheduler,
                poller: Arc::new(poller),
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.inner.poller.plugins
    }

    /// Start polling `spec`, or add one more reference to its existing job.
    pub fn register_search(&self, spec: &Arc<SearchSpec>) -> Result<(), MonitorError> {
        let mut jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = jobs.get_mut(&spec.id) {
            entry.refs += 1;
            tracing::debug!(search_spec = %spec.id, refs = entry.refs, "search already polled; reusing job");
            return Ok(());
        }

        let plugin = self.inner.poller.plugins.get(&spec.plugin_path)?;
        let interval = plugin.polling_interval(&spec.params);

        let poller = Arc::clone(&self.inner.poller);
        let job_spec = Arc::clone(spec);
        let handle = self.inner.scheduler.add_job(
            format!("poll:{}", spec.id),
            interval,
            true,
            move |_ctx| {
                let poller = Arc::clone(&poller);
                let spec = Arc::clone(&job_spec);
                async move { poller.poll(&spec).await }
            },
        );

        tracing::info!(
            search_spec = %spec.id,
            plugin = %spec.plugin_path,
            interval_secs = interval.as_secs(),
            "scheduled poll job for new search"
        );
        jobs.insert(spec.id.clone(), Monitored { handle, refs: 1 });
        gauge!("monitored_searches").set(jobs.len() as f64);
        Ok(())
    }

    /// Drop one reference; the poll job is cancelled with the last one.
    pub fn remove_search(&self, spec: &SearchSpec) {
        let mut jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = jobs.get_mut(&spec.id) else {
            tracing::warn!(search_spec = %spec.id, "remove_search for a search that is not monitored");
            return;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }
        if let Some(entry) = jobs.remove(&spec.id) {
            entry.handle.cancel();
            tracing::info!(search_spec = %spec.id, "no subscribers left; poll job removed");
        }
        gauge!("monitored_searches").set(jobs.len() as f64);
    }

    /// Stored listings for `spec` created after `after`. Never triggers a poll.
    pub async fn get_listings(
        &self,
        spec: &SearchSpecId,
        after: DateTime<Utc>,
    ) -> Result<Vec<ListingRecord>, StoreError> {
        self.inner.poller.store.get_after(spec, after).await
    }

    /// Run one poll of `spec` outside its schedule.
    pub async fn poll_now(&self, spec: &SearchSpec) {
        self.inner.poller.poll(spec).await
    }

    pub fn job_count(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn ref_count(&self, spec: &SearchSpecId) -> usize {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(spec)
            .map_or(0, |m| m.refs)
    }

    pub fn job_handle(&self, spec: &SearchSpecId) -> Option<JobHandle> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(spec)
            .map(|m| m.handle.clone())
    }

    /// Cancel every poll job this monitor owns and wait for them to stop.
    pub async fn shutdown(&self) {
        let handles: Vec<JobHandle> = {
            let mut jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.drain().map(|(_, m)| m.handle).collect()
        };
        for handle in &handles {
            handle.cancel();
        }
        for handle in &handles {
            handle.stopped().await;
        }
        gauge!("monitored_searches").set(0.0);
        tracing::info!(jobs = handles.len(), "search monitor stopped");
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        let jobs = self.jobs.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, m) in jobs.drain() {
            m.handle.cancel();
        }
    }
}

impl Poller {
    async fn poll(&self, spec: &SearchSpec) {
        if self.disabled {
            tracing::debug!(search_spec = %spec.id, "search polling disabled; skipping poll");
            return;
        }
        counter!("poll_job_executions_total").increment(1);

        let plugin = match self.plugins.get(&spec.plugin_path) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, search_spec = %spec.id, "cannot poll search");
                return;
            }
        };

        let floor = Utc::now() - self.backdate;
        let start = match self.store.get_most_recent(&spec.id).await {
            Ok(Some(last)) => last.creation_time.max(floor),
            Ok(None) => floor,
            Err(e) => {
                tracing::warn!(error = ?e, search_spec = %spec.id, "reading last listing failed; using backdate window");
                floor
            }
        };
        tracing::debug!(search_spec = %spec.id, start = %start, "polling search");

        let fetched = match plugin.fetch_listings(&spec.params, start, self.fetch_limit).await {
            Ok(v) => v,
            Err(e) => {
                counter!("source_errors_total", "plugin" => spec.plugin_path.clone()).increment(1);
                tracing::warn!(error = ?e, provider = %spec.plugin_path, search_spec = %spec.id, "source fetch failed");
                return;
            }
        };

        let stored_at = Utc::now();
        let mut skipped_updates = 0u64;
        let mut records = Vec::with_capacity(fetched.len());
        for listing in fetched {
            if listing.creation_time <= start {
                // republished edit of an already seen listing, or plain overlap
                if listing.is_update() {
                    skipped_updates += 1;
                }
                continue;
            }
            records.push(ListingRecord::from_new(spec.id.clone(), listing, stored_at));
        }

        let count = records.len();
        if let Err(e) = self.store.save(&spec.id, records).await {
            tracing::error!(error = ?e, search_spec = %spec.id, "saving listings failed");
            return;
        }
        counter!("listings_scraped_total").increment(count as u64);
        counter!("listings_skipped_updated_total").increment(skipped_updates);
        tracing::debug!(search_spec = %spec.id, count, skipped_updates, "poll finished");
    }
}
