//! Per-subscriber notification.
//!
//! A [`ListingNotifier`] owns one recurring notify job. Each run reads new
//! listings for every active search from the monitor, commits the search
//! watermarks, then filters, orders and delivers. Watermarks advance before
//! delivery, so a crash mid-run skips rather than repeats those listings.

pub mod delivery;

pub use delivery::{DeliveryBatch, DeliveryReport};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;

use crate::error::{NotifierError, StoreError};
use crate::filters::{CompiledFilter, FieldSchema, FilterSet};
use crate::model::{
    Filter, FilterId, ListingRecord, NotifierSearch, SearchId, SearchSpec, SearchSpecId,
    SubscriberConfig, SubscriberId,
};
use crate::monitor::SearchMonitor;
use crate::scheduler::{JobContext, JobHandle, Scheduler};
use crate::sink::DeliverySink;
use crate::store::{ConfigStore, SearchSpecCatalog};

/// Shared services every notifier is built from.
#[derive(Clone)]
pub struct NotifierDeps {
    pub scheduler: Scheduler,
    pub monitor: SearchMonitor,
    pub catalog: Arc<SearchSpecCatalog>,
    pub config_store: Arc<dyn ConfigStore>,
    pub schema: Arc<FieldSchema>,
    pub backdate: chrono::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierStatus {
    Active,
    Paused,
    Closed,
}

impl fmt::Display for NotifierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotifierStatus::Active => "active",
            NotifierStatus::Paused => "paused",
            NotifierStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
pub struct ListingNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    id: SubscriberId,
    deps: NotifierDeps,
    sink: Arc<dyn DeliverySink>,
    job: JobHandle,
    state: Mutex<State>,
    /// Serializes notify runs (scheduled and manual).
    run_lock: tokio::sync::Mutex<()>,
    /// Orders config writes so the last write is the latest snapshot.
    persist_lock: tokio::sync::Mutex<()>,
}

struct State {
    config: SubscriberConfig,
    /// Compiled on first use, dropped whenever the filter list changes.
    filters: Option<FilterSet>,
    closed: bool,
}

fn frequency(seconds: u64) -> Duration {
    Duration::from_secs(seconds.max(1))
}

impl ListingNotifier {
    /// Re-register every active search with the monitor and schedule the
    /// notify job (suspended when the config is paused).
    pub fn new(
        deps: NotifierDeps,
        config: SubscriberConfig,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self, NotifierError> {
        let mut registered: Vec<Arc<SearchSpec>> = Vec::with_capacity(config.active_searches.len());
        for search in &config.active_searches {
            let result = deps
                .catalog
                .get(&search.search_spec_id)
                .ok_or_else(|| NotifierError::UnknownSearchSpec(search.search_spec_id.to_string()))
                .and_then(|spec| {
                    deps.monitor.register_search(&spec)?;
                    Ok(spec)
                });
            match result {
                Ok(spec) => registered.push(spec),
                Err(e) => {
                    for spec in &registered {
                        deps.monitor.remove_search(spec);
                    }
                    return Err(e);
                }
            }
        }

        let id = config.id.clone();
        let paused = config.paused;
        let interval = frequency(config.notification_frequency_seconds);
        let scheduler = deps.scheduler.clone();

        let inner = Arc::new_cyclic(|weak: &Weak<NotifierInner>| {
            let weak = weak.clone();
            let job = scheduler.add_paused_job(format!("notify:{id}"), interval, true, move |ctx| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.run(ctx).await;
                    }
                }
            });
            NotifierInner {
                id: id.clone(),
                deps,
                sink,
                job,
                state: Mutex::new(State {
                    config,
                    filters: None,
                    closed: false,
                }),
                run_lock: tokio::sync::Mutex::new(()),
                persist_lock: tokio::sync::Mutex::new(()),
            }
        });
        if !paused {
            inner.job.resume();
        }

        tracing::debug!(
            subscriber = %id,
            searches = registered.len(),
            paused,
            "notifier initialized"
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> &SubscriberId {
        &self.inner.id
    }

    pub fn job(&self) -> &JobHandle {
        &self.inner.job
    }

    pub fn status(&self) -> NotifierStatus {
        let state = self.inner.lock();
        if state.closed {
            NotifierStatus::Closed
        } else if state.config.paused {
            NotifierStatus::Paused
        } else {
            NotifierStatus::Active
        }
    }

    /// Copy of the current configuration.
    pub fn config(&self) -> SubscriberConfig {
        self.inner.lock().config.clone()
    }

    pub fn search(&self, name: &str) -> Option<NotifierSearch> {
        self.inner.lock().config.search_named(name).cloned()
    }

    /// Add a search named `name`. Recent history (the backdate window) is
    /// surfaced on the next run.
    pub async fn create_search(
        &self,
        name: &str,
        plugin_path: &str,
        params: &Value,
    ) -> Result<NotifierSearch, NotifierError> {
        self.inner.ensure_open()?;
        if self.search(name).is_some() {
            return Err(NotifierError::DuplicateSearch(name.to_string()));
        }
        self.inner.deps.monitor.plugins().get(plugin_path)?;

        let spec = self.inner.intern(plugin_path, params).await?;
        if let Some(existing) = self.inner.watching(&spec.id) {
            return Err(NotifierError::AlreadyWatched(existing));
        }
        self.inner.deps.monitor.register_search(&spec)?;

        let search = NotifierSearch {
            id: SearchId::new(),
            subscriber_id: self.inner.id.clone(),
            name: name.to_string(),
            search_spec_id: spec.id.clone(),
            last_notified: Utc::now() - self.inner.deps.backdate,
        };
        let rejected = {
            let mut state = self.inner.lock();
            if state.closed {
                Some(NotifierError::Closed)
            } else if state.config.search_named(name).is_some() {
                Some(NotifierError::DuplicateSearch(name.to_string()))
            } else if let Some(existing) = state.config.search_watching(&spec.id) {
                Some(NotifierError::AlreadyWatched(existing.name.clone()))
            } else {
                state.config.active_searches.push(search.clone());
                None
            }
        };
        if let Some(err) = rejected {
            self.inner.deps.monitor.remove_search(&spec);
            return Err(err);
        }
        tracing::info!(subscriber = %self.inner.id, search = name, search_spec = %spec.id, "search created");
        self.inner.persist().await?;
        Ok(search)
    }

    pub async fn remove_search(&self, name: &str) -> Result<(), NotifierError> {
        self.inner.ensure_open()?;
        let removed = {
            let mut state = self.inner.lock();
            let pos = state
                .config
                .active_searches
                .iter()
                .position(|s| s.name == name)
                .ok_or_else(|| NotifierError::UnknownSearch(name.to_string()))?;
            state.config.active_searches.remove(pos)
        };
        if let Some(spec) = self.inner.deps.catalog.get(&removed.search_spec_id) {
            self.inner.deps.monitor.remove_search(&spec);
        }
        tracing::info!(subscriber = %self.inner.id, search = name, "search removed");
        self.inner.persist().await?;
        Ok(())
    }

    /// Point a search at new parameters on the same plugin, keeping its watermark.
    pub async fn update_search(&self, name: &str, params: &Value) -> Result<(), NotifierError> {
        self.inner.ensure_open()?;
        let current = self
            .search(name)
            .ok_or_else(|| NotifierError::UnknownSearch(name.to_string()))?;
        let old_spec = self
            .inner
            .deps
            .catalog
            .get(&current.search_spec_id)
            .ok_or_else(|| NotifierError::UnknownSearchSpec(current.search_spec_id.to_string()))?;

        let new_spec = self.inner.intern(&old_spec.plugin_path, params).await?;
        if new_spec.id == old_spec.id {
            return Ok(());
        }
        if let Some(existing) = self.inner.watching(&new_spec.id) {
            return Err(NotifierError::AlreadyWatched(existing));
        }
        // register first so a shared poll job is never torn down in between
        self.inner.deps.monitor.register_search(&new_spec)?;
        let swapped = {
            let mut state = self.inner.lock();
            if let Some(existing) = state.config.search_watching(&new_spec.id) {
                Err(NotifierError::AlreadyWatched(existing.name.clone()))
            } else {
                match state.config.active_searches.iter_mut().find(|s| s.id == current.id) {
                    Some(search) => {
                        search.search_spec_id = new_spec.id.clone();
                        Ok(())
                    }
                    None => Err(NotifierError::UnknownSearch(name.to_string())),
                }
            }
        };
        if let Err(err) = swapped {
            self.inner.deps.monitor.remove_search(&new_spec);
            return Err(err);
        }
        self.inner.deps.monitor.remove_search(&old_spec);
        tracing::info!(
            subscriber = %self.inner.id,
            search = name,
            from = %old_spec.id,
            to = %new_spec.id,
            "search updated"
        );
        self.inner.persist().await?;
        Ok(())
    }

    /// Validate, compile and attach a filter. Rule errors surface here.
    pub async fn add_filter(&self, filter: Filter) -> Result<FilterId, NotifierError> {
        self.inner.ensure_open()?;
        CompiledFilter::compile(&filter, &self.inner.deps.schema)?;
        let id = filter.id;
        {
            let mut state = self.inner.lock();
            state.config.filters.push(filter);
            state.filters = None;
        }
        self.inner.persist().await?;
        Ok(id)
    }

    pub async fn update_filter(&self, id: FilterId, rule_expr: &str) -> Result<(), NotifierError> {
        self.inner.ensure_open()?;
        let mut candidate = self
            .inner
            .lock()
            .config
            .filters
            .iter()
            .find(|f| f.id == id)
            .cloned()
            .ok_or_else(|| NotifierError::UnknownFilter(id.to_string()))?;
        candidate.rule_expr = rule_expr.to_string();
        CompiledFilter::compile(&candidate, &self.inner.deps.schema)?;
        {
            let mut state = self.inner.lock();
            let slot = state
                .config
                .filters
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or_else(|| NotifierError::UnknownFilter(id.to_string()))?;
            *slot = candidate;
            state.filters = None;
        }
        self.inner.persist().await?;
        Ok(())
    }

    pub async fn remove_filter(&self, id: FilterId) -> Result<(), NotifierError> {
        self.inner.ensure_open()?;
        {
            let mut state = self.inner.lock();
            let before = state.config.filters.len();
            state.config.filters.retain(|f| f.id != id);
            if state.config.filters.len() == before {
                return Err(NotifierError::UnknownFilter(id.to_string()));
            }
            state.filters = None;
        }
        self.inner.persist().await?;
        Ok(())
    }

    /// Suspend or resume the notify job; schedule and watermarks are kept.
    pub async fn set_paused(&self, paused: bool) -> Result<(), NotifierError> {
        self.inner.ensure_open()?;
        self.inner.lock().config.paused = paused;
        if paused {
            self.inner.job.pause();
        } else {
            self.inner.job.resume();
        }
        tracing::info!(subscriber = %self.inner.id, paused, "notifier pause state changed");
        self.inner.persist().await?;
        Ok(())
    }

    pub async fn set_notification_frequency(&self, seconds: u64) -> Result<(), NotifierError> {
        self.inner.ensure_open()?;
        if seconds == 0 {
            return Err(NotifierError::InvalidFrequency);
        }
        self.inner.lock().config.notification_frequency_seconds = seconds;
        self.inner.job.reschedule(frequency(seconds));
        self.inner.persist().await?;
        Ok(())
    }

    /// Run the notify body now, outside the schedule. Cancelling the job
    /// interrupts this run the same way it interrupts a scheduled one.
    pub async fn run_now(&self) -> DeliveryReport {
        self.inner.run(self.inner.job.context()).await
    }

    /// Terminal: stop the notify job (draining any in-flight delivery) and
    /// release every search. Idempotent.
    pub async fn close(&self) {
        let searches = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.config.active_searches.clone()
        };
        self.inner.job.cancel_and_wait().await;
        for search in &searches {
            if let Some(spec) = self.inner.deps.catalog.get(&search.search_spec_id) {
                self.inner.deps.monitor.remove_search(&spec);
            }
        }
        tracing::info!(subscriber = %self.inner.id, "notifier closed");
    }
}

impl NotifierInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Name of the search already bound to `spec`.
    fn watching(&self, spec: &SearchSpecId) -> Option<String> {
        self.lock().config.search_watching(spec).map(|s| s.name.clone())
    }

    fn ensure_open(&self) -> Result<(), NotifierError> {
        if self.is_closed() {
            Err(NotifierError::Closed)
        } else {
            Ok(())
        }
    }

    async fn intern(&self, plugin_path: &str, params: &Value) -> Result<Arc<SearchSpec>, StoreError> {
        let (spec, created) = self.deps.catalog.intern(plugin_path, params);
        if created {
            self.deps.config_store.upsert_search_spec(&spec).await?;
        }
        Ok(spec)
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _ordered = self.persist_lock.lock().await;
        let snapshot = self.lock().config.clone();
        self.deps.config_store.save_subscriber(&snapshot).await
    }

    fn filter_set(&self) -> FilterSet {
        let mut state = self.lock();
        if let Some(set) = &state.filters {
            return set.clone();
        }
        let set = FilterSet::compile_lenient(&state.config.filters, &self.deps.schema);
        state.filters = Some(set.clone());
        set
    }

    async fn run(&self, ctx: JobContext) -> DeliveryReport {
        let _running = self.run_lock.lock().await;
        counter!("notify_job_executions_total").increment(1);

        let searches: Vec<(SearchId, SearchSpecId, DateTime<Utc>)> = {
            let state = self.lock();
            if state.closed {
                return DeliveryReport::default();
            }
            state
                .config
                .active_searches
                .iter()
                .map(|s| (s.id, s.search_spec_id.clone(), s.last_notified))
                .collect()
        };
        tracing::debug!(subscriber = %self.id, searches = searches.len(), "running notifier");

        // Phase 1: nothing is committed until every search has been read, so
        // a cancel here simply defers these listings to a later run.
        let fetched = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                tracing::debug!(subscriber = %self.id, "cancelled before listings were fetched");
                return DeliveryReport { cancelled: true, ..DeliveryReport::default() };
            }
            fetched = self.fetch(&searches) => fetched,
        };
        if fetched.is_empty() {
            return DeliveryReport::default();
        }

        self.commit_watermarks(&fetched).await;

        let listings: Vec<ListingRecord> = fetched.into_values().flatten().collect();
        let batch = DeliveryBatch::select(listings, &self.filter_set());
        tracing::debug!(
            subscriber = %self.id,
            selected = batch.len(),
            "notifying subscriber of selected listings"
        );

        // Phase 2
        batch.deliver(&self.id, self.sink.as_ref(), &ctx).await
    }

    async fn fetch(
        &self,
        searches: &[(SearchId, SearchSpecId, DateTime<Utc>)],
    ) -> HashMap<SearchId, Vec<ListingRecord>> {
        let mut out = HashMap::new();
        for (search_id, spec_id, after) in searches {
            match self.deps.monitor.get_listings(spec_id, *after).await {
                Ok(listings) if !listings.is_empty() => {
                    out.insert(*search_id, listings);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = ?e, subscriber = %self.id, search_spec = %spec_id, "reading listings failed");
                }
            }
        }
        out
    }

    async fn commit_watermarks(&self, fetched: &HashMap<SearchId, Vec<ListingRecord>>) {
        let advanced = {
            let mut state = self.lock();
            let mut advanced = 0usize;
            for search in state.config.active_searches.iter_mut() {
                let latest = fetched
                    .get(&search.id)
                    .and_then(|ls| ls.iter().map(|l| l.creation_time).max());
                if let Some(latest) = latest {
                    if search.advance_watermark(latest) {
                        tracing::debug!(search = %search.name, last_notified = %latest, "watermark advanced");
                        advanced += 1;
                    }
                }
            }
            advanced
        };
        if advanced > 0 {
            if let Err(e) = self.persist().await {
                tracing::error!(error = ?e, subscriber = %self.id, "persisting watermarks failed");
            }
        }
    }
}

impl Drop for NotifierInner {
    fn drop(&mut self) {
        self.job.cancel();
    }
}
