//! Subscriber lifecycle and crash recovery.
//!
//! [`NotifierService::restore`] rebuilds every persisted subscriber while the
//! scheduler is still held; [`NotifierService::start`] then releases all poll
//! and notify jobs together, so no notify job fires before its searches are
//! registered again.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};

use crate::config::Settings;
use crate::model::{ChannelConfig, SubscriberConfig, SubscriberId};
use crate::monitor::SearchMonitor;
use crate::notifier::{ListingNotifier, NotifierDeps};
use crate::scheduler::Scheduler;
use crate::sink::{self, DeliverySink};
use crate::source::PluginRegistry;
use crate::store::{ConfigStore, ListingStore, SearchSpecCatalog};

type SinkFactory = Arc<dyn Fn(&SubscriberConfig) -> Result<Arc<dyn DeliverySink>> + Send + Sync>;

pub struct NotifierService {
    deps: NotifierDeps,
    settings: Settings,
    sink_factory: SinkFactory,
    notifiers: Mutex<BTreeMap<SubscriberId, ListingNotifier>>,
}

impl NotifierService {
    /// Wire a scheduler (held), monitor and catalog around the given stores.
    pub fn build(
        settings: Settings,
        plugins: Arc<PluginRegistry>,
        listings: Arc<dyn ListingStore>,
        config_store: Arc<dyn ConfigStore>,
    ) -> Self {
        let scheduler = Scheduler::new();
        let schema = Arc::new(plugins.field_schema());
        let monitor = SearchMonitor::new(scheduler.clone(), plugins, listings, &settings);
        let deps = NotifierDeps {
            scheduler,
            monitor,
            catalog: Arc::new(SearchSpecCatalog::new()),
            config_store,
            schema,
            backdate: settings.backdate(),
        };
        let sink_settings = settings.clone();
        Self {
            deps,
            settings,
            sink_factory: Arc::new(move |cfg: &SubscriberConfig| sink::build(&cfg.channel, &sink_settings)),
            notifiers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Replace how sinks are built from subscriber configs.
    pub fn with_sink_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&SubscriberConfig) -> Result<Arc<dyn DeliverySink>> + Send + Sync + 'static,
    {
        self.sink_factory = Arc::new(factory);
        self
    }

    pub fn monitor(&self) -> &SearchMonitor {
        &self.deps.monitor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.deps.scheduler
    }

    pub fn catalog(&self) -> &Arc<SearchSpecCatalog> {
        &self.deps.catalog
    }

    fn notifiers(&self) -> std::sync::MutexGuard<'_, BTreeMap<SubscriberId, ListingNotifier>> {
        self.notifiers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuild persisted subscribers. Returns how many were restored;
    /// subscribers that cannot be rebuilt are logged and skipped.
    pub async fn restore(&self) -> Result<usize> {
        let store = &self.deps.config_store;
        let specs = store.load_search_specs().await.context("loading search specs")?;
        for spec in specs {
            self.deps.catalog.insert(spec);
        }

        let configs = store.load_subscribers().await.context("loading subscribers")?;
        let mut restored = 0;
        for cfg in configs {
            let id = cfg.id.clone();
            let notifier = (self.sink_factory)(&cfg).and_then(|sink| {
                ListingNotifier::new(self.deps.clone(), cfg, sink).map_err(anyhow::Error::from)
            });
            match notifier {
                Ok(notifier) => {
                    self.notifiers().insert(id, notifier);
                    restored += 1;
                }
                Err(e) => {
                    tracing::error!(error = ?e, subscriber = %id, "could not restore subscriber");
                }
            }
        }
        tracing::info!(restored, searches = self.deps.monitor.job_count(), "restored subscribers");
        Ok(restored)
    }

    /// Release all held jobs.
    pub fn start(&self) {
        self.deps.scheduler.start();
    }

    pub async fn create_subscriber(&self, id: SubscriberId, channel: ChannelConfig) -> Result<ListingNotifier> {
        if self.notifiers().contains_key(&id) {
            bail!("subscriber {id} already exists");
        }
        let mut cfg = SubscriberConfig::new(id.clone(), self.settings.notification_frequency_seconds);
        cfg.channel = channel;

        let sink = (self.sink_factory)(&cfg).with_context(|| format!("building sink for {id}"))?;
        self.deps
            .config_store
            .save_subscriber(&cfg)
            .await
            .context("saving new subscriber")?;
        let notifier = ListingNotifier::new(self.deps.clone(), cfg, sink)?;

        let duplicate = {
            let mut notifiers = self.notifiers();
            if notifiers.contains_key(&id) {
                true
            } else {
                notifiers.insert(id.clone(), notifier.clone());
                false
            }
        };
        if duplicate {
            notifier.close().await;
            bail!("subscriber {id} already exists");
        }
        tracing::info!(subscriber = %id, "subscriber created");
        Ok(notifier)
    }

    pub fn notifier(&self, id: &SubscriberId) -> Option<ListingNotifier> {
        self.notifiers().get(id).cloned()
    }

    pub fn subscribers(&self) -> Vec<SubscriberId> {
        self.notifiers().keys().cloned().collect()
    }

    /// Close the subscriber's notifier and forget its configuration.
    pub async fn remove_subscriber(&self, id: &SubscriberId) -> Result<()> {
        let notifier = self.notifiers().remove(id);
        let Some(notifier) = notifier else {
            bail!("unknown subscriber {id}");
        };
        notifier.close().await;
        self.deps
            .config_store
            .delete_subscriber(id)
            .await
            .context("deleting subscriber config")?;
        tracing::info!(subscriber = %id, "subscriber removed");
        Ok(())
    }

    /// Close every notifier (finishing in-flight deliveries), then stop polling.
    pub async fn shutdown(&self) {
        let notifiers: Vec<ListingNotifier> = {
            let mut map = self.notifiers();
            std::mem::take(&mut *map).into_values().collect()
        };
        for notifier in &notifiers {
            notifier.close().await;
        }
        self.deps.monitor.shutdown().await;
        self.deps.scheduler.shutdown().await;
        tracing::info!(subscribers = notifiers.len(), "notifier service stopped");
    }
}
