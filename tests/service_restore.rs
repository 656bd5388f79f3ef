// tests/service_restore.rs
mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use common::{listing, registry, RecordingSink, ScriptedSource, PLUGIN};
use listing_notifier::model::ChannelConfig;
use listing_notifier::notifier::NotifierStatus;
use listing_notifier::sink::DeliverySink;
use listing_notifier::store::{ConfigStore, JsonFileConfigStore, MemoryListingStore};
use listing_notifier::{Filter, NotifierService, RuleType, Settings, SubscriberId};

async fn service_at(
    path: &std::path::Path,
    source: Arc<ScriptedSource>,
    listings: Arc<MemoryListingStore>,
    sink: Arc<RecordingSink>,
) -> NotifierService {
    let store = Arc::new(JsonFileConfigStore::open(path).await.unwrap());
    NotifierService::build(Settings::default(), registry(source), listings, store)
        .with_sink_factory(move |_cfg| Ok(sink.clone() as Arc<dyn DeliverySink>))
}

#[tokio::test]
async fn restart_rebuilds_subscribers_searches_and_filters() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("notifier.json");
    let source = Arc::new(ScriptedSource::default());
    let listings = Arc::new(MemoryListingStore::new());

    {
        let svc = service_at(&path, source.clone(), listings.clone(), Arc::new(RecordingSink::default())).await;
        let active = svc
            .create_subscriber(SubscriberId::new("active"), ChannelConfig::Log)
            .await
            .unwrap();
        active
            .create_search("bikes", PLUGIN, &json!({"q": "bikes"}))
            .await
            .unwrap();
        active
            .add_filter(Filter::new("price", RuleType::And, "< 5000"))
            .await
            .unwrap();

        let paused = svc
            .create_subscriber(SubscriberId::new("paused"), ChannelConfig::Log)
            .await
            .unwrap();
        paused
            .create_search("same bikes", PLUGIN, &json!({"q": "bikes"}))
            .await
            .unwrap();
        paused.set_paused(true).await.unwrap();
        svc.shutdown().await;
    }

    source.add("bikes", listing("cheap bike", 900, Utc::now() - Duration::minutes(5)));
    source.add("bikes", listing("dear bike", 9000, Utc::now() - Duration::minutes(4)));

    let sink = Arc::new(RecordingSink::default());
    let svc = service_at(&path, source, listings, sink.clone()).await;
    assert_eq!(svc.restore().await.unwrap(), 2);
    assert_eq!(svc.subscribers().len(), 2);
    // both searches re-registered before anything runs; one shared job
    assert_eq!(svc.monitor().job_count(), 1);
    assert!(!svc.scheduler().is_started());

    let paused = svc.notifier(&SubscriberId::new("paused")).unwrap();
    assert_eq!(paused.status(), NotifierStatus::Paused);
    assert!(paused.job().is_paused());

    let active = svc.notifier(&SubscriberId::new("active")).unwrap();
    let spec = svc
        .catalog()
        .get(&active.search("bikes").unwrap().search_spec_id)
        .unwrap();
    svc.monitor().poll_now(&spec).await;
    let report = active.run_now().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.filtered_out, 1);
    assert_eq!(sink.titles(), vec!["cheap bike"]);

    svc.shutdown().await;
}

#[tokio::test]
async fn removed_subscriber_is_not_restored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notifier.json");
    let source = Arc::new(ScriptedSource::default());
    let listings = Arc::new(MemoryListingStore::new());
    let sink = Arc::new(RecordingSink::default());

    let svc = service_at(&path, source.clone(), listings.clone(), sink.clone()).await;
    let id = SubscriberId::new("gone");
    svc.create_subscriber(id.clone(), ChannelConfig::Log).await.unwrap();
    assert!(svc.create_subscriber(id.clone(), ChannelConfig::Log).await.is_err());
    svc.remove_subscriber(&id).await.unwrap();
    assert!(svc.remove_subscriber(&id).await.is_err());
    svc.shutdown().await;

    let store = JsonFileConfigStore::open(&path).await.unwrap();
    assert!(store.load_subscribers().await.unwrap().is_empty());
}
