//! Listing notifier binary entrypoint.
//! Restores persisted subscribers, starts polling and notification, and runs
//! until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use listing_notifier::metrics::Metrics;
use listing_notifier::store::{JsonFileConfigStore, MemoryListingStore};
use listing_notifier::{plugins_from_settings, NotifierService, Settings};

/// `LOG_FORMAT=json` switches to structured JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("listing_notifier=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn serve_metrics(addr: String, metrics: Metrics) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding metrics listener on {addr}"))?;
    tracing::info!(%addr, "serving /metrics and /healthz");
    axum::serve(listener, metrics.router())
        .await
        .context("metrics server")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::load_default().context("loading settings")?;
    if settings.disable_search_polling {
        tracing::warn!("search polling is disabled; only stored listings will be delivered");
    }

    if let Some(addr) = settings.metrics_addr.clone() {
        let metrics = Metrics::init()?;
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr, metrics).await {
                tracing::error!(error = ?e, "metrics server stopped");
            }
        });
    }

    let plugins = Arc::new(plugins_from_settings(&settings)?);
    let config_store = Arc::new(
        JsonFileConfigStore::open(&settings.state_path)
            .await
            .with_context(|| format!("opening state at {}", settings.state_path.display()))?,
    );

    let listings = Arc::new(MemoryListingStore::with_retention(settings.listing_retention()));
    let service = NotifierService::build(settings, plugins, listings, config_store);
    service.restore().await?;
    service.start();

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    service.shutdown().await;
    Ok(())
}
