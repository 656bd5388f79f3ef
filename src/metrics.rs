use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// Register help text for every series the engine emits. Idempotent.
pub fn describe_metrics() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("poll_job_executions_total", "Poll job runs that reached the source.");
        describe_counter!("listings_scraped_total", "Listings stored after a poll.");
        describe_counter!(
            "listings_skipped_updated_total",
            "Re-published edits of already seen listings skipped by polls."
        );
        describe_counter!("source_errors_total", "Failed source fetches, by plugin.");
        describe_counter!("notify_job_executions_total", "Notify job runs.");
        describe_counter!("listings_filtered_out_total", "Listings rejected by subscriber filters.");
        describe_counter!("listings_delivered_total", "Listings accepted by a delivery sink.");
        describe_counter!("delivery_errors_total", "Listings a sink rejected, by sink.");
        describe_counter!(
            "delivery_drained_total",
            "Listings delivered after their notify run was cancelled."
        );
        describe_histogram!("source_parse_ms", "Source payload parse time in milliseconds.");
        describe_gauge!("monitored_searches", "Distinct searches with an active poll job.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide Prometheus recorder.
    pub fn init() -> Result<Self> {
        // Use default buckets to avoid API differences across crate versions.
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        describe_metrics();
        Ok(Self { handle })
    }

    /// Wrap an existing handle (e.g. from a recorder that is not installed globally).
    pub fn from_handle(handle: PrometheusHandle) -> Self {
        Self { handle }
    }

    /// `/metrics` in the Prometheus exposition format, plus `/healthz`.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new()
            .route(
                "/metrics",
                get(move || {
                    let h = handle.clone();
                    async move { h.render() }
                }),
            )
            .route("/healthz", get(|| async { "ok" }))
    }
}
