use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::SourcePlugin;
use crate::config::FeedConfig;
use crate::error::SourceFetchError;
use crate::filters::FieldKind;
use crate::model::NewListing;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(600);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source backed by an HTTP endpoint that returns listings as JSON.
///
/// The body is either an array of items or `{"listings": [...]}`. Each item
/// carries `creation_time` (RFC 3339) and optionally `updated_time`; every
/// other key becomes a listing field. Search parameters are sent as the query
/// string.
pub struct JsonFeedPlugin {
    path: String,
    display_name: String,
    poll_interval: Duration,
    fields: Vec<(String, FieldKind)>,
    timeout: Duration,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http { url: String, client: reqwest::Client },
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    creation_time: DateTime<Utc>,
    #[serde(default)]
    updated_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedBody {
    Items(Vec<FeedItem>),
    Wrapped { listings: Vec<FeedItem> },
}

impl JsonFeedPlugin {
    pub fn from_config(cfg: &FeedConfig) -> Self {
        Self {
            path: cfg.path.clone(),
            display_name: cfg.display_name.clone().unwrap_or_else(|| cfg.path.clone()),
            poll_interval: Duration::from_secs(cfg.poll_interval_seconds),
            fields: cfg.fields.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            timeout: Duration::from_secs(cfg.timeout_seconds),
            mode: Mode::Http {
                url: cfg.url.clone(),
                client: reqwest::Client::new(),
            },
        }
    }

    /// Serve a fixed body instead of fetching (tests, demos).
    pub fn from_fixture(path: &str, body: &str) -> Self {
        Self {
            path: path.to_string(),
            display_name: path.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            fields: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            mode: Mode::Fixture(body.to_string()),
        }
    }

    pub fn with_field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push((name.to_string(), kind));
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Per-request timeout for HTTP feeds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch_body(&self, params: &Value) -> Result<String, SourceFetchError> {
        match &self.mode {
            Mode::Fixture(body) => Ok(body.clone()),
            Mode::Http { url, client } => {
                let resp = client
                    .get(url)
                    .query(&query_pairs(params))
                    .timeout(self.timeout)
                    .send()
                    .await?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(SourceFetchError::Status {
                        status: status.as_u16(),
                    });
                }
                Ok(resp.text().await?)
            }
        }
    }
}

/// Top-level scalar parameters become `key=value` pairs; nested values are sent as JSON.
fn query_pairs(params: &Value) -> Vec<(String, String)> {
    let Some(map) = params.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

pub fn parse_feed(
    body: &str,
    after: DateTime<Utc>,
    limit: Option<usize>,
) -> Result<Vec<NewListing>, SourceFetchError> {
    let parsed: FeedBody =
        serde_json::from_str(body).map_err(|e| SourceFetchError::Decode(e.to_string()))?;
    let items = match parsed {
        FeedBody::Items(items) => items,
        FeedBody::Wrapped { listings } => listings,
    };

    let mut out: Vec<NewListing> = items
        .into_iter()
        .filter(|it| it.creation_time > after)
        .map(|it| {
            let listing = NewListing::new(it.creation_time, it.fields);
            match it.updated_time {
                Some(updated) => listing.with_updated_time(updated),
                None => listing,
            }
        })
        .collect();

    // newest first, so a limit keeps the most recent
    out.sort_by(|a, b| b.creation_time.cmp(&a.creation_time));
    if let Some(limit) = limit {
        out.truncate(limit);
    }
    Ok(out)
}

#[async_trait]
impl SourcePlugin for JsonFeedPlugin {
    fn path(&self) -> &str {
        &self.path
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn polling_interval(&self, _params: &Value) -> Duration {
        self.poll_interval
    }

    fn listing_fields(&self) -> Vec<(String, FieldKind)> {
        self.fields.clone()
    }

    async fn fetch_listings(
        &self,
        params: &Value,
        after: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<NewListing>, SourceFetchError> {
        let body = self.fetch_body(params).await?;
        let t0 = Instant::now();
        let listings = parse_feed(&body, after, limit)?;
        histogram!("source_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(listings)
    }
}
