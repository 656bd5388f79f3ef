//! Delivery sinks: where a subscriber's listings end up.

pub mod discord;
pub mod email;
pub mod slack;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::Settings;
use crate::error::DeliveryError;
use crate::model::{ChannelConfig, ListingRecord, SubscriberId};

pub use discord::DiscordSink;
pub use email::EmailSink;
pub use slack::SlackSink;

/// Called once per delivered listing, in order. The core never batches.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, subscriber: &SubscriberId, listing: &ListingRecord) -> Result<(), DeliveryError>;
}

/// Human-readable view of a listing payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingMessage {
    pub title: String,
    pub url: Option<String>,
    pub price: Option<String>,
    pub location: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
}

impl ListingMessage {
    pub fn from_record(record: &ListingRecord) -> Self {
        let text = |name: &str| record.field(name).map(display_value);
        Self {
            title: text("title").unwrap_or_else(|| "(untitled listing)".to_string()),
            url: text("url"),
            price: record.field("price").map(|v| match v {
                Value::Number(n) => format!("${n}"),
                other => display_value(other),
            }),
            location: text("location"),
            created: record.creation_time,
            updated: (record.updated_time > record.creation_time).then_some(record.updated_time),
        }
    }

    /// Multi-line plain text body.
    pub fn body(&self) -> String {
        let mut lines = Vec::new();
        if let Some(price) = &self.price {
            lines.push(format!("Price: {price}"));
        }
        if let Some(location) = &self.location {
            lines.push(format!("Location: {location}"));
        }
        lines.push(format!("Posted: {}", self.created.format("%Y-%m-%d %H:%M UTC")));
        if let Some(updated) = self.updated {
            lines.push(format!("Updated: {}", updated.format("%Y-%m-%d %H:%M UTC")));
        }
        if let Some(url) = &self.url {
            lines.push(url.clone());
        }
        lines.join("\n")
    }
}

fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Writes each listing to the log. Default channel.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, subscriber: &SubscriberId, listing: &ListingRecord) -> Result<(), DeliveryError> {
        let msg = ListingMessage::from_record(listing);
        tracing::info!(
            subscriber = %subscriber,
            search_spec = %listing.search_spec_id,
            title = %msg.title,
            price = msg.price.as_deref().unwrap_or("-"),
            created = %msg.created,
            "new listing"
        );
        Ok(())
    }
}

/// Construct the sink for a subscriber's channel.
pub fn build(channel: &ChannelConfig, settings: &Settings) -> Result<Arc<dyn DeliverySink>> {
    let sink: Arc<dyn DeliverySink> = match channel {
        ChannelConfig::Log => Arc::new(LogSink),
        ChannelConfig::Discord { webhook_url } => Arc::new(DiscordSink::new(webhook_url.clone())),
        ChannelConfig::Slack { webhook_url } => Arc::new(SlackSink::new(webhook_url.clone())),
        ChannelConfig::Email { to } => {
            let smtp = settings
                .smtp
                .as_ref()
                .ok_or_else(|| anyhow!("email channel requires [smtp] settings"))?;
            Arc::new(EmailSink::new(smtp, to)?)
        }
    };
    Ok(sink)
}
