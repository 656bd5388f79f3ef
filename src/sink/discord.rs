use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{DeliverySink, ListingMessage};
use crate::error::DeliveryError;
use crate::model::{ListingRecord, SubscriberId};

const MAX_RETRIES: u8 = 8;

/// Posts each listing as a Discord webhook embed.
#[derive(Clone)]
pub struct DiscordSink {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl DiscordSink {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// Attempts per listing, clamped to `1..=8`.
    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.clamp(1, MAX_RETRIES);
        self
    }

    /// 500ms doubling per attempt.
    fn backoff_delay(attempt: u8) -> Duration {
        let shift = u32::from(attempt.saturating_sub(1).min(MAX_RETRIES));
        Duration::from_millis(500u64 << shift)
    }

    async fn backoff(attempt: u8) {
        tokio::time::sleep(Self::backoff_delay(attempt)).await;
    }
}

#[async_trait]
impl DeliverySink for DiscordSink {
    fn name(&self) -> &str {
        "discord"
    }

    async fn deliver(&self, _subscriber: &SubscriberId, listing: &ListingRecord) -> Result<(), DeliveryError> {
        let payload = DiscordWebhookPayload::from_message(&ListingMessage::from_record(listing));

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            match res {
                Ok(rsp) => {
                    let status = rsp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if attempt < self.max_retries {
                        Self::backoff(attempt).await;
                        continue;
                    }
                    return Err(DeliveryError::Status {
                        status: status.as_u16(),
                    });
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        Self::backoff(attempt).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct DiscordWebhookPayload {
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn from_message(msg: &ListingMessage) -> Self {
        // Discord caps embed titles at 256 chars
        let title: String = msg.title.chars().take(256).collect();
        Self {
            content: None,
            embeds: vec![DiscordEmbed {
                title,
                description: msg.body(),
                url: msg.url.clone(),
                timestamp: msg.updated.unwrap_or(msg.created).to_rfc3339(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn retries_are_clamped_and_backoff_is_bounded() {
        let sink = DiscordSink::new("https://discord.invalid/hook".into());
        assert_eq!(sink.clone().with_retries(0).max_retries, 1);
        assert_eq!(sink.clone().with_retries(200).max_retries, MAX_RETRIES);
        assert_eq!(DiscordSink::backoff_delay(1), Duration::from_millis(500));
        assert_eq!(DiscordSink::backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(DiscordSink::backoff_delay(u8::MAX), DiscordSink::backoff_delay(MAX_RETRIES + 1));
    }

    #[test]
    fn payload_is_a_single_embed() {
        let msg = ListingMessage {
            title: "x".repeat(300),
            url: Some("https://example.org/1".into()),
            price: Some("$100".into()),
            location: None,
            created: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            updated: None,
        };
        let payload = serde_json::to_value(DiscordWebhookPayload::from_message(&msg)).unwrap();
        let embeds = payload["embeds"].as_array().unwrap();
        assert_eq!(embeds.len(), 1);
        assert_eq!(embeds[0]["title"].as_str().unwrap().len(), 256);
        assert_eq!(embeds[0]["url"], "https://example.org/1");
        assert!(payload["content"].is_null());
    }
}
