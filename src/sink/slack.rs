use async_trait::async_trait;
use reqwest::Client;

use super::{DeliverySink, ListingMessage};
use crate::error::DeliveryError;
use crate::model::{ListingRecord, SubscriberId};

pub struct SlackSink {
    webhook_url: String,
    client: Client,
}

impl SlackSink {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: Client::new(),
        }
    }
}

fn slack_text(msg: &ListingMessage) -> String {
    let title = match &msg.url {
        Some(url) => format!("*<{url}|{}>*", msg.title),
        None => format!("*{}*", msg.title),
    };
    format!("{title}\n{}", msg.body())
}

#[async_trait]
impl DeliverySink for SlackSink {
    fn name(&self) -> &str {
        "slack"
    }

    async fn deliver(&self, _subscriber: &SubscriberId, listing: &ListingRecord) -> Result<(), DeliveryError> {
        let body = serde_json::json!({ "text": slack_text(&ListingMessage::from_record(listing)) });

        let rsp = self.client.post(&self.webhook_url).json(&body).send().await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
