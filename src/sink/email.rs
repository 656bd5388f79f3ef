use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::{DeliverySink, ListingMessage};
use crate::config::SmtpConfig;
use crate::error::DeliveryError;
use crate::model::{ListingRecord, SubscriberId};

/// One email per listing over an authenticated SMTP relay.
pub struct EmailSink {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailSink {
    pub fn new(smtp: &SmtpConfig, to: &str) -> Result<Self> {
        let creds = Credentials::new(smtp.user.clone(), smtp.pass.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
            .with_context(|| format!("invalid SMTP host {:?}", smtp.host))?
            .credentials(creds)
            .build();

        let from = smtp
            .from
            .parse()
            .with_context(|| format!("invalid sender address {:?}", smtp.from))?;
        let to = to
            .parse()
            .with_context(|| format!("invalid recipient address {to:?}"))?;

        Ok(Self { mailer, from, to })
    }
}

#[async_trait]
impl DeliverySink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, _subscriber: &SubscriberId, listing: &ListingRecord) -> Result<(), DeliveryError> {
        let msg = ListingMessage::from_record(listing);
        let subject = match &msg.price {
            Some(price) => format!("New listing: {} ({price})", msg.title),
            None => format!("New listing: {}", msg.title),
        };

        let email = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(header::ContentType::TEXT_PLAIN)
            .body(msg.body())
            .map_err(|e| DeliveryError::Config(e.to_string()))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| DeliveryError::Smtp(e.to_string()))?;
        Ok(())
    }
}
