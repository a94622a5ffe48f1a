//! Delivery seam. The core only learns success or failure per message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipor_storage::MessageOutbox;
use thiserror::Error;
use tracing::debug;

use crate::digest::OutgoingMessage;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("message has no recipients")]
    NoRecipients,
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), DeliveryError>;
}

/// Queues each message as JSON in a [`MessageOutbox`] for a mail relay to
/// drain.
#[derive(Debug, Clone)]
pub struct OutboxTransport {
    outbox: MessageOutbox,
    clock: fn() -> DateTime<Utc>,
}

impl OutboxTransport {
    pub fn new(outbox: MessageOutbox) -> Self {
        Self {
            outbox,
            clock: Utc::now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn outbox(&self) -> &MessageOutbox {
        &self.outbox
    }
}

#[async_trait]
impl Transport for OutboxTransport {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), DeliveryError> {
        let Some(recipient) = message.recipients.first() else {
            return Err(DeliveryError::NoRecipients);
        };
        let bytes = serde_json::to_vec_pretty(message)
            .map_err(|err| DeliveryError::Io(anyhow::Error::new(err)))?;
        let entry = self.outbox.enqueue((self.clock)(), recipient, &bytes).await?;
        debug!(id = %entry.id, path = %entry.body_path.display(), "queued message in outbox");
        Ok(())
    }
}
