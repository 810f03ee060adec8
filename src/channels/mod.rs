//! Channel abstraction for message I/O.
//!
//! A channel turns transport traffic into `IncomingMessage`s and carries
//! replies back out through a `Delivery`. The engine itself only ever sees
//! `(user_id, text)` pairs.

pub mod cli;
pub mod dispatcher;
pub mod whatsapp;

pub use cli::CliChannel;
pub use dispatcher::Dispatcher;
pub use whatsapp::{WhatsAppChannel, WhatsAppClient};

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use uuid::Uuid;

use crate::error::ChannelError;

/// A message received from a user.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Uuid,
    /// Name of the channel that produced it.
    pub channel: String,
    pub user_id: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
    /// Transport-specific extras (message ids, profile names).
    pub metadata: serde_json::Value,
}

impl IncomingMessage {
    pub fn new(
        channel: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            user_id: user_id.into(),
            content: content.into(),
            received_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// The single reply produced for an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub user_id: String,
    pub text: String,
}

impl OutboundMessage {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
        }
    }
}

pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A source of inbound messages.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Begin receiving. Can only be called once per channel.
    async fn start(&self) -> Result<MessageStream, ChannelError>;
}

/// Sends replies back to users.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, user_id: &str, text: &str) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_message_metadata() {
        let msg = IncomingMessage::new("whatsapp", "919800000001", "hello")
            .with_metadata(serde_json::json!({"wamid": "wamid.abc"}));
        assert_eq!(msg.metadata["wamid"], "wamid.abc");
        assert_eq!(msg.user_id, "919800000001");
    }

    #[test]
    fn incoming_message_without_metadata() {
        let msg = IncomingMessage::new("cli", "local-user", "hi");
        assert!(msg.metadata.get("wamid").is_none());
    }
}
