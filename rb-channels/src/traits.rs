use crate::types::{ChatId, InboundMessage, LengthUnit, MessageId};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;
}

/// Outbound half of a channel: remote message objects that can be created,
/// edited in place and deleted.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    fn channel_id(&self) -> &str;

    /// Largest text a single remote message can hold, in [`Self::length_unit`].
    fn max_message_len(&self) -> usize;

    fn length_unit(&self) -> LengthUnit {
        LengthUnit::Chars
    }

    async fn create_message(&self, chat_id: &ChatId, text: &str) -> Result<MessageId>;

    /// Replace the text of an existing message. Editing to identical text is
    /// not an error.
    async fn edit_message(&self, chat_id: &ChatId, message_id: &MessageId, text: &str)
    -> Result<()>;

    async fn delete_message(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<()>;

    async fn send_typing(&self, chat_id: &ChatId) -> Result<()>;
}
