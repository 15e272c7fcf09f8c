use crate::render::split::{EditOp, plan_edits};
use anyhow::Result;
use async_trait::async_trait;
use rb_channels::{ChatId, LengthUnit, MessageId, OutboundSender};
use std::sync::Arc;

/// Where a rendered turn goes: one conversation on one channel.
#[async_trait]
pub trait RenderSink: Send + Sync {
    async fn create_message(&self, text: &str) -> Result<MessageId>;

    /// Bring the messages in `ids` from showing `previous` to showing
    /// `current`, creating messages as needed. Returns the full id list.
    async fn edit_messages(
        &self,
        ids: &[MessageId],
        previous: &str,
        current: &str,
    ) -> Result<Vec<MessageId>>;

    async fn send_typing(&self) -> Result<()>;
}

/// [`RenderSink`] over a channel's [`OutboundSender`] for a single chat.
pub struct ChannelSink {
    sender: Arc<dyn OutboundSender>,
    chat_id: ChatId,
    limit: usize,
    unit: LengthUnit,
}

impl ChannelSink {
    /// `limit_override` can only lower the channel's own message limit.
    pub fn new(
        sender: Arc<dyn OutboundSender>,
        chat_id: ChatId,
        limit_override: Option<usize>,
    ) -> Self {
        let limit = match limit_override {
            Some(limit) => limit.min(sender.max_message_len()),
            None => sender.max_message_len(),
        };
        let unit = sender.length_unit();
        Self {
            sender,
            chat_id,
            limit: limit.max(1),
            unit,
        }
    }
}

#[async_trait]
impl RenderSink for ChannelSink {
    async fn create_message(&self, text: &str) -> Result<MessageId> {
        self.sender.create_message(&self.chat_id, text).await
    }

    async fn edit_messages(
        &self,
        ids: &[MessageId],
        previous: &str,
        current: &str,
    ) -> Result<Vec<MessageId>> {
        let mut out = ids.to_vec();
        for op in plan_edits(previous, current, ids.len(), self.limit, self.unit) {
            match op {
                EditOp::Edit { index, text } => {
                    self.sender
                        .edit_message(&self.chat_id, &ids[index], text)
                        .await?;
                }
                EditOp::Create { text } => {
                    let id = match self.sender.create_message(&self.chat_id, text).await {
                        Ok(id) => id,
                        Err(e) => {
                            let orphaned: Vec<&str> =
                                out[ids.len()..].iter().map(MessageId::as_str).collect();
                            if !orphaned.is_empty() {
                                tracing::warn!(
                                    chat_id = %self.chat_id,
                                    orphaned = ?orphaned,
                                    "overflow create failed; earlier overflow messages stay unmapped"
                                );
                            }
                            return Err(e);
                        }
                    };
                    tracing::debug!(
                        message_id = %id,
                        index = out.len(),
                        "overflow message created"
                    );
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    async fn send_typing(&self) -> Result<()> {
        self.sender.send_typing(&self.chat_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingSender, SentOp};

    #[tokio::test]
    async fn unchanged_text_issues_no_network_calls() {
        let sender = Arc::new(RecordingSender::new(4));
        let sink = ChannelSink::new(sender.clone(), "c1".into(), None);
        let ids = vec![MessageId::new("1"), MessageId::new("2")];
        let out = sink
            .edit_messages(&ids, "abcdefg", "abcdefg")
            .await
            .expect("edit");
        assert_eq!(out, ids);
        assert!(sender.ops().is_empty());
    }

    #[tokio::test]
    async fn overflow_creates_and_appends_ids_in_order() {
        let sender = Arc::new(RecordingSender::new(4));
        let sink = ChannelSink::new(sender.clone(), "c1".into(), None);
        let first = sink.create_message("…").await.expect("create");
        let ids = sink
            .edit_messages(std::slice::from_ref(&first), "", "abcdefghij")
            .await
            .expect("edit");
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], first);
        assert_eq!(sender.text_of(&ids[0]).as_deref(), Some("abcd"));
        assert_eq!(sender.text_of(&ids[1]).as_deref(), Some("efgh"));
        assert_eq!(sender.text_of(&ids[2]).as_deref(), Some("ij"));
        assert_eq!(
            sender
                .ops()
                .iter()
                .filter(|op| matches!(op, SentOp::Create { .. }))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn utf16_channel_splits_emoji_text_within_its_limit() {
        let sender = Arc::new(RecordingSender::new(4096).with_unit(LengthUnit::Utf16));
        let sink = ChannelSink::new(sender.clone(), "c1".into(), None);
        let first = sink.create_message("…").await.expect("create");
        let text = "🎉".repeat(4096);
        let ids = sink
            .edit_messages(std::slice::from_ref(&first), "", &text)
            .await
            .expect("edit");
        assert_eq!(ids.len(), 2);
        for id in &ids {
            let shown = sender.text_of(id).expect("text");
            assert_eq!(LengthUnit::Utf16.measure(&shown), 4096);
        }
    }

    #[tokio::test]
    async fn failed_overflow_create_surfaces_the_error() {
        let sender = Arc::new(RecordingSender::new(4).failing_creates_after(2));
        let sink = ChannelSink::new(sender.clone(), "c1".into(), None);
        let first = sink.create_message("…").await.expect("create");
        let err = sink
            .edit_messages(std::slice::from_ref(&first), "", "abcdefghijkl")
            .await
            .expect_err("third create fails");
        assert!(err.to_string().contains("create rejected"));
        assert_eq!(sender.text_of(&first).as_deref(), Some("abcd"));
        assert_eq!(sender.create_count(), 2);
    }

    #[tokio::test]
    async fn limit_override_only_lowers_the_channel_limit() {
        let sender = Arc::new(RecordingSender::new(4));
        assert_eq!(ChannelSink::new(sender.clone(), "c".into(), Some(2)).limit, 2);
        assert_eq!(ChannelSink::new(sender, "c".into(), Some(100)).limit, 4);
    }
}
