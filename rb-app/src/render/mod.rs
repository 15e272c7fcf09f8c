//! Streaming renderer: turns an unbounded token stream into a bounded,
//! rate-limited sequence of message edits.

mod sink;
mod split;

pub use sink::{ChannelSink, RenderSink};

use futures_util::StreamExt;
use rb_channels::MessageId;
use rb_llm::{LlmError, Token, TokenStream};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Telegram's typing status lasts about five seconds.
const TYPING_REFRESH_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("generation failed: {0}")]
    Generation(#[source] LlmError),

    #[error("outbound sink failed: {0}")]
    Sink(#[source] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub min_edit_interval: Duration,
    /// Shown in the first message until content arrives. Must not be blank.
    pub placeholder: String,
}

/// What the user ended up seeing for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Never empty; every id but the last holds finalized content.
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug)]
struct RenderState {
    accumulated: String,
    previous_rendered: String,
    message_ids: Vec<MessageId>,
    last_edit_at: Instant,
    last_typing_at: Option<Instant>,
}

impl RenderState {
    fn is_dirty(&self) -> bool {
        self.accumulated != self.previous_rendered
    }
}

#[derive(Debug, Clone)]
pub struct Renderer {
    settings: RenderSettings,
}

impl Renderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    /// Consume `tokens` and mirror the accumulated text into `sink`.
    ///
    /// Edits are issued one at a time from this task, never more often than
    /// `min_edit_interval`. When the stream closes, one last edit is always
    /// attempted so the remote text matches the final text. A `Failure`
    /// token stops rendering at once and leaves the partial text in place.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn render(
        &self,
        mut tokens: TokenStream,
        sink: &dyn RenderSink,
    ) -> Result<Rendered, RenderError> {
        let mut typing_at = None;
        signal_typing(sink, &mut typing_at).await;

        let first = sink
            .create_message(&self.settings.placeholder)
            .await
            .map_err(RenderError::Sink)?;
        let mut state = RenderState {
            accumulated: String::new(),
            previous_rendered: String::new(),
            message_ids: vec![first],
            last_edit_at: Instant::now(),
            last_typing_at: typing_at,
        };
        let mut token_count = 0usize;
        let mut edit_count = 0usize;

        loop {
            let deadline = state.last_edit_at + self.settings.min_edit_interval;
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline), if state.is_dirty() => {
                    self.flush(&mut state, sink).await?;
                    edit_count += 1;
                    if state
                        .last_typing_at
                        .is_none_or(|at| at.elapsed() >= TYPING_REFRESH_INTERVAL)
                    {
                        signal_typing(sink, &mut state.last_typing_at).await;
                    }
                }
                token = tokens.next() => match token {
                    Some(Token::Content(text)) => {
                        token_count += 1;
                        state.accumulated.push_str(&text);
                    }
                    Some(Token::Failure(error)) => {
                        tracing::warn!(
                            %error,
                            rendered_chars = state.previous_rendered.chars().count(),
                            messages = state.message_ids.len(),
                            "generation failed mid-stream; leaving partial text"
                        );
                        return Err(RenderError::Generation(error));
                    }
                    None => break,
                },
            }
        }

        // Forced regardless of the throttle; a no-op on the wire when nothing changed.
        self.flush(&mut state, sink).await?;
        edit_count += 1;

        tracing::info!(
            tokens = token_count,
            edits = edit_count,
            chars = state.accumulated.chars().count(),
            messages = state.message_ids.len(),
            "render completed"
        );
        Ok(Rendered {
            text: state.accumulated,
            message_ids: state.message_ids,
        })
    }

    async fn flush(
        &self,
        state: &mut RenderState,
        sink: &dyn RenderSink,
    ) -> Result<(), RenderError> {
        let ids = sink
            .edit_messages(
                &state.message_ids,
                &state.previous_rendered,
                &state.accumulated,
            )
            .await
            .map_err(RenderError::Sink)?;
        state.message_ids = ids;
        state.previous_rendered.clone_from(&state.accumulated);
        state.last_edit_at = Instant::now();
        Ok(())
    }
}

async fn signal_typing(sink: &dyn RenderSink, last_typing_at: &mut Option<Instant>) {
    *last_typing_at = Some(Instant::now());
    if let Err(error) = sink.send_typing().await {
        tracing::debug!(%error, "typing indicator failed; ignoring");
    }
}
