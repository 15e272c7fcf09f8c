use crate::error::{LlmError, Result};
use crate::types::ChatMessage;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// One unit produced by a generation source.
///
/// A stream of tokens ends when the underlying stream yields `None`. A
/// `Failure` is terminal: consumers stop reading after the first one.
#[derive(Debug)]
pub enum Token {
    Content(String),
    Failure(LlmError),
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Token> + Send>>;

#[async_trait]
pub trait GenerationSource: Send + Sync {
    /// Start generating a reply for `history` (oldest first, last entry is the
    /// user's new message). Errors returned here happen before any token.
    async fn open_stream(
        &self,
        model: &str,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<TokenStream>;
}
