//! Generation source for relaybot.
//!
//! Pure HTTP streaming clients that turn a conversation turn into a
//! stream of [`Token`]s.

mod anthropic;
mod client;
mod error;
mod openai;
mod source;
mod sse;
mod types;

pub use client::{LlmClient, Provider, detect_provider};
pub use error::{LlmError, Result};
pub use source::{GenerationSource, Token, TokenStream};
pub use types::{ChatMessage, Role};
