//! Channel plumbing for relaybot.
//!
//! Adapters are pure I/O: they turn platform updates into [`InboundMessage`]s
//! and expose the [`OutboundSender`] capability used to create and edit
//! messages on the platform.

mod telegram;
mod traits;
mod types;

pub use telegram::{TELEGRAM_MAX_MESSAGE_LEN, TelegramAdapter, escape_html};
pub use traits::{ChannelAdapter, OutboundSender};
pub use types::{ChannelId, ChatId, InboundMessage, LengthUnit, MessageId, SenderId};
