//! Slash commands understood by the bot.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    /// Close the current conversation and start an empty one.
    New,
    /// Show the active model, or switch to `Some(name)`. `default` clears the override.
    Model(Option<String>),
    Status,
    Unknown(String),
}

pub const HELP_TEXT: &str = "Send any message to chat with the assistant.\n\
/new - start a new conversation\n\
/model - show the active model\n\
/model <name> - switch model (/model default to reset)\n\
/status - show model and queue state\n\
/help - show this message";

pub const WELCOME_TEXT: &str = "Hi! I'm ready. Send me a message to start chatting.";

/// `None` for ordinary chat text.
pub fn parse(input: &str) -> Option<Command> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let mut parts = trimmed.split_whitespace();
    let head = parts.next().unwrap_or_default();
    // Telegram appends the bot's username in groups: /help@relaybot
    let name = head.split('@').next().unwrap_or(head);
    let arg = parts.next().map(str::to_string);

    Some(match name {
        "/start" => Command::Start,
        "/help" => Command::Help,
        "/new" | "/reset" => Command::New,
        "/model" => Command::Model(arg),
        "/status" => Command::Status,
        _ => Command::Unknown(name.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse("hello"), None);
        assert_eq!(parse("  what does /new do?"), None);
    }

    #[test]
    fn parses_known_commands_and_bot_suffix() {
        assert_eq!(parse("/start"), Some(Command::Start));
        assert_eq!(parse(" /help@relaybot "), Some(Command::Help));
        assert_eq!(parse("/new"), Some(Command::New));
        assert_eq!(parse("/status"), Some(Command::Status));
    }

    #[test]
    fn model_takes_an_optional_argument() {
        assert_eq!(parse("/model"), Some(Command::Model(None)));
        assert_eq!(
            parse("/model gpt-4o-mini"),
            Some(Command::Model(Some("gpt-4o-mini".to_string())))
        );
    }

    #[test]
    fn unknown_commands_are_reported_by_name() {
        assert_eq!(parse("/dance now"), Some(Command::Unknown("/dance".to_string())));
    }
}
