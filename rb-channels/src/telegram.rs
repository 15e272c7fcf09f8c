use crate::traits::{ChannelAdapter, OutboundSender};
use crate::types::{ChatId, InboundMessage, LengthUnit, MessageId};
use anyhow::Result;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;
const TELEGRAM_MAX_RETRY_AFTER_SECS: u64 = 30;
const TELEGRAM_EMPTY_TEXT_PLACEHOLDER: &str = "…";
const TELEGRAM_NOT_MODIFIED: &str = "message is not modified";

/// Telegram rejects texts longer than this many UTF-16 code units (after entity parsing).
pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    /// POST a Bot API method, retrying once when Telegram asks us to slow down.
    async fn call<T: DeserializeOwned>(&self, method: &str, body: &serde_json::Value) -> Result<T> {
        let mut retried = false;
        loop {
            let url = self.api_url(method)?;
            let resp = self.http.post(url).json(body).send().await?;
            let status = resp.status();
            let envelope: TelegramResponse<T> = resp.json().await.map_err(|e| {
                anyhow::anyhow!("telegram {method} unreadable response: status={status} error={e}")
            })?;
            if envelope.ok {
                return envelope
                    .result
                    .ok_or_else(|| anyhow::anyhow!("telegram {method} returned ok without result"));
            }

            let retry_after = envelope
                .parameters
                .as_ref()
                .and_then(|p| p.retry_after)
                .filter(|secs| *secs <= TELEGRAM_MAX_RETRY_AFTER_SECS);
            let may_retry = status == StatusCode::TOO_MANY_REQUESTS && !retried;
            if let Some(secs) = retry_after.filter(|_| may_retry) {
                tracing::warn!(
                    method,
                    retry_after_secs = secs,
                    "telegram rate limited; retrying once"
                );
                tokio::time::sleep(Duration::from_secs(secs)).await;
                retried = true;
                continue;
            }

            return Err(TelegramApiError {
                method: method.to_string(),
                status,
                description: envelope.description.unwrap_or_default(),
            }
            .into());
        }
    }
}

#[derive(Debug)]
struct TelegramApiError {
    method: String,
    status: StatusCode,
    description: String,
}

impl std::fmt::Display for TelegramApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "telegram {} failed: status={} description={}",
            self.method, self.status, self.description
        )
    }
}

impl std::error::Error for TelegramApiError {}

fn is_not_modified(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<TelegramApiError>()
        .is_some_and(|e| e.description.contains(TELEGRAM_NOT_MODIFIED))
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl OutboundSender for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    fn max_message_len(&self) -> usize {
        TELEGRAM_MAX_MESSAGE_LEN
    }

    fn length_unit(&self) -> LengthUnit {
        LengthUnit::Utf16
    }

    async fn create_message(&self, chat_id: &ChatId, text: &str) -> Result<MessageId> {
        let body = serde_json::json!({
            "chat_id": chat_id.as_str(),
            "text": render_text(text),
            "parse_mode": "HTML",
        });
        let sent: TelegramSentMessage = self.call("sendMessage", &body).await?;
        Ok(sent.message_id.to_string().into())
    }

    async fn edit_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        text: &str,
    ) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id.as_str(),
            "message_id": message_id.as_str(),
            "text": render_text(text),
            "parse_mode": "HTML",
        });
        match self.call::<serde_json::Value>("editMessageText", &body).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                tracing::debug!(%message_id, "telegram edit skipped: content unchanged");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_message(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id.as_str(),
            "message_id": message_id.as_str(),
        });
        let _: bool = self.call("deleteMessage", &body).await?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: &ChatId) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id.as_str(),
            "action": "typing",
        });
        let _: bool = self.call("sendChatAction", &body).await?;
        Ok(())
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response
                .json::<TelegramResponse<Vec<TelegramUpdate>>>()
                .await
            {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(inbound) = build_inbound_message(&update) {
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

/// Escape the three characters Telegram's HTML parse mode treats specially.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

fn render_text(text: &str) -> String {
    if text.trim().is_empty() {
        return TELEGRAM_EMPTY_TEXT_PLACEHOLDER.to_string();
    }
    escape_html(text)
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_inbound_message(update: &TelegramUpdate) -> Option<InboundMessage> {
    let message = update.message.as_ref()?;
    let chat = message.chat.as_ref()?;
    // Bots only talk to people in private chats.
    if chat.r#type != "private" {
        return None;
    }
    let content = extract_message_content(message)?;
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));

    Some(InboundMessage {
        message_id: message.message_id.to_string().into(),
        channel_id: TELEGRAM_CHANNEL_ID.into(),
        sender_id: sender_id.into(),
        chat_id: chat.id.to_string().into(),
        content,
        received_at: Utc::now(),
    })
}

fn extract_message_content(message: &TelegramMessage) -> Option<String> {
    [message.text.as_deref(), message.caption.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<TelegramResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramSentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}
