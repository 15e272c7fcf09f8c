use crate::error::{LlmError, Result};
use crate::source::{Token, TokenStream};
use crate::sse::{SseEvent, decode_sse};
use crate::types::{ChatMessage, Role};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 2048;

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %model))]
    pub async fn chat_stream(
        &self,
        model: &str,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<TokenStream> {
        let req = AnthropicRequest::new(model, system_prompt, messages);

        let response = self
            .http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "anthropic stream status={status} body={body}"
            )));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let stream = futures_util::stream::unfold(Some(sse), |state| async move {
            let mut sse = state?;
            loop {
                let event = match sse.as_mut().next().await? {
                    Ok(event) => event,
                    Err(e) => return Some((Token::Failure(e), None)),
                };
                match parse_stream_event(&event) {
                    Ok(AnthropicStreamEvent::Text(text)) => {
                        return Some((Token::Content(text), Some(sse)));
                    }
                    Ok(AnthropicStreamEvent::Stop) => return None,
                    Ok(AnthropicStreamEvent::Skip) => continue,
                    Err(e) => return Some((Token::Failure(e), None)),
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum AnthropicStreamEvent {
    Text(String),
    Stop,
    Skip,
}

fn parse_stream_event(event: &SseEvent) -> Result<AnthropicStreamEvent> {
    match event.event.as_str() {
        "content_block_delta" => {
            let v: AnthropicContentBlockDelta = serde_json::from_str(&event.data).map_err(|e| {
                LlmError::StreamParse(format!(
                    "anthropic delta json error={e} data={}",
                    event.data
                ))
            })?;
            Ok(match v.delta {
                AnthropicDelta::TextDelta { text } if !text.is_empty() => {
                    AnthropicStreamEvent::Text(text)
                }
                _ => AnthropicStreamEvent::Skip,
            })
        }
        "message_stop" => Ok(AnthropicStreamEvent::Stop),
        "error" => {
            let message = serde_json::from_str::<AnthropicErrorEvent>(&event.data)
                .map(|v| format!("{}: {}", v.error.r#type, v.error.message))
                .unwrap_or_else(|_| event.data.clone());
            Err(LlmError::Provider(message))
        }
        _ => Ok(AnthropicStreamEvent::Skip),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<AnthropicMessage>,
    stream: bool,
}

impl AnthropicRequest {
    fn new(model: &str, system_prompt: &str, messages: &[ChatMessage]) -> Self {
        let mut system = system_prompt.trim().to_string();
        let mut out_messages: Vec<AnthropicMessage> = Vec::new();

        for m in messages {
            let role = match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(m.content.trim());
                    continue;
                }
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            // The Messages API rejects two consecutive turns with the same role.
            match out_messages.last_mut() {
                Some(last) if last.role == role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&m.content);
                }
                _ => out_messages.push(AnthropicMessage {
                    role,
                    content: m.content.clone(),
                }),
            }
        }

        Self {
            model: model.to_string(),
            max_tokens: ANTHROPIC_MAX_TOKENS,
            system,
            messages: out_messages,
            stream: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlockDelta {
    delta: AnthropicDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorEvent {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    #[serde(default)]
    r#type: String,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, data: &str) -> SseEvent {
        SseEvent {
            event: name.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn text_deltas_become_text_and_other_deltas_are_skipped() {
        let text = event(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        );
        assert_eq!(
            parse_stream_event(&text).expect("parses"),
            AnthropicStreamEvent::Text("Hi".to_string())
        );

        let thinking = event(
            "content_block_delta",
            r#"{"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
        );
        assert_eq!(
            parse_stream_event(&thinking).expect("parses"),
            AnthropicStreamEvent::Skip
        );
        assert_eq!(
            parse_stream_event(&event("ping", "{}")).expect("parses"),
            AnthropicStreamEvent::Skip
        );
    }

    #[test]
    fn stop_and_error_events() {
        assert_eq!(
            parse_stream_event(&event("message_stop", "{}")).expect("parses"),
            AnthropicStreamEvent::Stop
        );
        let err = parse_stream_event(&event(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ))
        .expect_err("error event");
        assert!(matches!(err, LlmError::Provider(msg) if msg == "overloaded_error: Overloaded"));
    }

    #[test]
    fn request_folds_system_messages_and_merges_same_role_turns() {
        let messages = vec![
            ChatMessage::new(Role::System, "extra rule"),
            ChatMessage::new(Role::User, "a"),
            ChatMessage::new(Role::User, "b"),
            ChatMessage::new(Role::Assistant, "c"),
        ];
        let req = AnthropicRequest::new("claude-3-5-haiku", "be brief", &messages);
        assert_eq!(req.system, "be brief\nextra rule");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].content, "a\n\nb");
        assert_eq!(req.messages[1].role, "assistant");
    }
}
