use crate::error::{LlmError, Result};
use crate::source::{Token, TokenStream};
use crate::sse::decode_sse;
use crate::types::ChatMessage;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

const OPENAI_CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, api_key: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %model))]
    pub async fn chat_stream(&self, model: &str, messages: &[ChatMessage]) -> Result<TokenStream> {
        let req = OpenAiChatRequest::new(model, messages);

        let response = self
            .http
            .post(OPENAI_CHAT_COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "openai stream status={status} body={body}"
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
                match parse_stream_data(&event.data) {
                    Ok(OpenAiStreamEvent::Content(text)) => {
                        return Some((Token::Content(text), Some(sse)));
                    }
                    Ok(OpenAiStreamEvent::Done) => return None,
                    Ok(OpenAiStreamEvent::Skip) => continue,
                    Err(e) => return Some((Token::Failure(e), None)),
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum OpenAiStreamEvent {
    Content(String),
    Done,
    Skip,
}

fn parse_stream_data(data: &str) -> Result<OpenAiStreamEvent> {
    if data.trim() == "[DONE]" {
        return Ok(OpenAiStreamEvent::Done);
    }
    let chunk: OpenAiStreamChunk = serde_json::from_str(data).map_err(|e| {
        LlmError::StreamParse(format!("openai chunk json error={e} data={data}"))
    })?;
    if let Some(error) = chunk.error {
        return Err(LlmError::Provider(error.message));
    }
    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty());
    Ok(match content {
        Some(text) => OpenAiStreamEvent::Content(text),
        None => OpenAiStreamEvent::Skip,
    })
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    stream: bool,
}

impl<'a> OpenAiChatRequest<'a> {
    fn new(model: &'a str, messages: &'a [ChatMessage]) -> Self {
        Self {
            model,
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    error: Option<OpenAiStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamError {
    #[serde(default)]
    message: String,
}
