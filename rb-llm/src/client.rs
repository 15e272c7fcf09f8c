use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::source::{GenerationSource, TokenStream};
use crate::types::{ChatMessage, Role};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

/// Routes each request to a provider based on the model name.
#[derive(Clone)]
pub struct LlmClient {
    openai_api_key: Option<String>,
    anthropic_api_key: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(openai_api_key: Option<String>, anthropic_api_key: Option<String>) -> Self {
        // Streams can legitimately run for minutes; only bound the connect phase.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            openai_api_key: openai_api_key.filter(|k| !k.trim().is_empty()),
            anthropic_api_key: anthropic_api_key.filter(|k| !k.trim().is_empty()),
            client,
        }
    }

    pub fn has_key_for(&self, model: &str) -> bool {
        self.key_for(detect_provider(model)).is_some()
    }

    fn key_for(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::OpenAI => self.openai_api_key.as_deref(),
            Provider::Anthropic => self.anthropic_api_key.as_deref(),
        }
    }
}

#[async_trait]
impl GenerationSource for LlmClient {
    #[tracing::instrument(level = "info", skip_all, fields(model = %model, history = history.len()))]
    async fn open_stream(
        &self,
        model: &str,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<TokenStream> {
        if history.is_empty() {
            return Err(LlmError::InvalidInput(
                "cannot generate from an empty history".to_string(),
            ));
        }
        let provider = detect_provider(model);
        let Some(api_key) = self.key_for(provider) else {
            return Err(LlmError::InvalidInput(format!(
                "no api key configured for provider {provider:?} (model {model})"
            )));
        };

        match provider {
            Provider::OpenAI => {
                let mut messages = Vec::with_capacity(history.len() + 1);
                if !system_prompt.trim().is_empty() {
                    messages.push(ChatMessage::new(Role::System, system_prompt));
                }
                messages.extend_from_slice(history);
                OpenAiClient::new(self.client.clone(), api_key)
                    .chat_stream(model, &messages)
                    .await
            }
            Provider::Anthropic => {
                AnthropicClient::new(self.client.clone(), api_key)
                    .chat_stream(model, system_prompt, history)
                    .await
            }
        }
    }
}

pub fn detect_provider(model: &str) -> Provider {
    let m = model.trim().to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    Provider::OpenAI
}
