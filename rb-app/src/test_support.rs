//! Fakes shared by the unit tests of several modules.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream;
use rb_channels::{ChatId, InboundMessage, LengthUnit, MessageId, OutboundSender};
use rb_llm::{ChatMessage, GenerationSource, LlmError, Role, Token, TokenStream};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

pub fn inbound(user: &str, message_id: &str, text: &str) -> InboundMessage {
    InboundMessage {
        message_id: message_id.into(),
        channel_id: "telegram".into(),
        sender_id: user.into(),
        chat_id: user.into(),
        content: text.to_string(),
        received_at: Utc::now(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentOp {
    Typing,
    Create { id: MessageId, text: String },
    Edit { id: MessageId, text: String },
    Delete { id: MessageId },
}

/// Outbound sender that records every call and keeps the current text of
/// each message it created.
pub struct RecordingSender {
    limit: usize,
    unit: LengthUnit,
    creates_allowed: Option<u64>,
    next_id: AtomicU64,
    ops: Mutex<Vec<SentOp>>,
    contents: Mutex<HashMap<MessageId, String>>,
    fail_typing: bool,
    fail_edits: bool,
}

impl RecordingSender {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            unit: LengthUnit::Chars,
            creates_allowed: None,
            next_id: AtomicU64::new(1),
            ops: Mutex::new(Vec::new()),
            contents: Mutex::new(HashMap::new()),
            fail_typing: false,
            fail_edits: false,
        }
    }

    pub fn failing_typing(mut self) -> Self {
        self.fail_typing = true;
        self
    }

    pub fn failing_edits(mut self) -> Self {
        self.fail_edits = true;
        self
    }

    pub fn with_unit(mut self, unit: LengthUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Only the first `allowed` creates succeed.
    pub fn failing_creates_after(mut self, allowed: u64) -> Self {
        self.creates_allowed = Some(allowed);
        self
    }

    pub fn ops(&self) -> Vec<SentOp> {
        self.ops.lock().expect("ops lock").clone()
    }

    pub fn text_of(&self, id: &MessageId) -> Option<String> {
        self.contents.lock().expect("contents lock").get(id).cloned()
    }

    /// Texts of messages still present, in creation order.
    pub fn visible_texts(&self) -> Vec<String> {
        let contents = self.contents.lock().expect("contents lock");
        let mut ids: Vec<&MessageId> = contents.keys().collect();
        ids.sort_by_key(|id| id.as_str().parse::<u64>().unwrap_or(u64::MAX));
        ids.into_iter().map(|id| contents[id].clone()).collect()
    }

    pub fn edit_count(&self) -> usize {
        self.count(|op| matches!(op, SentOp::Edit { .. }))
    }

    pub fn create_count(&self) -> usize {
        self.count(|op| matches!(op, SentOp::Create { .. }))
    }

    fn count(&self, pred: impl Fn(&SentOp) -> bool) -> usize {
        self.ops.lock().expect("ops lock").iter().filter(|op| pred(op)).count()
    }

    fn record(&self, op: SentOp) {
        self.ops.lock().expect("ops lock").push(op);
    }
}

#[async_trait]
impl OutboundSender for RecordingSender {
    fn channel_id(&self) -> &str {
        "telegram"
    }

    fn max_message_len(&self) -> usize {
        self.limit
    }

    fn length_unit(&self) -> LengthUnit {
        self.unit
    }

    async fn create_message(&self, _chat_id: &ChatId, text: &str) -> Result<MessageId> {
        if let Some(allowed) = self.creates_allowed {
            if self.create_count() as u64 >= allowed {
                anyhow::bail!("create rejected");
            }
        }
        let id = MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string());
        self.contents
            .lock()
            .expect("contents lock")
            .insert(id.clone(), text.to_string());
        self.record(SentOp::Create {
            id: id.clone(),
            text: text.to_string(),
        });
        Ok(id)
    }

    async fn edit_message(&self, _chat_id: &ChatId, message_id: &MessageId, text: &str) -> Result<()> {
        if self.fail_edits {
            anyhow::bail!("edit rejected");
        }
        self.contents
            .lock()
            .expect("contents lock")
            .insert(message_id.clone(), text.to_string());
        self.record(SentOp::Edit {
            id: message_id.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, _chat_id: &ChatId, message_id: &MessageId) -> Result<()> {
        self.contents.lock().expect("contents lock").remove(message_id);
        self.record(SentOp::Delete {
            id: message_id.clone(),
        });
        Ok(())
    }

    async fn send_typing(&self, _chat_id: &ChatId) -> Result<()> {
        self.record(SentOp::Typing);
        if self.fail_typing {
            anyhow::bail!("typing rejected");
        }
        Ok(())
    }
}

/// A token stream fed by hand from the test body.
pub fn token_channel() -> (mpsc::UnboundedSender<Token>, TokenStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let tokens = stream::unfold(rx, |mut rx| async move {
        let token = rx.recv().await?;
        Some((token, rx))
    });
    (tx, Box::pin(tokens))
}

struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn enter(active: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Playback {
    tokens: VecDeque<Token>,
    gate: Option<Arc<Semaphore>>,
    step: Duration,
    _guard: ActiveGuard,
}

/// Generation source that answers `re: <last user message>`.
///
/// A user message of `boom` yields a partial answer followed by a failure.
/// With a gate, each stream waits for one permit before its first token.
pub struct ScriptedSource {
    step: Duration,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(step: Duration) -> Self {
        Self {
            step,
            gate: None,
            calls: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Model and history of each stream opened so far.
    pub fn calls(&self) -> Vec<(String, Vec<ChatMessage>)> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Highest number of streams that were alive at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationSource for ScriptedSource {
    async fn open_stream(
        &self,
        model: &str,
        _system_prompt: &str,
        history: &[ChatMessage],
    ) -> rb_llm::Result<TokenStream> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((model.to_string(), history.to_vec()));
        let prompt = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let mut tokens = VecDeque::from([Token::Content("re: ".to_string())]);
        if prompt == "boom" {
            tokens.push_back(Token::Failure(LlmError::Provider("overloaded".into())));
        } else {
            tokens.push_back(Token::Content(prompt));
        }

        let playback = Playback {
            tokens,
            gate: self.gate.clone(),
            step: self.step,
            _guard: ActiveGuard::enter(self.active.clone(), &self.peak),
        };
        let stream = stream::unfold(playback, |mut playback| async move {
            if let Some(gate) = playback.gate.take() {
                if let Ok(permit) = gate.acquire_owned().await {
                    permit.forget();
                }
            }
            if !playback.step.is_zero() {
                tokio::time::sleep(playback.step).await;
            }
            let token = playback.tokens.pop_front()?;
            Some((token, playback))
        });
        Ok(Box::pin(stream))
    }
}
