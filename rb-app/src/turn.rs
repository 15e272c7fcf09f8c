//! Turn orchestration: admission, queue notices, draining, and the turn
//! itself (persist, generate, render, persist).

use crate::admission::{Admission, AdmissionController, AdmissionError, LockAcquire, PendingItem};
use crate::commands::{self, Command};
use crate::config::RelayConfig;
use crate::render::{ChannelSink, RenderError, RenderSettings, Renderer};
use crate::storage::{ForeignMessageMapping, MessageStore, NewMessage};
use rb_channels::{InboundMessage, MessageId, OutboundSender};
use rb_llm::{ChatMessage, GenerationSource, LlmError, Role};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("generation could not start: {0}")]
    Generation(#[from] LlmError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("outbound error: {0}")]
    Outbound(#[source] anyhow::Error),

    #[error("no outbound sender for channel {0}")]
    UnknownChannel(String),

    #[error("turn timed out after {0:?}")]
    TimedOut(Duration),

    #[error("turn cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub default_model: String,
    pub system_prompt: String,
    pub history_limit: usize,
    pub turn_timeout: Duration,
    pub render: RenderSettings,
    pub message_limit: Option<usize>,
    pub failure_notice: Option<String>,
}

impl TurnSettings {
    pub fn from_config(cfg: &RelayConfig) -> Self {
        Self {
            default_model: cfg.general.model.clone(),
            system_prompt: cfg.general.system_prompt.clone(),
            history_limit: cfg.turn.history_limit,
            turn_timeout: cfg.turn_timeout(),
            render: RenderSettings {
                min_edit_interval: cfg.min_edit_interval(),
                placeholder: cfg.render.placeholder.clone(),
            },
            message_limit: cfg.render.message_limit,
            failure_notice: cfg
                .turn
                .failure_notice
                .clone()
                .filter(|notice| !notice.trim().is_empty()),
        }
    }
}

pub struct TurnOrchestrator {
    admission: AdmissionController,
    store: Arc<dyn MessageStore>,
    source: Arc<dyn GenerationSource>,
    senders: HashMap<String, Arc<dyn OutboundSender>>,
    renderer: Renderer,
    settings: TurnSettings,
}

impl TurnOrchestrator {
    pub fn new(
        admission: AdmissionController,
        store: Arc<dyn MessageStore>,
        source: Arc<dyn GenerationSource>,
        senders: Vec<Arc<dyn OutboundSender>>,
        settings: TurnSettings,
    ) -> Self {
        let senders = senders
            .into_iter()
            .map(|sender| (sender.channel_id().to_string(), sender))
            .collect();
        Self {
            admission,
            store,
            source,
            senders,
            renderer: Renderer::new(settings.render.clone()),
            settings,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    fn sender_for(&self, inbound: &InboundMessage) -> Result<Arc<dyn OutboundSender>, TurnError> {
        self.senders
            .get(inbound.channel_id.as_str())
            .cloned()
            .ok_or_else(|| TurnError::UnknownChannel(inbound.channel_id.to_string()))
    }

    /// Admit `inbound` and, if this task ends up holding the user's lock,
    /// process it along with everything queued behind it.
    ///
    /// Returns once the item is either processed or safely queued for the
    /// current lock holder. Failed turns are logged and do not stop the drain.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(user_id = %inbound.user_key(), message_id = %inbound.message_id)
    )]
    pub async fn handle_inbound(
        &self,
        inbound: InboundMessage,
        cancel: CancellationToken,
    ) -> Result<(), TurnError> {
        let user = inbound.user_key();
        let sender = self.sender_for(&inbound)?;
        let mut notice: Option<MessageId> = None;

        loop {
            match self.admission.acquire_lock(&user).await? {
                LockAcquire::Acquired => {
                    let item = PendingItem {
                        inbound,
                        notification_id: notice,
                    };
                    // Anything already waiting goes first.
                    let first = if self.admission.queue_depth(&user).await? > 0 {
                        self.admission.enqueue(&user, &item).await?;
                        None
                    } else {
                        Some(item)
                    };
                    return self.drain_holding_lock(&user, first, &cancel).await;
                }
                LockAcquire::AlreadyLocked => {
                    if notice.is_none() {
                        let position = self.admission.queue_depth(&user).await? + 1;
                        notice = self
                            .send_notice(sender.as_ref(), &inbound, &queued_text(position))
                            .await;
                    }
                    let admission = self
                        .admission
                        .try_enqueue_or_admit(&user, inbound.clone(), notice.clone())
                        .await?;
                    match admission {
                        // The holder released between our two checks.
                        Admission::Admitted => continue,
                        Admission::Queued { depth } => {
                            tracing::info!(depth, "user busy; message queued");
                            return self.kick_drain(&user, &cancel).await;
                        }
                        Admission::Full { depth } => {
                            tracing::warn!(depth, "user queue full; message dropped");
                            self.report_queue_full(sender.as_ref(), &inbound, notice)
                                .await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// The holder may have released just before our item landed. Whoever
    /// wins the lock now drains the queue.
    async fn kick_drain(&self, user: &str, cancel: &CancellationToken) -> Result<(), TurnError> {
        match self.admission.acquire_lock(user).await? {
            LockAcquire::Acquired => {
                tracing::debug!("lock was free after enqueue; draining");
                self.drain_holding_lock(user, None, cancel).await
            }
            LockAcquire::AlreadyLocked => Ok(()),
        }
    }

    async fn drain_holding_lock(
        &self,
        user: &str,
        first: Option<PendingItem>,
        cancel: &CancellationToken,
    ) -> Result<(), TurnError> {
        let result = self.drain(user, first, cancel).await;
        if result.is_err() {
            if let Err(error) = self.admission.release_lock(user).await {
                tracing::warn!(%error, "failed to release lock after aborted drain");
            }
        }
        result
    }

    /// Run `first` and then every queued item, one at a time, while holding
    /// the lock. The lock is released only once the queue is seen empty.
    async fn drain(
        &self,
        user: &str,
        mut next: Option<PendingItem>,
        cancel: &CancellationToken,
    ) -> Result<(), TurnError> {
        let mut processed = 0usize;
        loop {
            let item = match next.take() {
                Some(item) => item,
                None => match self.admission.dequeue_next(user).await? {
                    Some(item) => item,
                    None => {
                        self.admission.release_lock(user).await?;
                        // An item may have been queued after our empty read.
                        if self.admission.queue_depth(user).await? == 0 {
                            break;
                        }
                        match self.admission.acquire_lock(user).await? {
                            LockAcquire::Acquired => continue,
                            LockAcquire::AlreadyLocked => break,
                        }
                    }
                },
            };

            match self.run_turn(&item, cancel).await {
                Ok(()) => {}
                Err(TurnError::Cancelled) => return Err(TurnError::Cancelled),
                Err(error) => {
                    tracing::error!(
                        %error,
                        message_id = %item.inbound.message_id,
                        "turn failed"
                    );
                    self.send_failure_notice(&item.inbound).await;
                }
            }
            processed += 1;
            self.admission.refresh_lock(user).await?;
        }
        tracing::debug!(processed, "queue drained; lock released");
        Ok(())
    }

    /// One turn, bounded by the turn timeout and aborted by `cancel`.
    async fn run_turn(
        &self,
        item: &PendingItem,
        cancel: &CancellationToken,
    ) -> Result<(), TurnError> {
        let timeout = self.settings.turn_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TurnError::Cancelled),
            result = tokio::time::timeout(timeout, self.turn_body(item)) => match result {
                Ok(result) => result,
                Err(_) => Err(TurnError::TimedOut(timeout)),
            },
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(message_id = %item.inbound.message_id, chat_id = %item.inbound.chat_id)
    )]
    async fn turn_body(&self, item: &PendingItem) -> Result<(), TurnError> {
        let inbound = &item.inbound;
        let sender = self.sender_for(inbound)?;
        if let Some(notice_id) = &item.notification_id {
            if let Err(error) = sender.delete_message(&inbound.chat_id, notice_id).await {
                tracing::debug!(%error, "queue notice cleanup failed; ignoring");
            }
        }

        if let Some(command) = commands::parse(&inbound.content) {
            let reply = self.run_command(command, inbound).await?;
            sender
                .create_message(&inbound.chat_id, &reply)
                .await
                .map_err(TurnError::Outbound)?;
            return Ok(());
        }

        let user = inbound.user_key();
        let conversation_id = self
            .store
            .active_conversation(&user)
            .await
            .map_err(TurnError::Storage)?;
        let user_record = self
            .store
            .create_message(NewMessage {
                conversation_id,
                user_id: user.clone(),
                role: Role::User,
                content: inbound.content.clone(),
            })
            .await
            .map_err(TurnError::Storage)?;
        self.record_mappings(user_record.id, inbound, std::slice::from_ref(&inbound.message_id))
            .await;

        let history: Vec<ChatMessage> = self
            .store
            .history(conversation_id, self.settings.history_limit)
            .await
            .map_err(TurnError::Storage)?
            .iter()
            .map(ChatMessage::from)
            .collect();
        let model = self.model_for(&user).await?;

        let tokens = self
            .source
            .open_stream(&model, &self.settings.system_prompt, &history)
            .await?;
        let sink = ChannelSink::new(
            sender.clone(),
            inbound.chat_id.clone(),
            self.settings.message_limit,
        );
        let rendered = self.renderer.render(tokens, &sink).await?;

        if rendered.text.trim().is_empty() {
            tracing::warn!(%model, "generation produced no text; nothing persisted");
            return Ok(());
        }
        let assistant_record = self
            .store
            .create_message(NewMessage {
                conversation_id,
                user_id: user,
                role: Role::Assistant,
                content: rendered.text,
            })
            .await
            .map_err(TurnError::Storage)?;
        self.record_mappings(assistant_record.id, inbound, &rendered.message_ids)
            .await;

        tracing::info!(
            %model,
            conversation_id,
            messages = rendered.message_ids.len(),
            "turn completed"
        );
        Ok(())
    }

    async fn model_for(&self, user: &str) -> Result<String, TurnError> {
        Ok(self
            .store
            .model_override(user)
            .await
            .map_err(TurnError::Storage)?
            .unwrap_or_else(|| self.settings.default_model.clone()))
    }

    async fn run_command(
        &self,
        command: Command,
        inbound: &InboundMessage,
    ) -> Result<String, TurnError> {
        let user = inbound.user_key();
        tracing::info!(?command, "running command");
        let reply = match command {
            Command::Start => commands::WELCOME_TEXT.to_string(),
            Command::Help => commands::HELP_TEXT.to_string(),
            Command::New => {
                let id = self
                    .store
                    .start_conversation(&user)
                    .await
                    .map_err(TurnError::Storage)?;
                tracing::info!(conversation_id = id, "conversation reset");
                "Started a new conversation.".to_string()
            }
            Command::Model(None) => format!(
                "Active model: {}\nDefault model: {}",
                self.model_for(&user).await?,
                self.settings.default_model
            ),
            Command::Model(Some(name)) if name == "default" => {
                self.store
                    .set_model_override(&user, None)
                    .await
                    .map_err(TurnError::Storage)?;
                format!("Model reset to {}.", self.settings.default_model)
            }
            Command::Model(Some(name)) => {
                self.store
                    .set_model_override(&user, Some(name.clone()))
                    .await
                    .map_err(TurnError::Storage)?;
                format!("Model set to {name}.")
            }
            Command::Status => format!(
                "Model: {}\nQueued messages: {}",
                self.model_for(&user).await?,
                self.admission.queue_depth(&user).await?
            ),
            Command::Unknown(name) => format!("Unknown command {name}. Try /help."),
        };
        Ok(reply)
    }

    /// Foreign mappings are best effort: failures are logged, never fatal.
    async fn record_mappings(
        &self,
        message_id: i64,
        inbound: &InboundMessage,
        external_ids: &[MessageId],
    ) {
        for external_id in external_ids {
            let Some(mapping) = ForeignMessageMapping::new(
                message_id,
                inbound.channel_id.as_str(),
                inbound.chat_id.as_str(),
                external_id,
            ) else {
                tracing::warn!(
                    message_id,
                    external_id = %external_id,
                    "external id not representable; mapping skipped"
                );
                continue;
            };
            if let Err(error) = self.store.create_foreign_mapping(mapping).await {
                tracing::warn!(
                    %error,
                    message_id,
                    external_id = %external_id,
                    "foreign mapping failed"
                );
            }
        }
    }

    async fn send_notice(
        &self,
        sender: &dyn OutboundSender,
        inbound: &InboundMessage,
        text: &str,
    ) -> Option<MessageId> {
        match sender.create_message(&inbound.chat_id, text).await {
            Ok(id) => Some(id),
            Err(error) => {
                tracing::warn!(%error, "failed to send queue notice");
                None
            }
        }
    }

    async fn report_queue_full(
        &self,
        sender: &dyn OutboundSender,
        inbound: &InboundMessage,
        notice: Option<MessageId>,
    ) {
        let result = match notice {
            Some(id) => sender.edit_message(&inbound.chat_id, &id, QUEUE_FULL_TEXT).await,
            None => sender
                .create_message(&inbound.chat_id, QUEUE_FULL_TEXT)
                .await
                .map(|_| ()),
        };
        if let Err(error) = result {
            tracing::warn!(%error, "failed to send queue-full notice");
        }
    }

    async fn send_failure_notice(&self, inbound: &InboundMessage) {
        let Some(text) = self.settings.failure_notice.as_deref() else {
            return;
        };
        let Ok(sender) = self.sender_for(inbound) else {
            return;
        };
        if let Err(error) = sender.create_message(&inbound.chat_id, text).await {
            tracing::warn!(%error, "failed to send failure notice");
        }
    }
}

const QUEUE_FULL_TEXT: &str =
    "Too many messages are waiting. Please resend this one once I've caught up.";

fn queued_text(position: usize) -> String {
    format!("Still working on your previous message. Yours is queued (position {position}).")
}
