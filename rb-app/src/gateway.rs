//! Inbound multiplexer: every channel adapter feeds one queue, and each
//! event gets its own task.

use crate::config::SecurityConfig;
use crate::turn::{TurnError, TurnOrchestrator};
use anyhow::Result;
use rb_channels::InboundMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    security: SecurityConfig,
    orchestrator: Arc<TurnOrchestrator>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        security: SecurityConfig,
        orchestrator: Arc<TurnOrchestrator>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            security,
            orchestrator,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop().await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    /// Runs until the inbound channel closes or shutdown is requested, then
    /// waits for in-flight turns to finish or observe the cancellation.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_loop(&self) -> Result<()> {
        let mut tasks = JoinSet::new();
        loop {
            let msg = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    msg = rx.recv() => msg,
                }
            };
            let Some(inbound) = msg else {
                break;
            };

            // Reap finished tasks so the set does not grow without bound.
            while tasks.try_join_next().is_some() {}

            if !self.security.is_allowed(inbound.sender_id.as_str()) {
                tracing::info!(
                    channel_id = %inbound.channel_id,
                    sender_id = %inbound.sender_id,
                    "sender not in allowlist; ignoring"
                );
                continue;
            }

            let orchestrator = self.orchestrator.clone();
            let cancel = self.shutdown.child_token();
            tasks.spawn(async move {
                let message_id = inbound.message_id.clone();
                match orchestrator.handle_inbound(inbound, cancel).await {
                    Ok(()) => {}
                    Err(TurnError::Cancelled) => {
                        tracing::info!(%message_id, "turn cancelled by shutdown");
                    }
                    Err(e) => tracing::warn!(%e, %message_id, "handle_inbound failed"),
                }
            });
        }

        tracing::info!(in_flight = tasks.len(), "gateway stopping");
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::lock_store::MemoryLockStore;
    use crate::render::RenderSettings;
    use crate::storage::SqliteStore;
    use crate::test_support::{RecordingSender, ScriptedSource, inbound};
    use crate::turn::TurnSettings;
    use std::time::Duration;

    async fn gateway(
        security: SecurityConfig,
    ) -> (Arc<Gateway>, mpsc::Sender<InboundMessage>, Arc<RecordingSender>, CancellationToken) {
        let sender = Arc::new(RecordingSender::new(4096));
        let orchestrator = Arc::new(TurnOrchestrator::new(
            AdmissionController::new(
                Arc::new(MemoryLockStore::new()),
                Duration::from_secs(300),
                Duration::from_secs(3600),
                10,
            ),
            Arc::new(SqliteStore::open_in_memory().await.expect("sqlite")),
            Arc::new(ScriptedSource::new(Duration::ZERO)),
            vec![sender.clone()],
            TurnSettings {
                default_model: "gpt-4o-mini".to_string(),
                system_prompt: String::new(),
                history_limit: 20,
                turn_timeout: Duration::from_secs(5),
                render: RenderSettings {
                    min_edit_interval: Duration::from_millis(10),
                    placeholder: "…".to_string(),
                },
                message_limit: None,
                failure_notice: None,
            },
        ));
        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let gateway = Arc::new(Gateway::new(security, orchestrator, rx, shutdown.clone()));
        (gateway, tx, sender, shutdown)
    }

    #[tokio::test]
    async fn allowed_senders_get_answers_and_others_are_ignored() {
        let security = SecurityConfig {
            allowed_users: vec!["42".to_string()],
            allow_all_senders: false,
        };
        let (gateway, tx, sender, _shutdown) = gateway(security).await;
        let handle = gateway.start();

        tx.send(inbound("99", "1", "let me in")).await.expect("send");
        tx.send(inbound("42", "2", "hi")).await.expect("send");
        drop(tx);
        handle.await.expect("gateway");

        assert_eq!(sender.visible_texts(), vec!["re: hi".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let security = SecurityConfig {
            allowed_users: vec![],
            allow_all_senders: true,
        };
        let (gateway, _tx, _sender, shutdown) = gateway(security).await;
        let handle = gateway.start();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits promptly")
            .expect("gateway");
    }
}
