//! relaybot server: wires the lock store, persistence, generation source and
//! channels together, then runs the gateway next to a small HTTP surface.

use crate::admission::AdmissionController;
use crate::config::RelayConfig;
use crate::gateway::Gateway;
use crate::lock_store::{LockStore, MemoryLockStore};
use crate::redis_store::RedisLockStore;
use crate::routes;
use crate::storage::SqliteStore;
use crate::turn::{TurnOrchestrator, TurnSettings};
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use rb_channels::{ChannelAdapter, OutboundSender, TelegramAdapter};
use rb_llm::LlmClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const INBOUND_QUEUE_CAPACITY: usize = 256;

pub struct AppState {
    pub started_at: Instant,
    pub admission: AdmissionController,
    pub lock_store_backend: &'static str,
    pub channels: Vec<String>,
    pub default_model: String,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    tracing::info!(
        model = %cfg.general.model,
        telegram_enabled = cfg.channels.telegram.enabled,
        redis = cfg.store.redis_url.is_some(),
        database = %cfg.database_path().display(),
        config_path = %path.display(),
        "config ok"
    );

    let llm = LlmClient::new(
        cfg.keys.openai_api_key.clone(),
        cfg.keys.anthropic_api_key.clone(),
    );
    if !llm.has_key_for(&cfg.general.model) {
        return Err(anyhow::anyhow!(
            "no API key configured for model {}",
            cfg.general.model
        ));
    }
    tracing::info!(model = %cfg.general.model, "api key present");

    let (store, backend) = build_lock_store(&cfg).await?;
    store.exists("relaybot:doctor").await?;
    tracing::info!(backend, "lock store reachable");

    SqliteStore::open(&cfg.database_path()).await?;
    tracing::info!("database ok");
    Ok(())
}

async fn build_lock_store(cfg: &RelayConfig) -> Result<(Arc<dyn LockStore>, &'static str)> {
    match cfg.store.redis_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            let store = RedisLockStore::connect(url).await?;
            Ok((Arc::new(store), "redis"))
        }
        _ => {
            tracing::warn!("store.redis_url not set; locks and queues are process-local");
            Ok((Arc::new(MemoryLockStore::new()), "memory"))
        }
    }
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let started_at = Instant::now();

    let (lock_store, lock_store_backend) = build_lock_store(&cfg).await?;
    let admission = AdmissionController::new(
        lock_store,
        cfg.lock_ttl(),
        cfg.queue_ttl(),
        cfg.store.max_queue_depth,
    );
    let message_store = Arc::new(SqliteStore::open(&cfg.database_path()).await?);
    let llm = Arc::new(LlmClient::new(
        cfg.keys.openai_api_key.clone(),
        cfg.keys.anthropic_api_key.clone(),
    ));
    if !llm.has_key_for(&cfg.general.model) {
        tracing::warn!(
            model = %cfg.general.model,
            "no API key for the default model; turns will fail until one is configured"
        );
    }

    let mut adapters: Vec<Arc<dyn ChannelAdapter>> = Vec::new();
    let mut senders: Vec<Arc<dyn OutboundSender>> = Vec::new();
    if cfg.channels.telegram.enabled {
        let telegram = Arc::new(TelegramAdapter::new(&cfg.channels.telegram.bot_token)?);
        adapters.push(telegram.clone());
        senders.push(telegram);
    }
    if adapters.is_empty() {
        return Err(anyhow::anyhow!(
            "no channel enabled; set channels.telegram.enabled or TELEGRAM_BOT_TOKEN"
        ));
    }
    let channels: Vec<String> = adapters
        .iter()
        .map(|adapter| adapter.channel_id().to_string())
        .collect();

    let orchestrator = Arc::new(TurnOrchestrator::new(
        admission,
        message_store,
        llm,
        senders,
        TurnSettings::from_config(&cfg),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    for adapter in &adapters {
        adapter.start(inbound_tx.clone()).await?;
        tracing::info!(channel = adapter.channel_id(), "channel started");
    }
    drop(inbound_tx);

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(Gateway::new(
        cfg.security.clone(),
        orchestrator.clone(),
        inbound_rx,
        shutdown.clone(),
    ));
    let gateway_handle = gateway.start();

    if cfg.server.enabled {
        let addr: SocketAddr = cfg
            .server
            .bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {}: {e}", cfg.server.bind_addr))?;
        let listener = preflight_bind_listener(addr).await?;
        let state = Arc::new(AppState {
            started_at,
            admission: orchestrator.admission().clone(),
            lock_store_backend,
            channels,
            default_model: cfg.general.model.clone(),
        });

        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id_from_headers(request.headers())
                )
            })
            .on_response(
                |response: &Response, latency: Duration, _span: &tracing::Span| {
                    tracing::info!(
                        status = response.status().as_u16(),
                        latency_ms = latency.as_millis() as u64,
                        "http request completed"
                    );
                },
            )
            .on_failure(
                |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                    tracing::error!(
                        error_class = %error,
                        latency_ms = latency.as_millis() as u64,
                        "http request failed"
                    );
                },
            );

        let app = routes::router()
            .layer(Extension(state))
            .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(cfg.server.http_timeout_secs),
            ))
            .layer(trace_layer)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

        tracing::info!(%addr, "relaybot serving");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .await?;
        tracing::info!("http server shutdown completed");
    } else {
        tracing::info!("http server disabled; running gateway only");
        shutdown_signal(shutdown.clone()).await;
    }

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
pub fn test_state() -> Arc<AppState> {
    Arc::new(AppState {
        started_at: Instant::now(),
        admission: AdmissionController::new(
            Arc::new(MemoryLockStore::new()),
            Duration::from_secs(300),
            Duration::from_secs(3600),
            10,
        ),
        lock_store_backend: "memory",
        channels: vec!["telegram".to_string()],
        default_model: "gpt-4o-mini".to_string(),
    })
}
