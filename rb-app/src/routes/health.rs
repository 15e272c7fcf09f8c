use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    // Any cheap read proves the lock store answers.
    let store = state.admission.queue_depth("healthcheck").await;
    if let Err(error) = &store {
        tracing::warn!(%error, "lock store health check failed");
    }
    let ready = store.is_ok();

    Json(serde_json::json!({
        "status": if ready { "ok" } else { "degraded" },
        "ready": ready,
        "checked_at": Utc::now(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "checks": {
            "lock_store": {
                "backend": state.lock_store_backend,
                "reachable": ready,
            },
            "channels": state.channels,
            "default_model": state.default_model,
        }
    }))
}
