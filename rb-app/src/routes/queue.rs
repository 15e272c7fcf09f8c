use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/users/{user_id}/queue", get(get_queue))
}

/// Lock and queue state for one user key, e.g. `telegram:42`.
#[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id))]
async fn get_queue(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let unavailable = |e: crate::admission::AdmissionError| {
        tracing::warn!(error = %e, "queue lookup failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
    };
    let depth = state
        .admission
        .queue_depth(&user_id)
        .await
        .map_err(unavailable)?;
    let locked = state
        .admission
        .is_locked(&user_id)
        .await
        .map_err(unavailable)?;

    Ok(Json(serde_json::json!({
        "user_id": user_id,
        "locked": locked,
        "depth": depth,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::PendingItem;
    use crate::server::test_state;
    use crate::test_support::inbound;

    #[tokio::test]
    async fn reports_lock_and_depth() {
        let state = test_state();
        let user = "telegram:42";
        state.admission.acquire_lock(user).await.expect("acquire");
        state
            .admission
            .enqueue(
                user,
                &PendingItem {
                    inbound: inbound("42", "1", "hi"),
                    notification_id: None,
                },
            )
            .await
            .expect("enqueue");

        let Json(body) = get_queue(Extension(state), Path(user.to_string()))
            .await
            .expect("lookup");
        assert_eq!(body["locked"], true);
        assert_eq!(body["depth"], 1);
    }
}
