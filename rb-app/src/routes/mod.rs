pub mod health;
pub mod queue;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(queue::router())
}
