pub mod generate;
pub mod status;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;
use std::sync::Arc;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status::status))
        .route("/generate", post(generate::generate))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
