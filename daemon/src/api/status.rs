use axum::{extract::State, Json};
use std::sync::Arc;
use zimage_core::api::StatusResponse;

use crate::state::AppState;

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let runtime = &state.runtime;
    let profile = runtime.profile();

    Json(StatusResponse {
        status: runtime.status().to_string(),
        model: runtime.model_id().to_string(),
        backend: profile.backend.to_string(),
        precision: profile.precision.to_string(),
    })
}
