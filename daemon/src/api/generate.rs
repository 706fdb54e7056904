use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use zimage_core::api::{ErrorResponse, GenerateBody, GenerateResponse};
use zimage_core::{ArtifactRecord, Error, GenerationRequest};

use crate::state::AppState;

/// Core error rendered as an HTTP response
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::ModelNotReady | Error::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::Inference(_) | Error::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Connection { .. } | Error::Server { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("Generation failed: {}", self.0);
        } else {
            tracing::warn!("Request rejected: {}", self.0);
        }
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<GenerateResponse>, ApiError> {
    if let Some(guidance) = body.guidance_scale.filter(|g| *g != 0.0) {
        tracing::warn!(
            "Ignoring guidance_scale {}; the model runs without guidance",
            guidance
        );
    }

    let request = body.into_request(&state.defaults)?;
    tracing::info!(
        "Request: {}... ({}x{}, steps {})",
        request.prompt.chars().take(30).collect::<String>(),
        request.width,
        request.height,
        request.steps
    );

    // Detached so a finished image is still written if the client goes away
    let task = tokio::spawn(generate_and_write(Arc::clone(&state), request));
    let (record, elapsed) = task
        .await
        .map_err(|e| Error::Inference(format!("generation task failed: {}", e)))??;

    tracing::info!("Generated {} in {:.1}s", record.path.display(), elapsed);

    Ok(Json(GenerateResponse {
        status: "success".to_string(),
        image_path: record.path,
        time_taken: elapsed,
        meta: record.meta,
    }))
}

async fn generate_and_write(
    state: Arc<AppState>,
    request: GenerationRequest,
) -> Result<(ArtifactRecord, f64), Error> {
    let result = state.runtime.generate(request.clone()).await?;
    let elapsed = result.elapsed_seconds;

    // PNG encoding and disk I/O stay off the async workers
    let writer_state = Arc::clone(&state);
    let record = tokio::task::spawn_blocking(move || {
        writer_state
            .writer
            .write(&result.image, result.seed_used, &request)
    })
    .await
    .map_err(|e| Error::Storage {
        path: state.writer.directory().to_path_buf(),
        message: format!("write task failed: {}", e),
    })??;

    Ok((record, elapsed))
}
