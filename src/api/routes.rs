use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::types::*;
use super::AppState;
use crate::device::device_info;

/// Response header carrying `stop` or `length`.
pub const FINISH_REASON_HEADER: &str = "x-finish-reason";

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.service.model_id().to_string(),
        adapter: state.service.adapter_id().to_string(),
        device: device_info(state.service.device()),
    })
}

async fn generate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();

    let Json(request) = payload.map_err(|rejection| {
        warn!(%request_id, "Rejected generate request: {}", rejection.body_text());
        ApiError::from(rejection)
    })?;
    let prompt = request.prompt.unwrap_or_default();

    info!(%request_id, "Generate request: prompt_len={}", prompt.len());

    let output = state.service.generate(&prompt).await.map_err(|e| {
        error!(%request_id, "Generation error: {}", e);
        ApiError::from(e)
    })?;

    info!(
        %request_id,
        "Generate done: prompt_tokens={}, completion_tokens={}, finish_reason={}, {}ms",
        output.prompt_tokens,
        output.tokens.len(),
        output.finish_reason.as_str(),
        output.total_time_ms
    );

    Ok((
        [(FINISH_REASON_HEADER, output.finish_reason.as_str())],
        Json(GenerateResponse {
            response: output.text,
        }),
    )
        .into_response())
}
