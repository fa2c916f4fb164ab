use crate::startup::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use service_core::error::AppError;

/// Liveness probe. Never touches the providers.
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "relay-service",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness probe: both collaborators must answer.
pub async fn readiness_check(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let (storage, chat) = tokio::join!(state.storage.health_check(), state.chat.health_check());

    if let Err(e) = &storage {
        tracing::warn!(error = %e, "File storage provider not ready");
    }
    if let Err(e) = &chat {
        tracing::warn!(error = %e, "Chat provider not ready");
    }
    if storage.is_err() || chat.is_err() {
        return Err(AppError::ServiceUnavailable);
    }

    Ok(Json(json!({ "status": "ready" })))
}
