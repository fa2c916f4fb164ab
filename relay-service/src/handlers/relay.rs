//! The two relay endpoints: file upload and prompt processing.

use crate::error::{ApiError, RelayError};
use crate::services::{InferenceRequest, UploadRequest};
use crate::startup::AppState;
use axum::{
    extract::{
        multipart::{Field, MultipartRejection},
        rejection::JsonRejection,
        Multipart, State,
    },
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use service_core::middleware::RequestId;

/// Multipart field carrying the file.
const FILE_FIELD: &str = "file";
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub file_uri: String,
}

/// Body of `POST /process`. Missing fields are empty strings.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessRequest {
    pub user_input: String,
    pub file_uri: String,
    pub mime_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub response: String,
}

fn fail(state: &AppState, error: RelayError, request_id: RequestId) -> ApiError {
    tracing::error!(
        request_id = %request_id,
        kind = error.kind(),
        error = %error,
        "Relay request failed"
    );
    ApiError::new(error, request_id, state.config.relay.expose_error_details)
}

/// Declared content type, else a guess from the file name.
fn resolve_mime_type(declared: Option<&str>, file_name: &str) -> String {
    declared
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .or_else(|| mime_guess::from_path(file_name).first_raw().map(str::to_string))
        .unwrap_or_else(|| FALLBACK_MIME_TYPE.to_string())
}

async fn read_file_field(multipart: &mut Multipart) -> Result<UploadRequest, RelayError> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| {
                RelayError::upload(format!("Failed to read multipart body: {}", e.body_text()))
            })?
            .ok_or_else(|| RelayError::upload("No file uploaded"))?;

        if field.name() == Some(FILE_FIELD) {
            return read_upload(field).await;
        }
    }
}

async fn read_upload(field: Field<'_>) -> Result<UploadRequest, RelayError> {
    let original_name = field.file_name().unwrap_or("upload").to_string();
    let mime_type = resolve_mime_type(field.content_type(), &original_name);

    let bytes = field
        .bytes()
        .await
        .map_err(|e| RelayError::upload(format!("Failed to read file bytes: {}", e.body_text())))?;

    Ok(UploadRequest {
        bytes: bytes.to_vec(),
        mime_type,
        original_name,
    })
}

/// `POST /upload`: forward the `file` field to storage, answer with its reference.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();

    let mut multipart = multipart.map_err(|e| {
        fail(
            &state,
            RelayError::upload(format!("Invalid multipart request: {}", e.body_text())),
            request_id.clone(),
        )
    })?;

    let upload = read_file_field(&mut multipart)
        .await
        .map_err(|e| fail(&state, e, request_id.clone()))?;

    tracing::info!(
        request_id = %request_id,
        file_name = %upload.original_name,
        mime_type = %upload.mime_type,
        size = upload.bytes.len(),
        "Received upload"
    );

    let stored = state
        .ingress
        .upload(upload, &cancel)
        .await
        .map_err(|e| fail(&state, e, request_id.clone()))?;

    Ok(Json(UploadResponse {
        file_uri: stored.uri,
    }))
}

/// `POST /process`: run one prompt against a stored file.
pub async fn process_prompt(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();

    let Json(payload) = payload.map_err(|e| {
        fail(
            &state,
            RelayError::inference(e.body_text()),
            request_id.clone(),
        )
    })?;

    tracing::info!(
        request_id = %request_id,
        file_uri = %payload.file_uri,
        mime_type = %payload.mime_type,
        prompt_len = payload.user_input.len(),
        "Processing prompt"
    );

    let response = state
        .inference
        .infer(
            InferenceRequest {
                file_uri: payload.file_uri,
                mime_type: payload.mime_type,
                user_input: payload.user_input,
            },
            &cancel,
        )
        .await
        .map_err(|e| fail(&state, e, request_id.clone()))?;

    Ok(Json(ProcessResponse { response }))
}
