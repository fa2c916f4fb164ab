//! Relay error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use service_core::middleware::RequestId;
use thiserror::Error;

/// Failure of one of the two relay stages. The message is the underlying
/// cause as reported, without decoration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("{message}")]
    Upload { message: String },

    #[error("{message}")]
    Inference { message: String },
}

impl RelayError {
    pub fn upload(message: impl Into<String>) -> Self {
        RelayError::Upload {
            message: message.into(),
        }
    }

    pub fn inference(message: impl Into<String>) -> Self {
        RelayError::Inference {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RelayError::Upload { message } | RelayError::Inference { message } => message,
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Upload { .. } => "upload",
            RelayError::Inference { .. } => "inference",
        }
    }

    fn generic_message(&self) -> &'static str {
        match self {
            RelayError::Upload { .. } => "Upload failed",
            RelayError::Inference { .. } => "Inference failed",
        }
    }
}

/// A relay error on its way to the client.
///
/// With details exposed the body is `{"error": <raw message>}`; otherwise a
/// generic message plus the request id the failure was logged under.
#[derive(Debug)]
pub struct ApiError {
    error: RelayError,
    request_id: RequestId,
    expose_details: bool,
}

impl ApiError {
    pub fn new(error: RelayError, request_id: RequestId, expose_details: bool) -> Self {
        Self {
            error,
            request_id,
            expose_details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
            request_id: Option<String>,
        }

        let body = if self.expose_details {
            ErrorResponse {
                error: self.error.message().to_string(),
                request_id: None,
            }
        } else {
            ErrorResponse {
                error: self.error.generic_message().to_string(),
                request_id: Some(self.request_id.0),
            }
        };

        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}
