//! Ingress stage: stage an upload locally, hand it to the storage provider,
//! and return the reference it issues.

use crate::error::RelayError;
use crate::services::metrics;
use crate::services::providers::{
    call_with_deadline, FileStorageProvider, FileUploadOptions, ProviderError, UploadedFile,
};
use crate::services::registry::ReferenceRegistry;
use crate::services::staging::{StagedFile, StagingArea};
use serde::Serialize;
use service_core::retry::{retry_call, RetryConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A file received from a client.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub original_name: String,
}

/// Reference to a file held by the storage provider. Only meaningful
/// together with the MIME type it was uploaded as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObjectRef {
    pub uri: String,
    pub mime_type: String,
}

/// Timeouts and retry budget for storage calls.
#[derive(Debug, Clone)]
pub struct IngressPolicy {
    /// Deadline for a single upload attempt.
    pub timeout: Duration,
    pub retry: RetryConfig,
}

#[derive(Clone)]
pub struct IngressStage {
    storage: Arc<dyn FileStorageProvider>,
    staging: Arc<StagingArea>,
    policy: IngressPolicy,
    registry: Option<ReferenceRegistry>,
}

impl IngressStage {
    pub fn new(
        storage: Arc<dyn FileStorageProvider>,
        staging: Arc<StagingArea>,
        policy: IngressPolicy,
    ) -> Self {
        Self {
            storage,
            staging,
            policy,
            registry: None,
        }
    }

    /// Register every successful upload in `registry`.
    pub fn with_registry(mut self, registry: ReferenceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Stage `request`, forward it to the storage provider, and return the
    /// issued reference. The staged copy is gone when this returns, whatever
    /// the outcome.
    #[tracing::instrument(
        name = "ingress.upload",
        skip_all,
        fields(
            file_name = %request.original_name,
            mime_type = %request.mime_type,
            size = request.bytes.len()
        )
    )]
    pub async fn upload(
        &self,
        request: UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<StoredObjectRef, RelayError> {
        let start = Instant::now();
        let result = self.upload_inner(request, cancel).await;
        metrics::record_upload(&result, start.elapsed());
        result
    }

    async fn upload_inner(
        &self,
        request: UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<StoredObjectRef, RelayError> {
        if request.bytes.is_empty() {
            return Err(RelayError::upload("Uploaded file is empty"));
        }
        if request.mime_type.trim().is_empty() {
            return Err(RelayError::upload("Uploaded file has no MIME type"));
        }

        let staged = self
            .staging
            .stage(&request.bytes, &request.mime_type, &request.original_name)
            .await
            .map_err(|e| RelayError::upload(format!("Failed to stage upload: {}", e)))?;
        drop(request.bytes);

        let forwarded = self.forward(&staged, cancel).await;

        let path = staged.path().to_path_buf();
        if let Err(e) = staged.release().await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged upload");
        }

        let file = forwarded.map_err(|e| RelayError::upload(e.to_string()))?;
        if file.uri.is_empty() {
            return Err(RelayError::upload("Storage provider returned an empty file URI"));
        }

        tracing::info!(
            file_uri = %file.uri,
            file_name = %file.name,
            state = file.state.as_deref().unwrap_or("unknown"),
            "Upload forwarded to storage provider"
        );

        let stored = StoredObjectRef {
            uri: file.uri,
            mime_type: request.mime_type,
        };

        if let Some(registry) = &self.registry {
            registry.register(&stored);
        }

        Ok(stored)
    }

    /// Upload the staged file with bounded retries; each attempt has its own
    /// deadline, and cancellation stops both attempts and backoff sleeps.
    async fn forward(
        &self,
        staged: &StagedFile,
        cancel: &CancellationToken,
    ) -> Result<UploadedFile, ProviderError> {
        let options = FileUploadOptions {
            mime_type: staged.mime_type().to_string(),
            display_name: staged.original_name().to_string(),
        };

        let attempts = retry_call(&self.policy.retry, "upload_file", || {
            call_with_deadline(
                self.policy.timeout,
                cancel,
                self.storage.upload_file(staged.path(), &options),
            )
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = attempts => result,
        }
    }
}
