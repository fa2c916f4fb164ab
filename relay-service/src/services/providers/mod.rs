//! External collaborator abstractions and implementations.
//!
//! The relay talks to two collaborators: a file store that keeps uploaded
//! files and hands back a URI, and a chat model that answers a prompt about
//! such a file. Both sit behind traits so the Gemini backends can be swapped
//! for the mocks in tests.

pub mod gemini;
pub mod mock;

use async_trait::async_trait;
use service_core::retry::Retryable;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// Failure reported by the provider itself. Displayed verbatim.
    #[error("{0}")]
    Api(String),

    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },

    /// HTTP 429, carrying the provider's message.
    #[error("{0} (HTTP 429)")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Content filtered: {0}")]
    ContentFiltered(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Local file error: {0}")]
    LocalFile(String),
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited(_) | ProviderError::Network(_) | ProviderError::Timeout(_) => {
                true
            }
            ProviderError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Metadata sent along with a file upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUploadOptions {
    pub mime_type: String,
    pub display_name: String,
}

/// A file as held by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Provider resource name (e.g. `files/abc123`).
    pub name: String,
    pub uri: String,
    pub mime_type: String,
    pub display_name: Option<String>,
    pub size_bytes: Option<u64>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One piece of a conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    /// Reference to a file already held by the storage collaborator.
    FileData { mime_type: String, file_uri: String },
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::Text(text.into())],
        }
    }
}

/// Generation parameters for chat requests.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Sampling randomness.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
    /// Candidate pool size.
    pub top_k: u32,
    /// Output length cap.
    pub max_output_tokens: u32,
    /// Output encoding.
    pub response_mime_type: String,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.95,
            top_k: 64,
            max_output_tokens: 1024,
            response_mime_type: "text/plain".to_string(),
        }
    }
}

/// Reason why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Complete,
    Length,
    ContentFilter,
    Other,
}

/// Result of a chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    /// Generated text, if the model produced any.
    pub text: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Complete,
        }
    }
}

/// Storage collaborator: persists a local file and issues a reference to it.
#[async_trait]
pub trait FileStorageProvider: Send + Sync {
    /// Upload the file at `path`.
    async fn upload_file(
        &self,
        path: &Path,
        options: &FileUploadOptions,
    ) -> Result<UploadedFile, ProviderError>;

    /// Health check.
    async fn health_check(&self) -> Result<(), ProviderError>;
}

/// Inference collaborator: opens chat sessions against a model.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Start a chat seeded with `history`. No request is made until a
    /// message is sent.
    fn start_chat(&self, params: GenerationParams, history: Vec<Content>) -> Box<dyn ChatSession>;

    /// Health check.
    async fn health_check(&self) -> Result<(), ProviderError>;
}

/// A live chat session.
#[async_trait]
pub trait ChatSession: Send {
    /// Send `text` as the next user turn. On success both the user turn and
    /// the model reply are appended to the session history.
    async fn send_message(&mut self, text: &str) -> Result<ChatResponse, ProviderError>;

    /// Conversation so far.
    fn history(&self) -> &[Content];
}

/// Run a provider call under a deadline, giving up early if `cancel` fires.
pub async fn call_with_deadline<T, F>(
    timeout: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        result = tokio::time::timeout(timeout, call) => {
            result.unwrap_or(Err(ProviderError::Timeout(timeout)))
        }
    }
}
