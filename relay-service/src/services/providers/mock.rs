//! Mock provider implementations for testing.
//!
//! Both mocks replay a script of outcomes (falling back to a default once the
//! script runs out) and record every call so tests can assert on exactly
//! what the relay sent.

use super::{
    ChatProvider, ChatResponse, ChatSession, Content, FileStorageProvider, FileUploadOptions,
    GenerationParams, Part, ProviderError, UploadedFile,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome a mock produces for one call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed with this value (URI for storage, text for chat).
    Succeed(String),
    /// Fail with `ProviderError::Api(message)`.
    Fail(String),
    /// Fail with a transient `ProviderError::Network(message)`.
    FailTransient(String),
}

// ============================================================================
// Storage
// ============================================================================

/// What the storage mock saw on one call.
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub path: PathBuf,
    pub options: FileUploadOptions,
    /// File contents at call time, `None` if the file did not exist.
    pub contents: Option<Vec<u8>>,
}

/// Mock storage provider.
pub struct MockFileStorage {
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedUpload>>,
}

impl MockFileStorage {
    /// Every upload succeeds with `uri`.
    pub fn succeeding(uri: impl Into<String>) -> Self {
        Self::with_script(Vec::new(), MockOutcome::Succeed(uri.into()))
    }

    /// Every upload fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_script(Vec::new(), MockOutcome::Fail(message.into()))
    }

    /// Play `script` in order, then keep answering with `fallback`.
    pub fn with_script(script: Vec<MockOutcome>, fallback: MockOutcome) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedUpload> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl FileStorageProvider for MockFileStorage {
    async fn upload_file(
        &self,
        path: &Path,
        options: &FileUploadOptions,
    ) -> Result<UploadedFile, ProviderError> {
        let contents = tokio::fs::read(path).await.ok();
        lock(&self.calls).push(RecordedUpload {
            path: path.to_path_buf(),
            options: options.clone(),
            contents: contents.clone(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match outcome {
            MockOutcome::Succeed(uri) => Ok(UploadedFile {
                name: format!("files/{}", uuid::Uuid::new_v4().simple()),
                uri,
                mime_type: options.mime_type.clone(),
                display_name: Some(options.display_name.clone()),
                size_bytes: contents.map(|c| c.len() as u64),
                state: Some("ACTIVE".to_string()),
            }),
            MockOutcome::Fail(message) => Err(ProviderError::Api(message)),
            MockOutcome::FailTransient(message) => Err(ProviderError::Network(message)),
        }
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

// ============================================================================
// Chat
// ============================================================================

/// What the chat mock saw for one `send_message`.
#[derive(Debug, Clone)]
pub struct RecordedChat {
    pub params: GenerationParams,
    /// History the session was started with.
    pub history: Vec<Content>,
    pub message: String,
}

struct ChatState {
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedChat>>,
}

/// Mock chat provider.
pub struct MockChatProvider {
    state: Arc<ChatState>,
    healthy: bool,
}

impl MockChatProvider {
    /// Every message is answered with `text`.
    pub fn replying(text: impl Into<String>) -> Self {
        Self::with_script(Vec::new(), MockOutcome::Succeed(text.into()))
    }

    /// Every message fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_script(Vec::new(), MockOutcome::Fail(message.into()))
    }

    /// Play `script` in order, then keep answering with `fallback`.
    pub fn with_script(script: Vec<MockOutcome>, fallback: MockOutcome) -> Self {
        Self {
            state: Arc::new(ChatState {
                script: Mutex::new(script.into()),
                fallback,
                delay: None,
                calls: Mutex::new(Vec::new()),
            }),
            healthy: true,
        }
    }

    /// Sleep this long before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        let state = Arc::new(ChatState {
            script: Mutex::new(lock(&self.state.script).clone()),
            fallback: self.state.fallback.clone(),
            delay: Some(delay),
            calls: Mutex::new(Vec::new()),
        });
        Self { state, ..self }
    }

    /// Make health checks fail.
    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn calls(&self) -> Vec<RecordedChat> {
        lock(&self.state.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.state.calls).len()
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    fn start_chat(&self, params: GenerationParams, history: Vec<Content>) -> Box<dyn ChatSession> {
        Box::new(MockChatSession {
            state: self.state.clone(),
            params,
            initial_history: history.clone(),
            history,
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.healthy {
            Ok(())
        } else {
            Err(ProviderError::NotConfigured(
                "Mock chat provider not enabled".to_string(),
            ))
        }
    }
}

struct MockChatSession {
    state: Arc<ChatState>,
    params: GenerationParams,
    initial_history: Vec<Content>,
    history: Vec<Content>,
}

#[async_trait]
impl ChatSession for MockChatSession {
    async fn send_message(&mut self, text: &str) -> Result<ChatResponse, ProviderError> {
        lock(&self.state.calls).push(RecordedChat {
            params: self.params.clone(),
            history: self.initial_history.clone(),
            message: text.to_string(),
        });

        if let Some(delay) = self.state.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = lock(&self.state.script)
            .pop_front()
            .unwrap_or_else(|| self.state.fallback.clone());

        match outcome {
            MockOutcome::Succeed(reply) => {
                self.history
                    .push(Content::user(vec![Part::Text(text.to_string())]));
                self.history.push(Content::model(reply.clone()));
                Ok(ChatResponse::text(reply))
            }
            MockOutcome::Fail(message) => Err(ProviderError::Api(message)),
            MockOutcome::FailTransient(message) => Err(ProviderError::Network(message)),
        }
    }

    fn history(&self) -> &[Content] {
        &self.history
    }
}
