//! Inference stage: ask the chat model about a previously stored file.

use crate::error::RelayError;
use crate::services::metrics;
use crate::services::providers::{
    call_with_deadline, ChatProvider, Content, GenerationParams, Part,
};
use crate::services::registry::ReferenceRegistry;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Live message sent in [`PromptMode::History`].
pub const PLACEHOLDER_MESSAGE: &str = "INSERT_INPUT_HERE";

const EMPTY_RESPONSE_MESSAGE: &str = "empty response from model";

/// Where the user's prompt goes in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptMode {
    /// Prompt sits in the history turn next to the file reference; the live
    /// message is [`PLACEHOLDER_MESSAGE`].
    #[default]
    History,
    /// History holds only the file reference; the prompt is the live message.
    Live,
}

impl FromStr for PromptMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "history" => Ok(PromptMode::History),
            "live" => Ok(PromptMode::Live),
            _ => Err(format!("Invalid prompt mode: {}", s)),
        }
    }
}

/// One prompt about one stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub file_uri: String,
    pub mime_type: String,
    pub user_input: String,
}

#[derive(Clone)]
pub struct InferenceStage {
    chat: Arc<dyn ChatProvider>,
    params: GenerationParams,
    prompt_mode: PromptMode,
    timeout: Duration,
    registry: Option<ReferenceRegistry>,
}

impl InferenceStage {
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        params: GenerationParams,
        prompt_mode: PromptMode,
        timeout: Duration,
    ) -> Self {
        Self {
            chat,
            params,
            prompt_mode,
            timeout,
            registry: None,
        }
    }

    /// Only accept references present in `registry`.
    pub fn with_registry(mut self, registry: ReferenceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the seeded history and the live message for `request`.
    pub fn build_turn(&self, request: &InferenceRequest) -> (Vec<Content>, String) {
        let file = Part::FileData {
            mime_type: request.mime_type.clone(),
            file_uri: request.file_uri.clone(),
        };

        match self.prompt_mode {
            PromptMode::History => (
                vec![Content::user(vec![
                    file,
                    Part::Text(request.user_input.clone()),
                ])],
                PLACEHOLDER_MESSAGE.to_string(),
            ),
            PromptMode::Live => (
                vec![Content::user(vec![file])],
                request.user_input.clone(),
            ),
        }
    }

    /// Send one message about the referenced file and return the model's
    /// text unchanged. Never retried.
    #[tracing::instrument(
        name = "inference.infer",
        skip_all,
        fields(file_uri = %request.file_uri, mime_type = %request.mime_type)
    )]
    pub async fn infer(
        &self,
        request: InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<String, RelayError> {
        let start = Instant::now();
        let result = self.infer_inner(&request, cancel).await;
        metrics::record_inference(&result, start.elapsed());
        result
    }

    async fn infer_inner(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<String, RelayError> {
        if let Some(registry) = &self.registry {
            registry
                .verify(&request.file_uri, &request.mime_type)
                .map_err(|e| RelayError::inference(e.to_string()))?;
        }

        let (history, message) = self.build_turn(request);
        let mut session = self.chat.start_chat(self.params.clone(), history);

        let response = call_with_deadline(self.timeout, cancel, session.send_message(&message))
            .await
            .map_err(|e| RelayError::inference(e.to_string()))?;

        tracing::info!(
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            finish_reason = ?response.finish_reason,
            "Inference completed"
        );

        response
            .text
            .ok_or_else(|| RelayError::inference(EMPTY_RESPONSE_MESSAGE))
    }
}
