//! Gemini provider implementation.
//!
//! Files go through the Gemini File API resumable upload protocol; chats are
//! replayed in full on every `generateContent` call, the API being stateless.

use super::{
    ChatProvider, ChatResponse, ChatSession, Content, FileStorageProvider, FileUploadOptions,
    FinishReason, GenerationParams, Part, ProviderError, Role, UploadedFile,
};
use async_trait::async_trait;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default Gemini API origin.
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";

const API_KEY_HEADER: &str = "x-goog-api-key";
const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";

/// Gemini provider configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Secret<String>,
    pub model: String,
    /// API origin, without version path.
    pub api_base: String,
    /// Transport-level timeout for a single HTTP exchange.
    pub request_timeout: Duration,
}

impl GeminiConfig {
    fn api_url(&self, path: &str) -> String {
        format!("{}/v1beta/{}", self.api_base.trim_end_matches('/'), path)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/v1beta/files", self.api_base.trim_end_matches('/'))
    }
}

fn build_client(config: &GeminiConfig) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("Failed to create HTTP client: {}", e)))
}

/// Shared health probe: listing models verifies reachability and the API key.
async fn probe_models(client: &Client, config: &GeminiConfig) -> Result<(), ProviderError> {
    if config.api_key.expose_secret().is_empty() {
        return Err(ProviderError::NotConfigured(
            "Gemini API key not configured".to_string(),
        ));
    }

    let response = client
        .get(config.api_url("models"))
        .header(API_KEY_HEADER, config.api_key.expose_secret())
        .send()
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(error_from_response(response).await)
    }
}

/// Map a non-success response to a provider error, preferring the message
/// from the Google error envelope.
async fn error_from_response(response: Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| {
            if body.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body
            }
        });

    if status.as_u16() == 429 {
        return ProviderError::RateLimited(message);
    }

    ProviderError::Http {
        status: status.as_u16(),
        message,
    }
}

// ============================================================================
// File storage
// ============================================================================

/// Gemini File API storage provider.
pub struct GeminiFileStorage {
    config: GeminiConfig,
    client: Client,
}

impl GeminiFileStorage {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        let client = build_client(&config)?;
        Ok(Self { config, client })
    }

    /// Open a resumable upload session and return its upload URL.
    async fn start_upload(
        &self,
        size: usize,
        options: &FileUploadOptions,
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(self.config.upload_url())
            .header(API_KEY_HEADER, self.config.api_key.expose_secret())
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", &options.mime_type)
            .json(&StartUploadRequest {
                file: FileMetadata {
                    display_name: options.display_name.clone(),
                },
            })
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        response
            .headers()
            .get(UPLOAD_URL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("upload session returned no upload URL".to_string())
            })
    }
}

#[async_trait]
impl FileStorageProvider for GeminiFileStorage {
    async fn upload_file(
        &self,
        path: &Path,
        options: &FileUploadOptions,
    ) -> Result<UploadedFile, ProviderError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ProviderError::LocalFile(format!("{}: {}", path.display(), e)))?;

        tracing::debug!(
            size = data.len(),
            mime_type = %options.mime_type,
            display_name = %options.display_name,
            "Starting Gemini file upload"
        );

        let upload_url = self.start_upload(data.len(), options).await?;

        let response = self
            .client
            .post(&upload_url)
            .header(API_KEY_HEADER, self.config.api_key.expose_secret())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(data)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let uploaded: UploadFileResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        Ok(uploaded.file.into())
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        probe_models(&self.client, &self.config).await
    }
}

// ============================================================================
// Chat
// ============================================================================

/// Gemini chat provider.
pub struct GeminiChatProvider {
    config: GeminiConfig,
    client: Client,
}

impl GeminiChatProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        let client = build_client(&config)?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ChatProvider for GeminiChatProvider {
    fn start_chat(&self, params: GenerationParams, history: Vec<Content>) -> Box<dyn ChatSession> {
        Box::new(GeminiChatSession {
            config: self.config.clone(),
            client: self.client.clone(),
            params,
            history,
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        probe_models(&self.client, &self.config).await
    }
}

/// Chat session holding the running history.
pub struct GeminiChatSession {
    config: GeminiConfig,
    client: Client,
    params: GenerationParams,
    history: Vec<Content>,
}

impl GeminiChatSession {
    fn build_request(&self, message: &Content) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: self
                .history
                .iter()
                .chain(std::iter::once(message))
                .map(WireContent::from)
                .collect(),
            generation_config: WireGenerationConfig::from(&self.params),
        }
    }
}

#[async_trait]
impl ChatSession for GeminiChatSession {
    async fn send_message(&mut self, text: &str) -> Result<ChatResponse, ProviderError> {
        let message = Content::user(vec![Part::Text(text.to_string())]);
        let request = self.build_request(&message);
        let url = self
            .config
            .api_url(&format!("models/{}:generateContent", self.config.model));

        tracing::debug!(
            model = %self.config.model,
            turns = request.contents.len(),
            "Sending request to Gemini API"
        );

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, self.config.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let api_response: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let chat_response = api_response.into_chat_response()?;

        self.history.push(message);
        if let Some(text) = &chat_response.text {
            self.history.push(Content::model(text.clone()));
        }

        Ok(chat_response)
    }

    fn history(&self) -> &[Content] {
        &self.history
    }
}

// ============================================================================
// Gemini API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartUploadRequest {
    file: FileMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileMetadata {
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct UploadFileResponse {
    file: FileResource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    display_name: Option<String>,
    /// int64 fields arrive as JSON strings.
    #[serde(default)]
    size_bytes: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl From<FileResource> for UploadedFile {
    fn from(file: FileResource) -> Self {
        Self {
            name: file.name,
            uri: file.uri,
            mime_type: file.mime_type,
            display_name: file.display_name,
            size_bytes: file.size_bytes.and_then(|s| s.parse().ok()),
            state: file.state,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<WireContent>,
    generation_config: WireGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

impl From<&Content> for WireContent {
    fn from(content: &Content) -> Self {
        Self {
            role: Some(content.role.as_str().to_string()),
            parts: content.parts.iter().map(WirePart::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WirePart {
    Text {
        text: String,
    },
    FileData {
        #[serde(rename = "fileData")]
        file_data: WireFileData,
    },
    /// Parts the relay does not interpret (function calls, inline data...).
    Other(serde_json::Value),
}

impl From<&Part> for WirePart {
    fn from(part: &Part) -> Self {
        match part {
            Part::Text(text) => WirePart::Text { text: text.clone() },
            Part::FileData {
                mime_type,
                file_uri,
            } => WirePart::FileData {
                file_data: WireFileData {
                    mime_type: mime_type.clone(),
                    file_uri: file_uri.clone(),
                },
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    response_mime_type: String,
}

impl From<&GenerationParams> for WireGenerationConfig {
    fn from(params: &GenerationParams) -> Self {
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            max_output_tokens: params.max_output_tokens,
            response_mime_type: params.response_mime_type.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

impl GenerateContentResponse {
    fn into_chat_response(self) -> Result<ChatResponse, ProviderError> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ProviderError::ContentFiltered(format!(
                "prompt blocked due to {}",
                reason
            )));
        }

        let usage = self.usage_metadata.unwrap_or_default();
        let Some(candidate) = self.candidates.into_iter().next() else {
            return Ok(ChatResponse {
                text: None,
                input_tokens: usage.prompt_token_count.unwrap_or(0),
                output_tokens: 0,
                finish_reason: FinishReason::Other,
            });
        };

        let finish_reason = match candidate.finish_reason.as_deref() {
            Some("STOP") | None => FinishReason::Complete,
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT") => {
                FinishReason::ContentFilter
            }
            Some(_) => FinishReason::Other,
        };

        if finish_reason == FinishReason::ContentFilter {
            return Err(ProviderError::ContentFiltered(format!(
                "response blocked due to {}",
                candidate.finish_reason.unwrap_or_default()
            )));
        }

        // Multi-part replies are joined the way the SDK's `text()` does.
        let text: String = candidate
            .content
            .map(|c| c.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|part| match part {
                WirePart::Text { text } => Some(text),
                _ => None,
            })
            .collect();

        Ok(ChatResponse {
            text: if text.is_empty() { None } else { Some(text) },
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
            finish_reason,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}
