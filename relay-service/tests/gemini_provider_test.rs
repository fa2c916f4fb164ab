//! Gemini providers against a local fake of the Gemini API.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay_service::services::providers::gemini::{
    GeminiChatProvider, GeminiConfig, GeminiFileStorage,
};
use relay_service::services::providers::{
    ChatProvider, ChatSession, Content, FileStorageProvider, FileUploadOptions, GenerationParams,
    Part, ProviderError,
};
use relay_service::error::RelayError;
use relay_service::services::{
    InferenceRequest, InferenceStage, IngressPolicy, IngressStage, PromptMode, StagingArea,
    UploadRequest,
};
use secrecy::Secret;
use service_core::retry::{RetryConfig, Retryable};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const API_KEY: &str = "test-key";

#[derive(Clone, Default)]
struct FakeGemini {
    base: String,
    uploads: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
    generate_requests: Arc<Mutex<Vec<(String, Value)>>>,
    /// When set, generateContent answers with this status and a Google error envelope.
    fail_generate: Option<(StatusCode, &'static str)>,
    /// Same for the upload session start.
    fail_upload: Option<(StatusCode, &'static str)>,
    upload_attempts: Arc<Mutex<u32>>,
}

fn google_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": status.as_u16(), "message": message } })),
    )
        .into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        == Some(API_KEY)
}

async fn start_upload(State(fake): State<FakeGemini>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    assert_eq!(headers["x-goog-upload-protocol"], "resumable");
    assert_eq!(headers["x-goog-upload-command"], "start");

    *fake.upload_attempts.lock().unwrap() += 1;
    if let Some((status, message)) = fake.fail_upload {
        return google_error(status, message);
    }

    (
        [(
            "x-goog-upload-url",
            format!("{}/upload/session/abc", fake.base),
        )],
        "",
    )
        .into_response()
}

async fn finalize_upload(
    State(fake): State<FakeGemini>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let size = body.len();
    fake.uploads.lock().unwrap().push((headers, body));

    Json(json!({
        "file": {
            "name": "files/abc",
            "uri": format!("{}/v1beta/files/abc", fake.base),
            "mimeType": "text/plain",
            "displayName": "a.txt",
            "sizeBytes": size.to_string(),
            "state": "ACTIVE"
        }
    }))
    .into_response()
}

async fn generate_content(
    State(fake): State<FakeGemini>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    fake.generate_requests
        .lock()
        .unwrap()
        .push((model_action, body));

    if let Some((status, message)) = fake.fail_generate {
        return google_error(status, message);
    }

    Json(json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": "A short " }, { "text": "summary." }] },
            "finishReason": "STOP"
        }],
        "usageMetadata": { "promptTokenCount": 12, "candidatesTokenCount": 4 }
    }))
    .into_response()
}

async fn list_models(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "code": 400, "message": "API key not valid" } })),
        )
            .into_response();
    }
    Json(json!({ "models": [] })).into_response()
}

async fn spawn_fake(fail_generate: Option<(StatusCode, &'static str)>) -> FakeGemini {
    spawn_fake_with(fail_generate, None).await
}

async fn spawn_fake_with(
    fail_generate: Option<(StatusCode, &'static str)>,
    fail_upload: Option<(StatusCode, &'static str)>,
) -> FakeGemini {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake = FakeGemini {
        base: format!("http://{}", listener.local_addr().unwrap()),
        fail_generate,
        fail_upload,
        ..Default::default()
    };

    let app = Router::new()
        .route("/upload/v1beta/files", post(start_upload))
        .route("/upload/session/abc", post(finalize_upload))
        .route("/v1beta/models", get(list_models))
        .route("/v1beta/models/:model_action", post(generate_content))
        .with_state(fake.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    fake
}

fn config(fake: &FakeGemini, api_key: &str) -> GeminiConfig {
    GeminiConfig {
        api_key: Secret::new(api_key.to_string()),
        model: "gemini-1.5-flash".to_string(),
        api_base: fake.base.clone(),
        request_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn file_upload_uses_resumable_protocol() {
    let fake = spawn_fake(None).await;
    let storage = GeminiFileStorage::new(config(&fake, API_KEY)).unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("staged");
    tokio::fs::write(&path, b"0123456789").await.unwrap();

    let uploaded = storage
        .upload_file(
            &path,
            &FileUploadOptions {
                mime_type: "text/plain".to_string(),
                display_name: "a.txt".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(uploaded.uri, format!("{}/v1beta/files/abc", fake.base));
    assert_eq!(uploaded.name, "files/abc");
    assert_eq!(uploaded.size_bytes, Some(10));
    assert_eq!(uploaded.state.as_deref(), Some("ACTIVE"));

    let uploads = fake.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    let (headers, body) = &uploads[0];
    assert_eq!(headers["x-goog-upload-command"], "upload, finalize");
    assert_eq!(headers["x-goog-upload-offset"], "0");
    assert_eq!(&body[..], b"0123456789");
}

#[tokio::test]
async fn chat_sends_history_and_generation_config() {
    let fake = spawn_fake(None).await;
    let chat = GeminiChatProvider::new(config(&fake, API_KEY)).unwrap();

    let history = vec![Content::user(vec![
        Part::FileData {
            mime_type: "text/plain".to_string(),
            file_uri: "ref123".to_string(),
        },
        Part::Text("Summarize".to_string()),
    ])];
    let mut session = chat.start_chat(GenerationParams::default(), history);

    let response = session.send_message("INSERT_INPUT_HERE").await.unwrap();

    assert_eq!(response.text.as_deref(), Some("A short summary."));
    assert_eq!(response.input_tokens, 12);
    assert_eq!(response.output_tokens, 4);
    assert_eq!(session.history().len(), 3);

    let requests = fake.generate_requests.lock().unwrap();
    let (model_action, body) = &requests[0];
    assert_eq!(model_action, "gemini-1.5-flash:generateContent");

    let contents = body["contents"].as_array().unwrap();
    assert_eq!(contents.len(), 2);
    assert_eq!(contents[0]["role"], "user");
    assert_eq!(
        contents[0]["parts"][0],
        json!({ "fileData": { "mimeType": "text/plain", "fileUri": "ref123" } })
    );
    assert_eq!(contents[0]["parts"][1], json!({ "text": "Summarize" }));
    assert_eq!(contents[1]["parts"][0], json!({ "text": "INSERT_INPUT_HERE" }));

    let generation = &body["generationConfig"];
    assert_eq!(generation["temperature"], 1.0);
    assert_eq!(generation["topK"], 64);
    assert_eq!(generation["maxOutputTokens"], 1024);
    assert_eq!(generation["responseMimeType"], "text/plain");
}

#[tokio::test]
async fn api_errors_carry_google_message() {
    let fake = spawn_fake(Some((StatusCode::SERVICE_UNAVAILABLE, "model unavailable"))).await;
    let chat = GeminiChatProvider::new(config(&fake, API_KEY)).unwrap();

    let mut session = chat.start_chat(GenerationParams::default(), Vec::new());
    let err = session.send_message("hello").await.unwrap_err();

    match &err {
        ProviderError::Http { status, message } => {
            assert_eq!(*status, 503);
            assert_eq!(message, "model unavailable");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn rate_limits_keep_google_message() {
    let fake = spawn_fake(Some((StatusCode::TOO_MANY_REQUESTS, "quota exceeded"))).await;
    let chat = GeminiChatProvider::new(config(&fake, API_KEY)).unwrap();

    let mut session = chat.start_chat(GenerationParams::default(), Vec::new());
    let err = session.send_message("hello").await.unwrap_err();

    match &err {
        ProviderError::RateLimited(message) => assert_eq!(message, "quota exceeded"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.to_string(), "quota exceeded (HTTP 429)");
    assert!(err.is_transient());
}

#[tokio::test]
async fn rate_limited_inference_surfaces_google_message() {
    let fake = spawn_fake(Some((StatusCode::TOO_MANY_REQUESTS, "quota exceeded"))).await;
    let chat = Arc::new(GeminiChatProvider::new(config(&fake, API_KEY)).unwrap());
    let stage = InferenceStage::new(
        chat,
        GenerationParams::default(),
        PromptMode::History,
        Duration::from_secs(5),
    );

    let err = stage
        .infer(
            InferenceRequest {
                file_uri: "ref123".to_string(),
                mime_type: "text/plain".to_string(),
                user_input: "Summarize".to_string(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err, RelayError::inference("quota exceeded (HTTP 429)"));
    // Inference is never retried.
    assert_eq!(fake.generate_requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rate_limited_upload_surfaces_google_message_after_retries() {
    let fake = spawn_fake_with(None, Some((StatusCode::TOO_MANY_REQUESTS, "quota exceeded"))).await;
    let storage = Arc::new(GeminiFileStorage::new(config(&fake, API_KEY)).unwrap());

    let dir = tempfile::TempDir::new().unwrap();
    let staging = Arc::new(StagingArea::new(dir.path()).await.unwrap());
    let policy = IngressPolicy {
        timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            add_jitter: false,
        },
    };
    let stage = IngressStage::new(storage, staging, policy);

    let err = stage
        .upload(
            UploadRequest {
                bytes: b"0123456789".to_vec(),
                mime_type: "text/plain".to_string(),
                original_name: "a.txt".to_string(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err, RelayError::upload("quota exceeded (HTTP 429)"));
    assert_eq!(*fake.upload_attempts.lock().unwrap(), 2);
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn health_check_validates_api_key() {
    let fake = spawn_fake(None).await;

    let healthy = GeminiChatProvider::new(config(&fake, API_KEY)).unwrap();
    assert!(healthy.health_check().await.is_ok());

    let wrong_key = GeminiFileStorage::new(config(&fake, "wrong")).unwrap();
    assert!(wrong_key.health_check().await.is_err());

    let no_key = GeminiFileStorage::new(config(&fake, "")).unwrap();
    assert!(matches!(
        no_key.health_check().await,
        Err(ProviderError::NotConfigured(_))
    ));
}
