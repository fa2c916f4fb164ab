//! Application startup and lifecycle management.

use crate::config::RelayConfig;
use crate::handlers;
use crate::services::providers::gemini::{GeminiChatProvider, GeminiConfig, GeminiFileStorage};
use crate::services::providers::{ChatProvider, FileStorageProvider};
use crate::services::{
    IngressPolicy, IngressStage, InferenceStage, ReferenceRegistry, StagingArea,
};
use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics_middleware, request_id_middleware, security_headers_middleware, REQUEST_ID_HEADER,
};
use service_core::retry::RetryConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: RelayConfig,
    pub ingress: IngressStage,
    pub inference: InferenceStage,
    pub storage: Arc<dyn FileStorageProvider>,
    pub chat: Arc<dyn ChatProvider>,
    /// Parent of every per-request cancellation token.
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    let static_files = ServeDir::new(&state.config.static_dir);
    let upload_limit = DefaultBodyLimit::max(state.config.staging.max_upload_bytes);

    Router::new()
        .route("/upload", post(handlers::relay::upload_file).layer(upload_limit))
        .route("/process", post(handlers::relay::process_prompt))
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .fallback_service(static_files)
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    janitor: Option<JoinHandle<()>>,
}

impl Application {
    /// Build the application with the Gemini providers described by `config`.
    pub async fn build(config: RelayConfig) -> Result<Self, AppError> {
        let gemini = |request_timeout: Duration| GeminiConfig {
            api_key: config.google.api_key.clone(),
            model: config.model.name.clone(),
            api_base: config.google.api_base.clone(),
            request_timeout,
        };

        let storage = GeminiFileStorage::new(gemini(config.relay.storage_timeout))
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let chat = GeminiChatProvider::new(gemini(config.relay.inference_timeout))
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

        tracing::info!(
            model = %config.model.name,
            api_base = %config.google.api_base,
            "Initialized Gemini providers"
        );

        Self::build_with_providers(config, Arc::new(storage), Arc::new(chat)).await
    }

    /// Build the application around the given collaborators.
    pub async fn build_with_providers(
        config: RelayConfig,
        storage: Arc<dyn FileStorageProvider>,
        chat: Arc<dyn ChatProvider>,
    ) -> Result<Self, AppError> {
        let staging = StagingArea::new(&config.staging.dir).await.map_err(|e| {
            tracing::error!(
                "Failed to initialize staging directory {}: {}",
                config.staging.dir.display(),
                e
            );
            AppError::from(e)
        })?;

        match staging.remove_leftovers().await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Removed leftover staged uploads"),
            Err(e) => tracing::warn!(error = %e, "Failed to sweep staging directory"),
        }

        let shutdown = CancellationToken::new();

        let policy = IngressPolicy {
            timeout: config.relay.storage_timeout,
            retry: RetryConfig::with_max_retries(config.relay.upload_max_retries),
        };
        let mut ingress = IngressStage::new(storage.clone(), Arc::new(staging), policy);
        let mut inference = InferenceStage::new(
            chat.clone(),
            config.model.generation.clone(),
            config.relay.prompt_mode,
            config.relay.inference_timeout,
        );

        let janitor = config.relay.registry_ttl.map(|ttl| {
            let registry = ReferenceRegistry::new(ttl);
            ingress = ingress.clone().with_registry(registry.clone());
            inference = inference.clone().with_registry(registry.clone());
            tracing::info!(ttl_secs = ttl.as_secs(), "File reference registry enabled");

            let interval = ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
            registry.spawn_janitor(interval, shutdown.clone())
        });

        let state = AppState {
            config: config.clone(),
            ingress,
            inference,
            storage,
            chat,
            shutdown: shutdown.clone(),
        };
        let router = build_router(state);

        // Port 0 = random port for testing
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            prompt_mode = ?config.relay.prompt_mode,
            staging_dir = %config.staging.dir.display(),
            "Relay service listening"
        );

        Ok(Self {
            port,
            listener,
            router,
            shutdown,
            janitor,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Cancelling this token stops the server and every in-flight request.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let shutdown = self.shutdown.clone();
        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        self.shutdown.cancel();
        if let Some(janitor) = self.janitor {
            let _ = janitor.await;
        }

        tracing::info!("Relay service stopped");
        result
    }
}
