#![allow(dead_code)]

use relay_service::config::{
    GoogleConfig, ModelConfig, RelayConfig, RelayPolicyConfig, StagingConfig,
};
use relay_service::services::providers::mock::{MockChatProvider, MockFileStorage};
use relay_service::services::providers::GenerationParams;
use relay_service::services::PromptMode;
use relay_service::startup::Application;
use secrecy::Secret;
use service_core::config::Config as CoreConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub client: reqwest::Client,
    pub storage: Arc<MockFileStorage>,
    pub chat: Arc<MockChatProvider>,
    pub staging_dir: TempDir,
    pub shutdown: CancellationToken,
}

/// Configuration pointing at a throwaway staging directory, on a random port.
pub fn test_config(staging_dir: &Path) -> RelayConfig {
    RelayConfig {
        common: CoreConfig { port: 0 },
        google: GoogleConfig {
            api_key: Secret::new("test-api-key".to_string()),
            api_base: "http://127.0.0.1:9".to_string(),
        },
        model: ModelConfig {
            name: "gemini-1.5-flash".to_string(),
            generation: GenerationParams::default(),
        },
        staging: StagingConfig {
            dir: staging_dir.to_path_buf(),
            max_upload_bytes: 1024 * 1024,
        },
        relay: RelayPolicyConfig {
            storage_timeout: Duration::from_secs(5),
            inference_timeout: Duration::from_secs(5),
            upload_max_retries: 0,
            prompt_mode: PromptMode::History,
            expose_error_details: true,
            registry_ttl: None,
        },
        static_dir: staging_dir.join("public"),
        otlp_endpoint: None,
    }
}

impl TestApp {
    pub async fn spawn(storage: MockFileStorage, chat: MockChatProvider) -> Self {
        Self::spawn_with(storage, chat, |_| {}).await
    }

    pub async fn spawn_with(
        storage: MockFileStorage,
        chat: MockChatProvider,
        customize: impl FnOnce(&mut RelayConfig),
    ) -> Self {
        let staging_dir = TempDir::new().expect("Failed to create staging dir");
        let mut config = test_config(staging_dir.path());
        customize(&mut config);

        let storage = Arc::new(storage);
        let chat = Arc::new(chat);

        let app = Application::build_with_providers(config, storage.clone(), chat.clone())
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let shutdown = app.shutdown_token();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            client,
            storage,
            chat,
            staging_dir,
            shutdown,
        }
    }

    pub async fn upload(&self, name: &str, mime: &str, bytes: &[u8]) -> reqwest::Response {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(name.to_string())
            .mime_str(mime)
            .expect("Invalid MIME type");
        let form = reqwest::multipart::Form::new().part("file", part);

        self.client
            .post(format!("{}/upload", self.address))
            .multipart(form)
            .send()
            .await
            .expect("Failed to send upload request")
    }

    pub async fn process(&self, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/process", self.address))
            .json(body)
            .send()
            .await
            .expect("Failed to send process request")
    }

    /// Names of files currently in the staging directory.
    pub fn staged_files(&self) -> Vec<String> {
        std::fs::read_dir(self.staging_dir.path())
            .expect("Failed to read staging dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
