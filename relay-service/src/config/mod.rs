use crate::services::providers::gemini::GEMINI_API_BASE;
use crate::services::providers::GenerationParams;
use crate::services::PromptMode;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default cap on an uploaded file (20MB).
const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub common: core_config::Config,
    pub google: GoogleConfig,
    pub model: ModelConfig,
    pub staging: StagingConfig,
    pub relay: RelayPolicyConfig,
    /// Directory served for any path not matched by an API route.
    pub static_dir: PathBuf,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub api_key: Secret<String>,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Chat model name (e.g., gemini-1.5-flash)
    pub name: String,
    pub generation: GenerationParams,
}

#[derive(Debug, Clone)]
pub struct StagingConfig {
    pub dir: PathBuf,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RelayPolicyConfig {
    pub storage_timeout: Duration,
    pub inference_timeout: Duration,
    pub upload_max_retries: u32,
    pub prompt_mode: PromptMode,
    /// Return raw provider messages to clients instead of a generic message.
    pub expose_error_details: bool,
    /// Reference registry TTL; `None` disables the registry.
    pub registry_ttl: Option<Duration>,
}

impl RelayConfig {
    pub fn load() -> Result<Self, AppError> {
        // Load common config (handles .env, APP__ prefix and PORT)
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let defaults = GenerationParams::default();

        Ok(RelayConfig {
            common: common_config,
            google: GoogleConfig {
                api_key: Secret::new(get_api_key(is_prod)?),
                api_base: get_env("GEMINI_API_BASE", Some(GEMINI_API_BASE), is_prod)?,
            },
            model: ModelConfig {
                name: get_env("GENAI_MODEL", Some("gemini-1.5-flash"), is_prod)?,
                generation: GenerationParams {
                    temperature: get_parsed("GENAI_TEMPERATURE", defaults.temperature)?,
                    top_p: get_parsed("GENAI_TOP_P", defaults.top_p)?,
                    top_k: get_parsed("GENAI_TOP_K", defaults.top_k)?,
                    max_output_tokens: get_parsed(
                        "GENAI_MAX_OUTPUT_TOKENS",
                        defaults.max_output_tokens,
                    )?,
                    response_mime_type: get_env(
                        "GENAI_RESPONSE_MIME_TYPE",
                        Some(defaults.response_mime_type.as_str()),
                        is_prod,
                    )?,
                },
            },
            staging: StagingConfig {
                dir: get_env("RELAY_STAGING_DIR", Some("uploads"), is_prod)?.into(),
                max_upload_bytes: get_parsed("RELAY_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            },
            relay: RelayPolicyConfig {
                storage_timeout: Duration::from_secs(get_parsed("RELAY_STORAGE_TIMEOUT_SECS", 120)?),
                inference_timeout: Duration::from_secs(get_parsed("RELAY_INFERENCE_TIMEOUT_SECS", 120)?),
                upload_max_retries: get_parsed("RELAY_UPLOAD_MAX_RETRIES", 2)?,
                prompt_mode: get_parsed("RELAY_PROMPT_MODE", PromptMode::History)?,
                expose_error_details: get_parsed("RELAY_EXPOSE_ERROR_DETAILS", true)?,
                registry_ttl: parse_registry_ttl(
                    env::var("RELAY_REGISTRY_TTL_SECS").ok().as_deref(),
                )?,
            },
            static_dir: get_env("RELAY_STATIC_DIR", Some("public"), is_prod)?.into(),
            otlp_endpoint: non_empty(env::var("OTLP_ENDPOINT").ok()),
        })
    }
}

/// `API_KEY` is the historical name; `GOOGLE_API_KEY` is accepted too.
fn get_api_key(is_prod: bool) -> Result<String, AppError> {
    match env::var("API_KEY") {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => get_env("GOOGLE_API_KEY", None, is_prod)
            .map_err(|_| AppError::ConfigError(anyhow::anyhow!("API_KEY is required but not set"))),
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod && default.is_none() {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Read and parse `key`, falling back to `default` when unset.
fn get_parsed<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(val) => parse_value(key, &val),
        Err(_) => Ok(default),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Unset disables the registry; zero would expire every reference on arrival.
fn parse_registry_ttl(value: Option<&str>) -> Result<Option<Duration>, AppError> {
    let Some(value) = value else {
        return Ok(None);
    };
    match parse_value::<u64>("RELAY_REGISTRY_TTL_SECS", value)? {
        0 => Err(AppError::ConfigError(anyhow::anyhow!(
            "RELAY_REGISTRY_TTL_SECS must be greater than 0 (unset it to disable the registry)"
        ))),
        secs => Ok(Some(Duration::from_secs(secs))),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!("Invalid value for {}: {} ({})", key, value, e))
    })
}
