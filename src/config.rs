//! Configuration for the factory
//!
//! - Model templates: a JSON file mapping keys to model settings
//! - Buffered streaming settings as they appear in templates
//! - Telemetry settings, optionally pointing at a Langfuse OTLP endpoint

use crate::coalescer::CoalesceConfig;
use crate::error::LlmError;
use crate::provider::{ProviderConfig, ProviderKind};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the model template file
pub const DEFAULT_TEMPLATE_PATH: &str = ".template";

pub const DEFAULT_LANGFUSE_HOST: &str = "https://cloud.langfuse.com";

/// Provider options, equivalent to keyword arguments of the model constructors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ModelOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Apply these options on top of the provider preset
    pub fn into_provider_config(self, provider: ProviderKind, default_model: &str) -> ProviderConfig {
        let model = self.model.unwrap_or_else(|| default_model.to_string());
        let mut config = ProviderConfig::for_kind(provider, model);

        if let Some(base_url) = self.base_url {
            config = config.with_base_url(base_url);
        }
        if let Some(api_key) = self.api_key {
            config = config.with_api_key(api_key);
        }
        config.temperature = self.temperature;
        config.max_tokens = self.max_tokens;
        config
    }
}

/// Buffered streaming settings as written in a template.
///
/// Kept as signed integers so that negative values are reported as
/// configuration errors rather than parse errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedStreamingSettings {
    #[serde(default, alias = "buffer_size")]
    pub max_batch_size: Option<i64>,
    #[serde(default)]
    pub max_batch_chars: Option<i64>,
    #[serde(default)]
    pub max_wait_ms: Option<i64>,
    #[serde(default)]
    pub flush_on_terminal: Option<bool>,
}

impl TryFrom<&BufferedStreamingSettings> for CoalesceConfig {
    type Error = LlmError;

    fn try_from(settings: &BufferedStreamingSettings) -> Result<Self, Self::Error> {
        let mut config = CoalesceConfig::default();

        if let Some(size) = settings.max_batch_size {
            config.max_batch_size = usize::try_from(size)
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| {
                    LlmError::Configuration(format!("max_batch_size must be greater than 0, got {}", size))
                })?;
        }
        if let Some(chars) = settings.max_batch_chars {
            let chars = usize::try_from(chars).ok().filter(|c| *c > 0).ok_or_else(|| {
                LlmError::Configuration(format!("max_batch_chars must be greater than 0, got {}", chars))
            })?;
            config.max_batch_chars = Some(chars);
        }
        if let Some(wait_ms) = settings.max_wait_ms {
            let wait_ms = u64::try_from(wait_ms).map_err(|_| {
                LlmError::Configuration(format!("max_wait_ms must not be negative, got {}", wait_ms))
            })?;
            config.max_wait = Duration::from_millis(wait_ms);
        }
        if let Some(flush_on_terminal) = settings.flush_on_terminal {
            config.flush_on_terminal = flush_on_terminal;
        }

        config.validate()?;
        Ok(config)
    }
}

/// One entry of the template file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTemplate {
    /// "chat" or "embedding"
    pub llm_type: String,
    /// "openai" or "lm_studio"
    pub provider: String,
    #[serde(flatten)]
    pub options: ModelOptions,
    #[serde(default)]
    pub buffered_streaming: Option<BufferedStreamingSettings>,
    /// Attach invocation context to tracing spans
    #[serde(default)]
    pub observed: bool,
}

/// Template file: key -> model template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateFile {
    pub templates: HashMap<String, ModelTemplate>,
}

impl TemplateFile {
    /// Load templates from a JSON file
    pub fn load_from(path: &Path) -> Result<Self, LlmError> {
        if !path.exists() {
            return Err(LlmError::TemplateNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| LlmError::Template {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, key: &str) -> Result<&ModelTemplate, LlmError> {
        self.templates
            .get(key)
            .ok_or_else(|| LlmError::TemplateKeyMissing(key.to_string()))
    }

    /// List all template keys
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.templates.keys()
    }
}

/// Telemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Directory for log files and the trace database
    pub log_dir: PathBuf,

    /// Enable verbose console logging
    pub verbose: bool,

    /// OTLP/HTTP traces endpoint (e.g. a Langfuse or Jaeger collector)
    pub otel_endpoint: Option<String>,

    /// Extra headers for the OTLP exporter
    #[serde(default, skip_serializing)]
    pub otel_headers: HashMap<String, String>,

    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(".llm_factory_logs"),
            verbose: false,
            otel_endpoint: None,
            otel_headers: HashMap::new(),
            service_name: "llm-factory".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Set verbose logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set log directory
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = log_dir;
        self
    }

    /// Export traces to Langfuse through its OTLP endpoint
    pub fn with_langfuse(mut self, host: &str, public_key: &str, secret_key: &str) -> Self {
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", public_key, secret_key));

        self.otel_endpoint = Some(format!(
            "{}/api/public/otel/v1/traces",
            host.trim_end_matches('/')
        ));
        self.otel_headers
            .insert("Authorization".to_string(), format!("Basic {}", credentials));
        self
    }

    /// Build from the environment (and `.env`).
    ///
    /// Langfuse export is enabled when both `LANGFUSE_PUBLIC_KEY` and
    /// `LANGFUSE_SECRET_KEY` are set; `LANGFUSE_HOST` defaults to the cloud host.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let mut config = Self::default();
        if let Ok(dir) = std::env::var("LLM_FACTORY_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        if let (Ok(public_key), Ok(secret_key)) = (
            std::env::var("LANGFUSE_PUBLIC_KEY"),
            std::env::var("LANGFUSE_SECRET_KEY"),
        ) {
            let host = std::env::var("LANGFUSE_HOST").unwrap_or_else(|_| DEFAULT_LANGFUSE_HOST.to_string());
            config = config.with_langfuse(&host, &public_key, &secret_key);
        }

        config
    }
}
