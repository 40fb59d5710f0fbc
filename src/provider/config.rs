//! Provider configuration

use crate::error::LlmError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const LM_STUDIO_BASE_URL: &str = "http://localhost:1234/v1";
/// LM Studio ignores the key, but the OpenAI wire format wants one
pub const LM_STUDIO_API_KEY: &str = "NO_NEED";

/// Supported providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "lm_studio", alias = "lm-studio", alias = "lmstudio")]
    LmStudio,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::LmStudio => "lm_studio",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "lm_studio" | "lm-studio" | "lmstudio" => Ok(ProviderKind::LmStudio),
            _ => Err(LlmError::UnsupportedProvider {
                kind: "model",
                provider: s.to_string(),
            }),
        }
    }
}

/// Configuration for an OpenAI-compatible provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// API base URL (e.g., "https://api.openai.com/v1")
    pub base_url: String,
    /// Explicit API key, takes precedence over `api_key_env`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable name for the API key
    pub api_key_env: String,
    /// Model to use
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ProviderConfig {
    /// Create an OpenAI provider config
    pub fn openai(model: impl Into<String>) -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Create a config for a local LM Studio server
    pub fn lm_studio(model: impl Into<String>) -> Self {
        Self {
            kind: ProviderKind::LmStudio,
            base_url: LM_STUDIO_BASE_URL.to_string(),
            api_key: Some(LM_STUDIO_API_KEY.to_string()),
            api_key_env: "LM_STUDIO_API_KEY".to_string(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn for_kind(kind: ProviderKind, model: impl Into<String>) -> Self {
        match kind {
            ProviderKind::OpenAi => Self::openai(model),
            ProviderKind::LmStudio => Self::lm_studio(model),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Resolve the API key: explicit key, then environment (including `.env`)
    pub fn resolve_api_key(&self) -> Result<String, LlmError> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }

        let _ = dotenvy::dotenv();

        std::env::var(&self.api_key_env).map_err(|_| LlmError::MissingApiKey(self.api_key_env.clone()))
    }
}
