//! Error type shared by the factory, the providers and the decorators.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building or calling a model
#[derive(Debug, Error)]
pub enum LlmError {
    /// Invalid construction parameters (raised before any streaming starts)
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("unsupported LLM provider for {kind}: {provider}")]
    UnsupportedProvider { kind: &'static str, provider: String },

    #[error("unsupported LLM type: {0}")]
    UnsupportedKind(String),

    /// A decorator was applied to a model kind it cannot wrap
    #[error("decorator `{decorator}` cannot wrap {kind} models")]
    UnsupportedDecorator {
        decorator: &'static str,
        kind: &'static str,
    },

    #[error("cannot find the template file: {}", .0.display())]
    TemplateNotFound(PathBuf),

    #[error("cannot find the key in the template: {0}")]
    TemplateKeyMissing(String),

    #[error("failed to parse template {}: {source}", path.display())]
    Template {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} not found in environment")]
    MissingApiKey(String),

    #[error("API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// The provider stream broke after it started
    #[error("stream error: {0}")]
    Stream(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    OpenAi(#[from] async_openai::error::OpenAIError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = LlmError> = std::result::Result<T, E>;
