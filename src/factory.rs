//! Model factory
//!
//! Builds chat and embedding models from a kind, a provider and options,
//! then applies decorators in order. Templates describe the same inputs in a
//! JSON file so callers can pick a model by key.

use crate::coalescer::CoalesceConfig;
use crate::config::{ModelOptions, ModelTemplate, TemplateFile, DEFAULT_TEMPLATE_PATH};
use crate::decorator::{BufferedStreaming, Decorator, ObservabilityInjector};
use crate::error::LlmError;
use crate::model::{ChatModel, EmbeddingModel, Llm, LlmKind};
use crate::provider::{ProviderClient, ProviderKind};
use std::path::Path;

pub const DEFAULT_OPENAI_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-small";
/// LM Studio serves whichever model is loaded
pub const DEFAULT_LM_STUDIO_MODEL: &str = "local-model";

/// Builds chat models for a provider
pub struct ChatModelFactory;

impl ChatModelFactory {
    pub fn create_model(
        provider: ProviderKind,
        options: ModelOptions,
    ) -> Result<Box<dyn ChatModel>, LlmError> {
        let default_model = match provider {
            ProviderKind::OpenAi => DEFAULT_OPENAI_CHAT_MODEL,
            ProviderKind::LmStudio => DEFAULT_LM_STUDIO_MODEL,
        };
        let config = options.into_provider_config(provider, default_model);
        Ok(Box::new(ProviderClient::new(config)?))
    }
}

/// Builds embedding models for a provider
pub struct EmbeddingModelFactory;

impl EmbeddingModelFactory {
    pub fn create_model(
        provider: ProviderKind,
        options: ModelOptions,
    ) -> Result<Box<dyn EmbeddingModel>, LlmError> {
        let default_model = match provider {
            ProviderKind::OpenAi => DEFAULT_OPENAI_EMBEDDING_MODEL,
            ProviderKind::LmStudio => DEFAULT_LM_STUDIO_MODEL,
        };
        let config = options.into_provider_config(provider, default_model);
        Ok(Box::new(ProviderClient::new(config)?))
    }
}

pub struct LlmFactory;

impl LlmFactory {
    /// Build a model and apply `decorators` in order (the last is outermost)
    pub fn create_llm(
        kind: LlmKind,
        provider: ProviderKind,
        options: ModelOptions,
        decorators: &[Box<dyn Decorator>],
    ) -> Result<Llm, LlmError> {
        let llm = match kind {
            LlmKind::Chat => Llm::Chat(ChatModelFactory::create_model(provider, options)?),
            LlmKind::Embedding => Llm::Embedding(EmbeddingModelFactory::create_model(provider, options)?),
        };
        let llm = Self::decorate(llm, decorators)?;

        tracing::debug!(kind = %kind, provider = %provider, "Created model");
        Ok(llm)
    }

    /// Wrap `llm` in each decorator in turn, so the last is outermost
    pub fn decorate(mut llm: Llm, decorators: &[Box<dyn Decorator>]) -> Result<Llm, LlmError> {
        for decorator in decorators {
            tracing::debug!(decorator = decorator.name(), kind = %llm.kind(), "Applying decorator");
            llm = decorator.decorate(llm)?;
        }
        Ok(llm)
    }

    /// Same as [`create_llm`](Self::create_llm), with kind and provider given
    /// by name
    pub fn create_llm_by_name(
        kind: &str,
        provider: &str,
        options: ModelOptions,
        decorators: &[Box<dyn Decorator>],
    ) -> Result<Llm, LlmError> {
        Self::create_llm(kind.parse()?, provider.parse()?, options, decorators)
    }

    /// Build the model stored under `key` in the template file at `path`
    pub fn from_template(key: &str, path: impl AsRef<Path>) -> Result<Llm, LlmError> {
        let templates = TemplateFile::load_from(path.as_ref())?;
        Self::from_model_template(templates.get(key)?)
    }

    /// [`from_template`](Self::from_template) with `.template` in the
    /// working directory
    pub fn from_default_template(key: &str) -> Result<Llm, LlmError> {
        Self::from_template(key, DEFAULT_TEMPLATE_PATH)
    }

    pub fn from_model_template(template: &ModelTemplate) -> Result<Llm, LlmError> {
        let kind: LlmKind = template.llm_type.parse()?;
        let provider = template.provider.parse::<ProviderKind>().map_err(|_| {
            LlmError::UnsupportedProvider {
                kind: kind.as_str(),
                provider: template.provider.clone(),
            }
        })?;

        let mut decorators: Vec<Box<dyn Decorator>> = Vec::new();
        if let Some(settings) = &template.buffered_streaming {
            let config = CoalesceConfig::try_from(settings)?;
            decorators.push(Box::new(BufferedStreaming::new(config)?));
        }
        if template.observed {
            decorators.push(Box::new(ObservabilityInjector::new()));
        }

        Self::create_llm(kind, provider, template.options.clone(), &decorators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::context::InvocationContext;
    use crate::decorator::fixtures::{ScriptedChatModel, ScriptedEmbeddingModel};
    use crate::message::ChatMessage;
    use crate::telemetry::Telemetry;
    use futures::StreamExt;
    use tempfile::TempDir;
    use tracing_subscriber::layer::SubscriberExt;

    const TEMPLATES: &str = r#"{
        "local-chat": {
            "llm_type": "chat",
            "provider": "lm_studio",
            "model": "gemma-3-12b-it",
            "temperature": 0.2
        },
        "local-embedding": {
            "llm_type": "embedding",
            "provider": "lm_studio",
            "model": "text-embedding-nomic-embed-text-v1.5"
        },
        "buffered-chat": {
            "llm_type": "chat",
            "provider": "lm_studio",
            "buffered_streaming": {"buffer_size": 4},
            "observed": true
        },
        "buffered-embedding": {
            "llm_type": "embedding",
            "provider": "lm_studio",
            "buffered_streaming": {"buffer_size": 4}
        },
        "zero-buffer": {
            "llm_type": "chat",
            "provider": "lm_studio",
            "buffered_streaming": {"buffer_size": 0}
        },
        "bad-provider": {"llm_type": "embedding", "provider": "anthropic"},
        "bad-kind": {"llm_type": "completion", "provider": "openai"}
    }"#;

    fn template_file() -> (TempDir, std::path::PathBuf) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".template");
        std::fs::write(&path, TEMPLATES).unwrap();
        (temp, path)
    }

    #[test]
    fn test_create_lm_studio_chat() {
        let llm = LlmFactory::create_llm(
            LlmKind::Chat,
            ProviderKind::LmStudio,
            ModelOptions::default(),
            &[],
        )
        .unwrap();

        assert_eq!(llm.kind(), LlmKind::Chat);
        let model = llm.into_chat().unwrap();
        assert_eq!(model.provider_name(), "lm_studio");
        assert_eq!(model.model(), DEFAULT_LM_STUDIO_MODEL);
    }

    #[test]
    fn test_create_openai_embedding_with_explicit_key() {
        let llm = LlmFactory::create_llm_by_name(
            "embedding",
            "openai",
            ModelOptions::default().with_api_key("sk-test"),
            &[],
        )
        .unwrap();

        let model = llm.into_embedding().unwrap();
        assert_eq!(model.provider_name(), "openai");
        assert_eq!(model.model(), DEFAULT_OPENAI_EMBEDDING_MODEL);
    }

    #[test]
    fn test_unknown_names() {
        assert!(matches!(
            LlmFactory::create_llm_by_name("chat", "anthropic", ModelOptions::default(), &[]),
            Err(LlmError::UnsupportedProvider { .. })
        ));
        assert!(matches!(
            LlmFactory::create_llm_by_name("rerank", "openai", ModelOptions::default(), &[]),
            Err(LlmError::UnsupportedKind(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observed_span_wraps_buffered_stream() {
        let temp = TempDir::new().unwrap();
        let telemetry = Telemetry::open(temp.path()).unwrap();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(telemetry.trace_layer()),
        );

        let decorators: Vec<Box<dyn Decorator>> = vec![
            Box::new(BufferedStreaming::with_buffer_size(2).unwrap()),
            Box::new(ObservabilityInjector::new()),
        ];
        let llm = LlmFactory::decorate(Llm::Chat(Box::new(ScriptedChatModel::hello())), &decorators).unwrap();
        let model = llm.into_chat().unwrap();
        assert_eq!(model.provider_name(), "scripted");

        let ctx = InvocationContext::for_session("ordered");
        let chunks: Vec<Chunk> = model
            .stream(&[ChatMessage::user("hi")], &ctx)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;

        // Consumer sees merged chunks from the inner buffered model
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["Hello", ", world", ""]);

        let traces = telemetry.session_traces("ordered").unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].operation, "chat_stream");
        assert_eq!(traces[0].response_content.as_deref(), Some("Hello, world"));
        assert_eq!(traces[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(traces[0].output_tokens, Some(4));
    }

    #[test]
    fn test_decorator_failure_stops_creation() {
        let decorators: Vec<Box<dyn Decorator>> = vec![
            Box::new(ObservabilityInjector::new()),
            Box::new(BufferedStreaming::with_buffer_size(2).unwrap()),
        ];
        assert!(matches!(
            LlmFactory::decorate(Llm::Embedding(Box::new(ScriptedEmbeddingModel)), &decorators),
            Err(LlmError::UnsupportedDecorator { decorator: "buffered_streaming", .. })
        ));
    }

    #[test]
    fn test_from_template() {
        let (_temp, path) = template_file();

        let chat = LlmFactory::from_template("local-chat", &path).unwrap().into_chat().unwrap();
        assert_eq!(chat.model(), "gemma-3-12b-it");

        let embedding = LlmFactory::from_template("local-embedding", &path)
            .unwrap()
            .into_embedding()
            .unwrap();
        assert_eq!(embedding.model(), "text-embedding-nomic-embed-text-v1.5");

        let buffered = LlmFactory::from_template("buffered-chat", &path).unwrap();
        assert_eq!(buffered.kind(), LlmKind::Chat);
    }

    #[test]
    fn test_template_errors() {
        let (temp, path) = template_file();

        assert!(matches!(
            LlmFactory::from_template("nope", &path),
            Err(LlmError::TemplateKeyMissing(key)) if key == "nope"
        ));
        assert!(matches!(
            LlmFactory::from_template("local-chat", temp.path().join("missing.json")),
            Err(LlmError::TemplateNotFound(_))
        ));
        assert!(matches!(
            LlmFactory::from_template("bad-provider", &path),
            Err(LlmError::UnsupportedProvider { kind: "embedding", .. })
        ));
        assert!(matches!(
            LlmFactory::from_template("bad-kind", &path),
            Err(LlmError::UnsupportedKind(_))
        ));
        assert!(matches!(
            LlmFactory::from_template("buffered-embedding", &path),
            Err(LlmError::UnsupportedDecorator { .. })
        ));
        assert!(matches!(
            LlmFactory::from_template("zero-buffer", &path),
            Err(LlmError::Configuration(_))
        ));
    }
}
