//! Model interfaces
//!
//! Providers and decorators implement the same traits, so a decorated model
//! can stand in anywhere the plain provider client could.

use crate::chunk::{ChunkMetadata, ChunkStream};
use crate::context::InvocationContext;
use crate::error::LlmError;
use crate::message::ChatMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A full, non-streamed model response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub metadata: Option<ChunkMetadata>,
}

/// Chat model interface
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate a complete response
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        ctx: &InvocationContext,
    ) -> Result<Completion, LlmError>;

    /// Stream the response as chunks
    async fn stream(
        &self,
        messages: &[ChatMessage],
        ctx: &InvocationContext,
    ) -> Result<ChunkStream, LlmError>;

    /// Provider identifier, e.g. "openai"
    fn provider_name(&self) -> &str;

    /// Model identifier sent to the provider
    fn model(&self) -> &str;
}

/// Embedding model interface
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed_documents(
        &self,
        texts: &[String],
        ctx: &InvocationContext,
    ) -> Result<Vec<Vec<f32>>, LlmError>;

    async fn embed_query(&self, text: &str, ctx: &InvocationContext) -> Result<Vec<f32>, LlmError> {
        self.embed_documents(&[text.to_string()], ctx)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no embedding returned".to_string()))
    }

    fn provider_name(&self) -> &str;

    fn model(&self) -> &str;
}

/// Which kind of model to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmKind {
    Chat,
    Embedding,
}

impl LlmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmKind::Chat => "chat",
            LlmKind::Embedding => "embedding",
        }
    }
}

impl fmt::Display for LlmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(LlmKind::Chat),
            "embedding" => Ok(LlmKind::Embedding),
            other => Err(LlmError::UnsupportedKind(other.to_string())),
        }
    }
}

/// A model built by the factory
pub enum Llm {
    Chat(Box<dyn ChatModel>),
    Embedding(Box<dyn EmbeddingModel>),
}

impl Llm {
    pub fn kind(&self) -> LlmKind {
        match self {
            Llm::Chat(_) => LlmKind::Chat,
            Llm::Embedding(_) => LlmKind::Embedding,
        }
    }

    pub fn into_chat(self) -> Result<Box<dyn ChatModel>, LlmError> {
        match self {
            Llm::Chat(model) => Ok(model),
            Llm::Embedding(_) => Err(LlmError::UnsupportedKind(
                "expected a chat model, got an embedding model".to_string(),
            )),
        }
    }

    pub fn into_embedding(self) -> Result<Box<dyn EmbeddingModel>, LlmError> {
        match self {
            Llm::Embedding(model) => Ok(model),
            Llm::Chat(_) => Err(LlmError::UnsupportedKind(
                "expected an embedding model, got a chat model".to_string(),
            )),
        }
    }
}

impl fmt::Debug for Llm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Llm::Chat(model) => f
                .debug_struct("Chat")
                .field("provider", &model.provider_name())
                .field("model", &model.model())
                .finish(),
            Llm::Embedding(model) => f
                .debug_struct("Embedding")
                .field("provider", &model.provider_name())
                .field("model", &model.model())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!("chat".parse::<LlmKind>().unwrap(), LlmKind::Chat);
        assert_eq!("embedding".parse::<LlmKind>().unwrap(), LlmKind::Embedding);
        assert!(matches!(
            "completion".parse::<LlmKind>(),
            Err(LlmError::UnsupportedKind(_))
        ));
    }
}
