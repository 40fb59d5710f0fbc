//! Incremental model output
//!
//! Providers emit a sequence of [`Chunk`]s. Only the last chunk of a
//! generation carries [`ChunkMetadata`] (finish reason, token usage).

use crate::error::LlmError;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Token usage reported at the end of a generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: Option<u64>,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Completion annotations attached to a terminal chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// One unit of partial model output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Sequence index assigned by the source, strictly increasing
    pub index: u64,
    /// Text delta
    pub content: String,
    /// Reasoning delta (extended thinking), empty for most models
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    /// Present only on the terminal chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChunkMetadata>,
}

impl Chunk {
    pub fn text(index: u64, content: impl Into<String>) -> Self {
        Self {
            index,
            content: content.into(),
            reasoning: String::new(),
            metadata: None,
        }
    }

    pub fn reasoning(index: u64, reasoning: impl Into<String>) -> Self {
        Self {
            index,
            content: String::new(),
            reasoning: reasoning.into(),
            metadata: None,
        }
    }

    /// Terminal chunk carrying completion metadata
    pub fn terminal(index: u64, content: impl Into<String>, metadata: ChunkMetadata) -> Self {
        Self {
            index,
            content: content.into(),
            reasoning: String::new(),
            metadata: Some(metadata),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.metadata.is_some()
    }

    /// Length of the text delta in chars
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Stream of chunks returned by [`ChatModel::stream`](crate::ChatModel::stream)
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, LlmError>> + Send>>;
