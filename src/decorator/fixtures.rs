//! Scripted models for decorator tests

use crate::chunk::{Chunk, ChunkMetadata, ChunkStream, TokenUsage};
use crate::context::InvocationContext;
use crate::error::LlmError;
use crate::message::ChatMessage;
use crate::model::{ChatModel, Completion, EmbeddingModel};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// One step of a scripted stream
#[derive(Debug, Clone)]
pub enum Step {
    Text(&'static str),
    Finish(&'static str, TokenUsage),
    Fail(&'static str),
}

/// Chat model that replays a fixed script, one step every `interval`
pub struct ScriptedChatModel {
    steps: Vec<Step>,
    interval: Duration,
    seen: Arc<Mutex<Vec<InvocationContext>>>,
}

impl ScriptedChatModel {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            interval: Duration::from_millis(10),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// "Hello, world" in four pieces, then a terminal chunk
    pub fn hello() -> Self {
        Self::new(vec![
            Step::Text("Hel"),
            Step::Text("lo"),
            Step::Text(", wor"),
            Step::Text("ld"),
            Step::Finish(
                "stop",
                TokenUsage {
                    input: 7,
                    output: 4,
                    reasoning: None,
                },
            ),
        ])
    }

    /// Contexts received so far, shared with the model
    pub fn seen(&self) -> Arc<Mutex<Vec<InvocationContext>>> {
        Arc::clone(&self.seen)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn invoke(
        &self,
        _messages: &[ChatMessage],
        ctx: &InvocationContext,
    ) -> Result<Completion, LlmError> {
        self.seen.lock().push(ctx.clone());

        let mut content = String::new();
        let mut metadata = None;
        for step in &self.steps {
            match step {
                Step::Text(text) => content.push_str(text),
                Step::Finish(reason, usage) => {
                    metadata = Some(ChunkMetadata {
                        finish_reason: Some(reason.to_string()),
                        usage: Some(*usage),
                    })
                }
                Step::Fail(message) => return Err(LlmError::Stream(message.to_string())),
            }
        }
        Ok(Completion { content, metadata })
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        ctx: &InvocationContext,
    ) -> Result<ChunkStream, LlmError> {
        self.seen.lock().push(ctx.clone());

        let steps = self.steps.clone();
        let interval = self.interval;
        Ok(Box::pin(async_stream::stream! {
            for (index, step) in steps.into_iter().enumerate() {
                tokio::time::sleep(interval).await;
                let index = index as u64;
                match step {
                    Step::Text(text) => yield Ok(Chunk::text(index, text)),
                    Step::Finish(reason, usage) => yield Ok(Chunk::terminal(index, "", ChunkMetadata {
                        finish_reason: Some(reason.to_string()),
                        usage: Some(usage),
                    })),
                    Step::Fail(message) => {
                        yield Err(LlmError::Stream(message.to_string()));
                        return;
                    }
                }
            }
        }))
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-chat"
    }
}

/// Embedding model returning `[len, index]` for each text
pub struct ScriptedEmbeddingModel;

#[async_trait]
impl EmbeddingModel for ScriptedEmbeddingModel {
    async fn embed_documents(
        &self,
        texts: &[String],
        _ctx: &InvocationContext,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts
            .iter()
            .enumerate()
            .map(|(i, t)| vec![t.len() as f32, i as f32])
            .collect())
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-embedding"
    }
}
