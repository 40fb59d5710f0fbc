//! Buffered streaming decorator
//!
//! Streams from the wrapped model go through a [`StreamCoalescer`], so the
//! consumer sees fewer, larger chunks. Non-streaming calls pass through.

use super::Decorator;
use crate::chunk::{Chunk, ChunkStream};
use crate::coalescer::{CoalesceConfig, MergedEvent, StreamCoalescer};
use crate::context::InvocationContext;
use crate::error::LlmError;
use crate::message::ChatMessage;
use crate::model::{ChatModel, Completion};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};

/// Decorator applying stream coalescing to chat models
#[derive(Debug, Clone)]
pub struct BufferedStreaming {
    coalescer: StreamCoalescer,
}

impl BufferedStreaming {
    pub fn new(config: CoalesceConfig) -> Result<Self, LlmError> {
        Ok(Self {
            coalescer: StreamCoalescer::new(config)?,
        })
    }

    /// Default limits with a custom batch size
    pub fn with_buffer_size(buffer_size: usize) -> Result<Self, LlmError> {
        Self::new(CoalesceConfig::default().with_max_batch_size(buffer_size))
    }

    pub fn config(&self) -> &CoalesceConfig {
        self.coalescer.config()
    }
}

impl Decorator for BufferedStreaming {
    fn name(&self) -> &'static str {
        "buffered_streaming"
    }

    fn decorate_chat(&self, model: Box<dyn ChatModel>) -> Result<Box<dyn ChatModel>, LlmError> {
        Ok(Box::new(BufferedChatModel::new(model, self.coalescer.clone())))
    }
}

pub struct BufferedChatModel {
    inner: Box<dyn ChatModel>,
    coalescer: StreamCoalescer,
}

impl BufferedChatModel {
    pub fn new(inner: Box<dyn ChatModel>, coalescer: StreamCoalescer) -> Self {
        Self { inner, coalescer }
    }

    /// Stream merged events, including the reason each batch was flushed
    pub async fn stream_events(
        &self,
        messages: &[ChatMessage],
        ctx: &InvocationContext,
    ) -> Result<impl Stream<Item = Result<MergedEvent, LlmError>> + Send + 'static, LlmError> {
        let source = self.inner.stream(messages, ctx).await?;
        Ok(self.coalescer.coalesce(source))
    }
}

#[async_trait]
impl ChatModel for BufferedChatModel {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        ctx: &InvocationContext,
    ) -> Result<Completion, LlmError> {
        self.inner.invoke(messages, ctx).await
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        ctx: &InvocationContext,
    ) -> Result<ChunkStream, LlmError> {
        let events = self.stream_events(messages, ctx).await?;
        Ok(Box::pin(events.map_ok(Chunk::from)))
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalescer::FlushReason;
    use crate::decorator::fixtures::{ScriptedChatModel, ScriptedEmbeddingModel, Step};
    use crate::model::Llm;
    use futures::StreamExt;
    use std::time::Duration;

    fn buffered(size: usize, model: ScriptedChatModel) -> BufferedChatModel {
        let coalescer = StreamCoalescer::new(
            CoalesceConfig::default()
                .with_max_batch_size(size)
                .with_max_wait(Duration::from_secs(1)),
        )
        .unwrap();
        BufferedChatModel::new(Box::new(model), coalescer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_is_coalesced() {
        let model = buffered(2, ScriptedChatModel::hello());
        let ctx = InvocationContext::for_session("s-1");

        let chunks: Vec<Chunk> = model
            .stream(&[ChatMessage::user("hi")], &ctx)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;

        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["Hello", ", world", ""]);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert!(chunks[2].is_terminal());
        assert_eq!(
            chunks[2].metadata.as_ref().and_then(|m| m.usage).map(|u| u.output),
            Some(4)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_reasons_are_visible() {
        let model = buffered(3, ScriptedChatModel::hello());
        let ctx = InvocationContext::for_session("s-1");

        let events: Vec<MergedEvent> = model
            .stream_events(&[ChatMessage::user("hi")], &ctx)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].content, "Hello, wor");
        assert_eq!(events[0].reason, FlushReason::Size);
        assert_eq!(events[1].content, "ld");
        assert_eq!(events[1].reason, FlushReason::Terminal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_flushes_on_timeout() {
        // Steps arrive at 300, 600, 900, 1200 and 1500ms
        let inner = ScriptedChatModel::hello().with_interval(Duration::from_millis(300));
        let coalescer = StreamCoalescer::new(
            CoalesceConfig::default()
                .with_max_batch_size(10)
                .with_max_wait(Duration::from_millis(500)),
        )
        .unwrap();
        let model = BufferedChatModel::new(Box::new(inner), coalescer);
        let ctx = InvocationContext::for_session("s-1");

        let events: Vec<MergedEvent> = model
            .stream_events(&[ChatMessage::user("hi")], &ctx)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;

        let summary: Vec<(&str, FlushReason)> = events
            .iter()
            .map(|e| (e.content.as_str(), e.reason))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("Hello", FlushReason::Timeout),
                (", world", FlushReason::Timeout),
                ("", FlushReason::Terminal),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_error_after_partial_batch() {
        let model = buffered(
            10,
            ScriptedChatModel::new(vec![Step::Text("par"), Step::Text("tial"), Step::Fail("connection reset")]),
        );
        let ctx = InvocationContext::for_session("s-1");

        let items: Vec<_> = model
            .stream(&[ChatMessage::user("hi")], &ctx)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().content, "partial");
        assert!(matches!(&items[1], Err(LlmError::Stream(m)) if m == "connection reset"));
    }

    #[tokio::test]
    async fn test_invoke_passes_through_with_context() {
        let inner = ScriptedChatModel::hello();
        let seen = inner.seen();
        let model = buffered(2, inner);
        let ctx = InvocationContext::for_session("s-9").with_user_id("bob");

        let completion = model.invoke(&[ChatMessage::user("hi")], &ctx).await.unwrap();
        assert_eq!(completion.content, "Hello, world");
        assert_eq!(seen.lock().as_slice(), &[ctx]);
        assert_eq!(model.provider_name(), "scripted");
        assert_eq!(model.model(), "scripted-chat");
    }

    #[test]
    fn test_rejects_embedding_models() {
        let decorator = BufferedStreaming::with_buffer_size(4).unwrap();
        let result = decorator.decorate(Llm::Embedding(Box::new(ScriptedEmbeddingModel)));
        assert!(matches!(
            result,
            Err(LlmError::UnsupportedDecorator {
                decorator: "buffered_streaming",
                kind: "embedding"
            })
        ));
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(matches!(
            BufferedStreaming::with_buffer_size(0),
            Err(LlmError::Configuration(_))
        ));
    }
}
