//! Observability decorator
//!
//! Wraps each call in a `gen_ai.*` tracing span carrying the invocation
//! context (`session.id`, `user.id`, `langfuse.tags`). Whatever subscriber is
//! installed decides where spans go: the SQLite trace layer, an OTLP
//! exporter pointed at Langfuse, or nowhere.

use super::Decorator;
use crate::chunk::{Chunk, ChunkMetadata, ChunkStream, TokenUsage};
use crate::context::InvocationContext;
use crate::error::LlmError;
use crate::message::{messages_to_json, ChatMessage};
use crate::model::{ChatModel, Completion, EmbeddingModel};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::field::{display, Empty};
use tracing::{Instrument, Span};

/// Decorator attaching invocation context to tracing spans
#[derive(Debug, Clone, Copy, Default)]
pub struct ObservabilityInjector;

impl ObservabilityInjector {
    pub fn new() -> Self {
        Self
    }
}

impl Decorator for ObservabilityInjector {
    fn name(&self) -> &'static str {
        "observability"
    }

    fn decorate_chat(&self, model: Box<dyn ChatModel>) -> Result<Box<dyn ChatModel>, LlmError> {
        Ok(Box::new(ObservedChatModel { inner: model }))
    }

    fn decorate_embedding(
        &self,
        model: Box<dyn EmbeddingModel>,
    ) -> Result<Box<dyn EmbeddingModel>, LlmError> {
        Ok(Box::new(ObservedEmbeddingModel { inner: model }))
    }
}

fn call_span(operation: &str, provider: &str, model: &str, ctx: &InvocationContext, request: &str) -> Span {
    let name = format!("{} {}", operation, model);
    tracing::info_span!(
        "gen_ai.call",
        otel.name = name.as_str(),
        gen_ai.operation.name = operation,
        gen_ai.provider.name = provider,
        gen_ai.request.model = model,
        gen_ai.request.body = request,
        session.id = ctx.session_id.as_str(),
        user.id = ctx.user_id.as_deref(),
        langfuse.tags = %ctx.tags_json(),
        gen_ai.response.content = Empty,
        gen_ai.response.finish_reason = Empty,
        gen_ai.usage.input_tokens = Empty,
        gen_ai.usage.output_tokens = Empty,
        error = Empty,
    )
}

fn record_metadata(span: &Span, metadata: Option<&ChunkMetadata>) {
    let Some(metadata) = metadata else {
        return;
    };
    if let Some(reason) = &metadata.finish_reason {
        span.record("gen_ai.response.finish_reason", reason.as_str());
    }
    if let Some(usage) = metadata.usage {
        span.record("gen_ai.usage.input_tokens", usage.input);
        span.record("gen_ai.usage.output_tokens", usage.output);
    }
}

pub struct ObservedChatModel {
    inner: Box<dyn ChatModel>,
}

impl ObservedChatModel {
    pub fn new(inner: Box<dyn ChatModel>) -> Self {
        Self { inner }
    }

    fn span(&self, operation: &str, messages: &[ChatMessage], ctx: &InvocationContext) -> Span {
        call_span(
            operation,
            self.inner.provider_name(),
            self.inner.model(),
            ctx,
            &messages_to_json(messages).to_string(),
        )
    }
}

#[async_trait]
impl ChatModel for ObservedChatModel {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        ctx: &InvocationContext,
    ) -> Result<Completion, LlmError> {
        let span = self.span("chat", messages, ctx);
        let result = self
            .inner
            .invoke(messages, ctx)
            .instrument(span.clone())
            .await;

        match &result {
            Ok(completion) => {
                span.record("gen_ai.response.content", completion.content.as_str());
                record_metadata(&span, completion.metadata.as_ref());
            }
            Err(e) => {
                span.record("error", display(e));
            }
        }
        result
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        ctx: &InvocationContext,
    ) -> Result<ChunkStream, LlmError> {
        let span = self.span("chat_stream", messages, ctx);
        let inner = match self.inner.stream(messages, ctx).instrument(span.clone()).await {
            Ok(inner) => inner,
            Err(e) => {
                span.record("error", display(&e));
                return Err(e);
            }
        };

        let recorder = StreamRecorder::new(span);
        Ok(Box::pin(async_stream::stream! {
            let mut recorder = recorder;
            let mut inner = inner;
            while let Some(item) = inner.next().await {
                match &item {
                    Ok(chunk) => recorder.observe(chunk),
                    Err(e) => recorder.fail(e),
                }
                yield item;
            }
        }))
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

/// Accumulates streamed output and records it on the span when dropped,
/// so abandoned streams are recorded too
struct StreamRecorder {
    span: Span,
    content: String,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    error: Option<String>,
}

impl StreamRecorder {
    fn new(span: Span) -> Self {
        Self {
            span,
            content: String::new(),
            finish_reason: None,
            usage: None,
            error: None,
        }
    }

    fn observe(&mut self, chunk: &Chunk) {
        self.content.push_str(&chunk.content);
        if let Some(metadata) = &chunk.metadata {
            if metadata.finish_reason.is_some() {
                self.finish_reason = metadata.finish_reason.clone();
            }
            if metadata.usage.is_some() {
                self.usage = metadata.usage;
            }
        }
    }

    fn fail(&mut self, error: &LlmError) {
        self.error = Some(error.to_string());
    }
}

impl Drop for StreamRecorder {
    fn drop(&mut self) {
        self.span.record("gen_ai.response.content", self.content.as_str());
        record_metadata(
            &self.span,
            Some(&ChunkMetadata {
                finish_reason: self.finish_reason.take(),
                usage: self.usage,
            }),
        );
        if let Some(error) = &self.error {
            self.span.record("error", error.as_str());
        }
    }
}

pub struct ObservedEmbeddingModel {
    inner: Box<dyn EmbeddingModel>,
}

impl ObservedEmbeddingModel {
    pub fn new(inner: Box<dyn EmbeddingModel>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EmbeddingModel for ObservedEmbeddingModel {
    async fn embed_documents(
        &self,
        texts: &[String],
        ctx: &InvocationContext,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        let request = serde_json::to_string(texts).unwrap_or_default();
        let span = call_span(
            "embeddings",
            self.inner.provider_name(),
            self.inner.model(),
            ctx,
            &request,
        );

        let result = self
            .inner
            .embed_documents(texts, ctx)
            .instrument(span.clone())
            .await;

        match &result {
            Ok(vectors) => {
                span.record(
                    "gen_ai.response.content",
                    display(format_args!("{} embeddings", vectors.len())),
                );
            }
            Err(e) => {
                span.record("error", display(e));
            }
        }
        result
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}
