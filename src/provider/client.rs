//! OpenAI-compatible provider client
//!
//! Streams chat completions over SSE, turning each delta into a [`Chunk`].
//! Uses raw HTTP for streaming to capture reasoning_content (extended thinking)
//! which async-openai doesn't support; embeddings go through async-openai.

use super::ProviderConfig;
use crate::chunk::{Chunk, ChunkMetadata, ChunkStream, TokenUsage};
use crate::context::InvocationContext;
use crate::error::LlmError;
use crate::message::{messages_to_json, ChatMessage};
use crate::model::{ChatModel, Completion, EmbeddingModel};
use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::fmt::Display;

// Internal types for parsing streaming responses
#[derive(Debug, serde::Deserialize)]
struct StreamChunkDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct StreamChoice {
    delta: StreamChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct CompletionTokensDetails {
    reasoning_tokens: Option<u64>,
}

#[derive(Debug, serde::Deserialize)]
struct StreamUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    completion_tokens_details: Option<CompletionTokensDetails>,
}

impl From<&StreamUsage> for TokenUsage {
    fn from(usage: &StreamUsage) -> Self {
        TokenUsage {
            input: usage.prompt_tokens,
            output: usage.completion_tokens,
            reasoning: usage
                .completion_tokens_details
                .as_ref()
                .and_then(|d| d.reasoning_tokens),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<StreamUsage>,
}

#[derive(Debug, serde::Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<StreamUsage>,
}

/// Turn an SSE byte stream into chunks.
///
/// Every text or reasoning delta becomes one chunk. Finish reason and usage are
/// held back and emitted as a single terminal chunk once the stream ends.
pub fn sse_chunks<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();
        let mut index = 0u64;
        let mut finish_reason: Option<String> = None;
        let mut usage: Option<TokenUsage> = None;
        let mut done = false;

        while !done {
            match bytes.next().await {
                Some(Ok(data)) => buffer.extend_from_slice(data.as_ref()),
                Some(Err(e)) => {
                    yield Err(LlmError::Stream(format!("Stream read error: {}", e)));
                    return;
                }
                None if buffer.is_empty() => break,
                None => {
                    // Terminate the last line so it is processed below
                    buffer.push(b'\n');
                    done = true;
                }
            }

            // Process complete SSE lines
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();

                if line.is_empty() || line.starts_with(':') {
                    continue;
                }

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim_start();

                if data == "[DONE]" {
                    done = true;
                    break;
                }

                let chunk = match serde_json::from_str::<StreamChunk>(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(target: "llm", error = %e, "Skipping malformed stream event");
                        continue;
                    }
                };

                if let Some(u) = &chunk.usage {
                    usage = Some(u.into());
                }

                for choice in chunk.choices {
                    // Handle reasoning content (extended thinking)
                    if let Some(reasoning) = choice.delta.reasoning_content {
                        if !reasoning.is_empty() {
                            yield Ok(Chunk::reasoning(index, reasoning));
                            index += 1;
                        }
                    }

                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            yield Ok(Chunk::text(index, content));
                            index += 1;
                        }
                    }

                    if choice.finish_reason.is_some() {
                        finish_reason = choice.finish_reason;
                    }
                }
            }
        }

        if finish_reason.is_some() || usage.is_some() {
            yield Ok(Chunk::terminal(index, "", ChunkMetadata { finish_reason, usage }));
        }
    })
}

/// OpenAI-compatible client
#[derive(Clone)]
pub struct ProviderClient {
    config: ProviderConfig,
    client: Client<OpenAIConfig>,
    http_client: reqwest::Client,
    api_key: String,
}

impl ProviderClient {
    /// Create a new provider client from config
    pub fn new(config: ProviderConfig) -> Result<Self, LlmError> {
        let api_key = config.resolve_api_key()?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(&api_key)
            .with_api_base(&config.base_url);

        let client = Client::with_config(openai_config);
        // Don't keep connections alive, so dropping a stream closes it
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self {
            config,
            client,
            http_client,
            api_key,
        })
    }

    /// Get the provider config
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn request_body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages_to_json(messages),
        });

        if stream {
            body["stream"] = serde_json::json!(true);
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(target: "llm", error = %e, "LLM request failed");
                LlmError::Request(e)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::error!(target: "llm", status = %status, error = %text, "LLM call returned error");
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(response)
    }

    /// Send a streaming chat completion request
    pub async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChunkStream, LlmError> {
        tracing::debug!(
            target: "llm",
            provider = %self.config.kind,
            model = %self.config.model,
            message_count = messages.len(),
            "Starting streaming LLM call"
        );

        let response = self.post(&self.request_body(messages, true)).await?;
        Ok(sse_chunks(response.bytes_stream()))
    }

    /// Send a non-streaming chat completion request
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<Completion, LlmError> {
        let start = std::time::Instant::now();
        tracing::info!(
            target: "llm",
            provider = %self.config.kind,
            model = %self.config.model,
            message_count = messages.len(),
            "Starting LLM call"
        );

        let response = self.post(&self.request_body(messages, false)).await?;
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))?;
        let usage = body.usage.as_ref().map(TokenUsage::from);

        tracing::info!(
            target: "llm",
            model = %self.config.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            input_tokens = usage.map(|u| u.input),
            output_tokens = usage.map(|u| u.output),
            "LLM call completed"
        );

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            metadata: Some(ChunkMetadata {
                finish_reason: choice.finish_reason,
                usage,
            }),
        })
    }

    /// Embed a batch of texts, returned in input order
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.config.model.as_str())
            .input(texts.to_vec())
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        tracing::debug!(
            target: "llm",
            model = %self.config.model,
            inputs = texts.len(),
            prompt_tokens = response.usage.prompt_tokens,
            "Embedding call completed"
        );

        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        Ok(data.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl ChatModel for ProviderClient {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        _ctx: &InvocationContext,
    ) -> Result<Completion, LlmError> {
        self.chat(messages).await
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        _ctx: &InvocationContext,
    ) -> Result<ChunkStream, LlmError> {
        self.chat_stream(messages).await
    }

    fn provider_name(&self) -> &str {
        self.config.kind.as_str()
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl EmbeddingModel for ProviderClient {
    async fn embed_documents(
        &self,
        texts: &[String],
        _ctx: &InvocationContext,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        self.embed(texts).await
    }

    fn provider_name(&self) -> &str {
        self.config.kind.as_str()
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}
