//! LLM Factory - build chat and embedding models behind one interface
//!
//! This crate provides:
//! - A factory creating OpenAI and LM Studio models by kind, provider and template
//! - A stream coalescer batching provider chunks under size and time bounds
//! - Decorators for buffered streaming and per-call observability
//! - Telemetry: SQLite trace storage, JSON logs and OTLP export (Langfuse)

pub mod chunk;
pub mod coalescer;
pub mod config;
pub mod context;
pub mod decorator;
pub mod error;
pub mod factory;
pub mod message;
pub mod model;
pub mod provider;
pub mod telemetry;
pub mod trace_layer;

pub use chunk::{Chunk, ChunkMetadata, ChunkStream, TokenUsage};
pub use coalescer::{CoalesceConfig, FlushReason, MergedEvent, StreamCoalescer};
pub use config::{ModelOptions, ModelTemplate, TelemetryConfig, TemplateFile};
pub use context::InvocationContext;
pub use decorator::{BufferedStreaming, Decorator, ObservabilityInjector};
pub use error::{LlmError, Result};
pub use factory::{ChatModelFactory, EmbeddingModelFactory, LlmFactory};
pub use message::{ChatMessage, Role};
pub use model::{ChatModel, Completion, EmbeddingModel, Llm, LlmKind};
pub use provider::{ProviderClient, ProviderConfig, ProviderKind};
pub use telemetry::Telemetry;
