//! Buffered streaming
//!
//! [`StreamCoalescer`] groups the many small chunks a provider emits into fewer,
//! larger [`MergedEvent`]s. A batch is flushed when one of these holds, checked
//! in this order after every append:
//!
//! 1. the chunk is terminal and `flush_on_terminal` is set
//! 2. the batch holds `max_batch_size` chunks
//! 3. the batch holds at least `max_batch_chars` chars of content
//! 4. the batch has been open for `max_wait`
//!
//! The wait deadline is a timer raced against the next upstream chunk, so a
//! stalled provider still has its partial batch flushed on time.

use crate::chunk::{Chunk, ChunkMetadata};
use crate::error::LlmError;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(250);

/// Batching limits for a [`StreamCoalescer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalesceConfig {
    /// Maximum number of chunks per batch
    pub max_batch_size: usize,
    /// Optional cap on the cumulative content length of a batch, in chars
    pub max_batch_chars: Option<usize>,
    /// Maximum time a batch may stay open
    pub max_wait: Duration,
    /// Flush as soon as a terminal chunk arrives
    pub flush_on_terminal: bool,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_chars: None,
            max_wait: DEFAULT_MAX_WAIT,
            flush_on_terminal: true,
        }
    }
}

impl CoalesceConfig {
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_max_batch_chars(mut self, max_batch_chars: usize) -> Self {
        self.max_batch_chars = Some(max_batch_chars);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_flush_on_terminal(mut self, flush_on_terminal: bool) -> Self {
        self.flush_on_terminal = flush_on_terminal;
        self
    }

    pub fn validate(&self) -> Result<(), LlmError> {
        if self.max_batch_size == 0 {
            return Err(LlmError::Configuration(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.max_batch_chars == Some(0) {
            return Err(LlmError::Configuration(
                "max_batch_chars must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn flush_reason(&self, batch: &Batch) -> Option<FlushReason> {
        if self.flush_on_terminal && batch.last_is_terminal() {
            Some(FlushReason::Terminal)
        } else if batch.len() >= self.max_batch_size {
            Some(FlushReason::Size)
        } else if matches!(self.max_batch_chars, Some(limit) if batch.chars >= limit) {
            Some(FlushReason::Length)
        } else if batch.opened_at.elapsed() >= self.max_wait {
            Some(FlushReason::Timeout)
        } else {
            None
        }
    }
}

/// Why a batch was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// A terminal chunk arrived
    Terminal,
    /// The batch reached `max_batch_size` chunks
    Size,
    /// The batch reached `max_batch_chars`
    Length,
    /// The batch was open for `max_wait`
    Timeout,
    /// The source ended with a partial batch pending
    Exhausted,
    /// The source failed with a partial batch pending
    UpstreamError,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Terminal => "terminal",
            FlushReason::Size => "size",
            FlushReason::Length => "length",
            FlushReason::Timeout => "timeout",
            FlushReason::Exhausted => "exhausted",
            FlushReason::UpstreamError => "upstream_error",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flushed batch, folded into one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedEvent {
    /// Chunk contents concatenated in arrival order
    pub content: String,
    pub reasoning: String,
    /// Metadata of the last chunk in the batch
    pub metadata: Option<ChunkMetadata>,
    pub first_index: u64,
    pub last_index: u64,
    pub chunk_count: usize,
    pub reason: FlushReason,
}

impl MergedEvent {
    pub fn is_terminal(&self) -> bool {
        self.metadata.is_some()
    }
}

impl From<MergedEvent> for Chunk {
    fn from(event: MergedEvent) -> Self {
        Chunk {
            index: event.first_index,
            content: event.content,
            reasoning: event.reasoning,
            metadata: event.metadata,
        }
    }
}

/// Chunks accumulated since the last flush
struct Batch {
    chunks: Vec<Chunk>,
    chars: usize,
    opened_at: Instant,
}

impl Batch {
    fn open() -> Self {
        Self {
            chunks: Vec::new(),
            chars: 0,
            opened_at: Instant::now(),
        }
    }

    fn push(&mut self, chunk: Chunk) {
        self.chars += chunk.char_len();
        self.chunks.push(chunk);
    }

    fn len(&self) -> usize {
        self.chunks.len()
    }

    fn last_is_terminal(&self) -> bool {
        self.chunks.last().is_some_and(Chunk::is_terminal)
    }

    fn merge(self, reason: FlushReason) -> MergedEvent {
        let chunk_count = self.chunks.len();
        let first_index = self.chunks.first().map(|c| c.index).unwrap_or_default();
        let last_index = self.chunks.last().map(|c| c.index).unwrap_or_default();

        let mut content = String::with_capacity(self.chars);
        let mut reasoning = String::new();
        let mut metadata = None;
        for chunk in self.chunks {
            content.push_str(&chunk.content);
            reasoning.push_str(&chunk.reasoning);
            metadata = chunk.metadata;
        }

        MergedEvent {
            content,
            reasoning,
            metadata,
            first_index,
            last_index,
            chunk_count,
            reason,
        }
    }
}

fn flush(batch: Batch, reason: FlushReason) -> MergedEvent {
    let event = batch.merge(reason);
    tracing::trace!(
        reason = %event.reason,
        chunks = event.chunk_count,
        first_index = event.first_index,
        last_index = event.last_index,
        "Flushing batch"
    );
    event
}

/// What woke the coalescer up
enum Wake<T> {
    Upstream(Option<T>),
    Deadline,
    Cancelled,
}

/// Groups provider chunks into merged events under size and time bounds
#[derive(Debug, Clone)]
pub struct StreamCoalescer {
    config: CoalesceConfig,
}

impl StreamCoalescer {
    /// Create a coalescer, rejecting invalid limits up front
    pub fn new(config: CoalesceConfig) -> Result<Self, LlmError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CoalesceConfig {
        &self.config
    }

    /// Coalesce `source` until it ends or fails.
    ///
    /// A source error is yielded unchanged, after any partial batch, and ends
    /// the stream. Dropping the returned stream drops the source and the timer.
    pub fn coalesce<S, E>(&self, source: S) -> impl Stream<Item = Result<MergedEvent, E>> + Send + 'static
    where
        S: Stream<Item = Result<Chunk, E>> + Send + 'static,
        E: Send + 'static,
    {
        self.coalesce_until(source, CancellationToken::new())
    }

    /// Like [`coalesce`](Self::coalesce), but also ends, without a final
    /// flush, once `cancel` fires.
    pub fn coalesce_until<S, E>(
        &self,
        source: S,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<MergedEvent, E>> + Send + 'static
    where
        S: Stream<Item = Result<Chunk, E>> + Send + 'static,
        E: Send + 'static,
    {
        let config = self.config.clone();

        async_stream::stream! {
            let mut source = Box::pin(source);
            let deadline = tokio::time::sleep(config.max_wait);
            tokio::pin!(deadline);
            let mut batch: Option<Batch> = None;
            // False when the deadline lies beyond what `Instant` can represent
            let mut timed = false;

            loop {
                let armed = timed && batch.is_some();
                let wake = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Wake::Cancelled,
                    item = source.next() => Wake::Upstream(item),
                    _ = &mut deadline, if armed => Wake::Deadline,
                };

                match wake {
                    Wake::Upstream(Some(Ok(chunk))) => {
                        let mut open = match batch.take() {
                            Some(open) => open,
                            None => {
                                let open = Batch::open();
                                match open.opened_at.checked_add(config.max_wait) {
                                    Some(at) => {
                                        deadline.as_mut().reset(at);
                                        timed = true;
                                    }
                                    None => timed = false,
                                }
                                open
                            }
                        };
                        open.push(chunk);
                        match config.flush_reason(&open) {
                            Some(reason) => {
                                yield Ok(flush(open, reason));
                            }
                            None => batch = Some(open),
                        }
                    }
                    Wake::Upstream(Some(Err(error))) => {
                        if let Some(open) = batch.take() {
                            yield Ok(flush(open, FlushReason::UpstreamError));
                        }
                        tracing::debug!("Upstream stream failed, ending coalesced stream");
                        yield Err(error);
                        break;
                    }
                    Wake::Upstream(None) => {
                        if let Some(open) = batch.take() {
                            yield Ok(flush(open, FlushReason::Exhausted));
                        }
                        break;
                    }
                    Wake::Deadline => {
                        if let Some(open) = batch.take() {
                            yield Ok(flush(open, FlushReason::Timeout));
                        }
                    }
                    Wake::Cancelled => {
                        tracing::debug!(
                            pending = batch.as_ref().map_or(0, Batch::len),
                            "Coalescer cancelled, dropping open batch"
                        );
                        break;
                    }
                }
            }
        }
    }
}
