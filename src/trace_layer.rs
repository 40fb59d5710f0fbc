//! Tracing layer that persists model call spans to SQLite
//!
//! Spans carrying `gen_ai.*` fields are tracked from creation to close and
//! written to the `traces` table. Invocation context fields (`session.id`,
//! `user.id`, `langfuse.tags`) are stored alongside, so traces can be
//! queried per session or user.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use uuid::Uuid;

/// Context fields captured in addition to `gen_ai.*`
const CONTEXT_FIELDS: &[&str] = &["session.id", "user.id", "langfuse.tags", "error"];

/// Storage for a single trace (one model call)
#[derive(Debug, Clone, Default)]
pub struct TraceData {
    pub id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub operation_name: Option<String>,
    pub model_provider: Option<String>,
    pub model_id: Option<String>,
    pub user_id: Option<String>,
    pub tags: Option<String>,
    pub request_body: Option<String>,
    pub response_content: Option<String>,
    pub finish_reason: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub error: Option<String>,
}

impl TraceData {
    fn apply(&mut self, fields: HashMap<String, String>) {
        for (name, value) in fields {
            match name.as_str() {
                "gen_ai.operation.name" => self.operation_name = Some(value),
                "gen_ai.provider.name" => self.model_provider = Some(value),
                "gen_ai.request.model" => self.model_id = Some(value),
                "gen_ai.request.body" => self.request_body = Some(value),
                "gen_ai.response.content" => self.response_content = Some(value),
                "gen_ai.response.finish_reason" => self.finish_reason = Some(value),
                "gen_ai.usage.input_tokens" => self.input_tokens = value.parse().ok(),
                "gen_ai.usage.output_tokens" => self.output_tokens = value.parse().ok(),
                "session.id" => self.session_id = value,
                "user.id" => self.user_id = Some(value),
                "langfuse.tags" => self.tags = Some(value),
                "error" => self.error = Some(value),
                _ => {}
            }
        }
    }
}

/// Visitor collecting the fields a trace cares about
#[derive(Default)]
struct GenAiVisitor {
    fields: HashMap<String, String>,
}

impl GenAiVisitor {
    fn wants(name: &str) -> bool {
        name.starts_with("gen_ai.") || CONTEXT_FIELDS.contains(&name)
    }

    fn has_gen_ai(&self) -> bool {
        self.fields.keys().any(|k| k.starts_with("gen_ai."))
    }
}

impl Visit for GenAiVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if Self::wants(field.name()) {
            self.fields.insert(field.name().to_string(), format!("{:?}", value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if Self::wants(field.name()) {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if Self::wants(field.name()) {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if Self::wants(field.name()) {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }
}

/// Layer that captures gen_ai spans to SQLite
pub struct SqliteTraceLayer {
    db_path: PathBuf,
    /// Used when a span carries no `session.id`
    session_id: String,
    /// In-flight spans being recorded
    spans: Arc<Mutex<HashMap<u64, TraceData>>>,
}

impl SqliteTraceLayer {
    pub fn new(db_path: PathBuf, session_id: String) -> Self {
        Self {
            db_path,
            session_id,
            spans: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn save_trace(&self, trace: &TraceData) {
        let conn = match Connection::open(&self.db_path) {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("Failed to open trace database: {}", e);
                return;
            }
        };

        let latency_ms = trace
            .completed_at
            .map(|end| (end - trace.started_at).num_milliseconds());

        let result = conn.execute(
            r#"INSERT OR REPLACE INTO traces
               (id, session_id, operation, started_at, completed_at, model_provider, model_id,
                user_id, tags, request_messages, response_content, finish_reason,
                input_tokens, output_tokens, total_tokens, latency_ms, error)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"#,
            params![
                trace.id,
                trace.session_id,
                trace.operation_name.as_deref().unwrap_or("chat"),
                trace.started_at.to_rfc3339(),
                trace.completed_at.map(|t| t.to_rfc3339()),
                trace.model_provider.as_deref().unwrap_or("unknown"),
                trace.model_id.as_deref().unwrap_or("unknown"),
                trace.user_id,
                trace.tags,
                trace.request_body,
                trace.response_content,
                trace.finish_reason,
                trace.input_tokens,
                trace.output_tokens,
                trace
                    .input_tokens
                    .zip(trace.output_tokens)
                    .map(|(i, o)| i + o),
                latency_ms,
                trace.error
            ],
        );

        // The subscriber is busy here, so report on stderr
        if let Err(e) = result {
            eprintln!("Failed to save trace {}: {}", trace.id, e);
        }
    }
}

impl<S> Layer<S> for SqliteTraceLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, _ctx: Context<'_, S>) {
        let mut visitor = GenAiVisitor::default();
        attrs.record(&mut visitor);

        // Only track spans with gen_ai fields
        if !visitor.has_gen_ai() {
            return;
        }

        let mut trace = TraceData {
            id: Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            started_at: Utc::now(),
            ..Default::default()
        };
        trace.apply(visitor.fields);

        self.spans.lock().insert(id.into_u64(), trace);
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
        let mut visitor = GenAiVisitor::default();
        values.record(&mut visitor);

        if let Some(trace) = self.spans.lock().get_mut(&id.into_u64()) {
            trace.apply(visitor.fields);
        }
    }

    fn on_close(&self, id: Id, _ctx: Context<'_, S>) {
        let trace = self.spans.lock().remove(&id.into_u64());
        if let Some(mut trace) = trace {
            trace.completed_at = Some(Utc::now());
            self.save_trace(&trace);
        }
    }
}
