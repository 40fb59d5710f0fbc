//! Telemetry and logging infrastructure
//!
//! Model calls are observed through tracing spans. This module installs the
//! subscriber that gives those spans somewhere to go:
//! - SQLite storage for every traced call (queryable history)
//! - OpenTelemetry export over OTLP/HTTP (Langfuse, Jaeger, etc.)
//! - Console logging (human-readable, verbose mode only)
//! - JSON file logging (for analysis)

use crate::config::TelemetryConfig;
use crate::trace_layer::SqliteTraceLayer;
use chrono::{DateTime, Utc};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

const DB_FILE: &str = "telemetry.db";

/// Process-level telemetry session
#[derive(Debug)]
pub struct TelemetrySession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl TelemetrySession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for TelemetrySession {
    fn default() -> Self {
        Self::new()
    }
}

/// SQLite-backed trace storage
struct TelemetryDb {
    conn: Connection,
}

impl TelemetryDb {
    fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                service_name TEXT
            );

            -- One row per model call
            CREATE TABLE IF NOT EXISTS traces (
                id TEXT PRIMARY KEY,
                -- Invocation context session, or the process session
                session_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                model_provider TEXT NOT NULL,
                model_id TEXT NOT NULL,
                user_id TEXT,
                -- JSON object of invocation tags
                tags TEXT,
                request_messages TEXT,
                response_content TEXT,
                finish_reason TEXT,
                input_tokens INTEGER,
                output_tokens INTEGER,
                total_tokens INTEGER,
                latency_ms INTEGER,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_traces_session ON traces(session_id);
            CREATE INDEX IF NOT EXISTS idx_traces_user ON traces(user_id);
            CREATE INDEX IF NOT EXISTS idx_traces_started ON traces(started_at);
        "#,
        )?;

        Ok(Self { conn })
    }

    fn insert_session(&self, session: &TelemetrySession, service_name: &str) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (id, started_at, service_name) VALUES (?1, ?2, ?3)",
            params![session.id.to_string(), session.started_at.to_rfc3339(), service_name],
        )?;
        Ok(())
    }

    fn query_traces(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> anyhow::Result<Vec<TraceSummary>> {
        let sql = format!(
            r#"SELECT id, session_id, operation, started_at, model_provider, model_id,
                      user_id, tags, response_content, finish_reason,
                      input_tokens, output_tokens, latency_ms, error
               FROM traces {}"#,
            filter
        );
        let mut stmt = self.conn.prepare(&sql)?;

        let rows = stmt.query_map(args, |row| {
            Ok(TraceSummary {
                id: row.get(0)?,
                session_id: row.get(1)?,
                operation: row.get(2)?,
                started_at: row.get(3)?,
                model_provider: row.get(4)?,
                model_id: row.get(5)?,
                user_id: row.get(6)?,
                tags: row.get(7)?,
                response_content: row.get(8)?,
                finish_reason: row.get(9)?,
                input_tokens: row.get(10)?,
                output_tokens: row.get(11)?,
                latency_ms: row.get(12)?,
                error: row.get(13)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

/// Main telemetry handler
pub struct Telemetry {
    session: Arc<TelemetrySession>,
    db: Arc<Mutex<TelemetryDb>>,
    log_dir: PathBuf,
    _file_guard: Option<WorkerGuard>,
    otel_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Initialize telemetry and install the global subscriber.
    ///
    /// Installing is best effort: if a subscriber is already set, the trace
    /// database is still created but spans go to the existing subscriber.
    pub fn init(config: &TelemetryConfig) -> anyhow::Result<Self> {
        let log_dir = config.log_dir.clone();
        std::fs::create_dir_all(&log_dir)?;

        let session = Arc::new(TelemetrySession::new());

        let db_path = log_dir.join(DB_FILE);
        let db = TelemetryDb::new(&db_path)?;
        db.insert_session(&session, &config.service_name)?;
        let db = Arc::new(Mutex::new(db));

        // JSON logs, rotated daily
        let file_appender = tracing_appender::rolling::daily(&log_dir, "llm_factory.log");
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if config.verbose {
                EnvFilter::new("debug,hyper=info,reqwest=info,h2=info,rustls=info")
            } else {
                EnvFilter::new("info,hyper=warn,reqwest=warn,h2=warn,rustls=warn")
            }
        });

        let sqlite_layer = SqliteTraceLayer::new(db_path.clone(), session.id.to_string());

        let otel_provider = match &config.otel_endpoint {
            Some(endpoint) => {
                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_http()
                    .with_endpoint(endpoint.as_str())
                    .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
                    .with_headers(config.otel_headers.clone())
                    .build()?;

                Some(
                    SdkTracerProvider::builder()
                        .with_batch_exporter(exporter)
                        .with_resource(
                            Resource::builder()
                                .with_service_name(config.service_name.clone())
                                .build(),
                        )
                        .build(),
                )
            }
            None => None,
        };

        let otel_layer = otel_provider.as_ref().map(|provider| {
            let tracer = provider.tracer(config.service_name.clone());
            tracing_opentelemetry::layer().with_tracer(tracer)
        });

        // Console only in verbose mode; file and SQLite always
        let console_layer = config
            .verbose
            .then(|| fmt::layer().with_target(false).compact());

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(fmt::layer().json().with_writer(non_blocking))
            .with(sqlite_layer)
            .with(otel_layer)
            .try_init()
            .is_ok();

        tracing::info!(
            session_id = %session.id,
            log_dir = %log_dir.display(),
            db_path = %db_path.display(),
            otel_enabled = otel_provider.is_some(),
            installed,
            "Telemetry initialized"
        );

        Ok(Self {
            session,
            db,
            log_dir,
            _file_guard: Some(file_guard),
            otel_provider,
        })
    }

    /// Open the trace database without installing a subscriber.
    ///
    /// Use [`trace_layer`](Self::trace_layer) to compose the SQLite layer into
    /// a subscriber of your own.
    pub fn open(log_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;

        let session = Arc::new(TelemetrySession::new());
        let db = TelemetryDb::new(&log_dir.join(DB_FILE))?;
        db.insert_session(&session, "llm-factory")?;

        Ok(Self {
            session,
            db: Arc::new(Mutex::new(db)),
            log_dir,
            _file_guard: None,
            otel_provider: None,
        })
    }

    /// Get the process session ID
    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    /// Get the database path for direct querying
    pub fn db_path(&self) -> PathBuf {
        self.log_dir.join(DB_FILE)
    }

    /// A fresh layer writing into this telemetry's database
    pub fn trace_layer(&self) -> SqliteTraceLayer {
        SqliteTraceLayer::new(self.db_path(), self.session.id.to_string())
    }

    /// Most recent traces, newest first
    pub fn recent_traces(&self, limit: usize) -> anyhow::Result<Vec<TraceSummary>> {
        let limit = i64::try_from(limit)?;
        self.db
            .lock()
            .query_traces("ORDER BY started_at DESC LIMIT ?1", &[&limit])
    }

    /// All traces of one invocation session, oldest first
    pub fn session_traces(&self, session_id: &str) -> anyhow::Result<Vec<TraceSummary>> {
        self.db
            .lock()
            .query_traces("WHERE session_id = ?1 ORDER BY started_at ASC", &[&session_id])
    }

    /// Per-session totals across all traces
    pub fn session_summaries(&self, limit: usize) -> anyhow::Result<Vec<SessionSummary>> {
        let db = self.db.lock();
        let limit = i64::try_from(limit)?;

        let mut stmt = db.conn.prepare(
            r#"
            SELECT session_id,
                   MIN(started_at) as first_started_at,
                   MAX(user_id) as user_id,
                   COUNT(*) as trace_count,
                   COALESCE(SUM(total_tokens), 0) as total_tokens,
                   SUM(CASE WHEN error IS NOT NULL THEN 1 ELSE 0 END) as error_count
            FROM traces
            GROUP BY session_id
            ORDER BY first_started_at DESC
            LIMIT ?1
        "#,
        )?;

        let rows = stmt.query_map([limit], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                started_at: row.get(1)?,
                user_id: row.get(2)?,
                trace_count: row.get::<_, i64>(3)? as u64,
                total_tokens: row.get::<_, i64>(4)? as u64,
                error_count: row.get::<_, i64>(5)? as u64,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Flush pending OTLP exports
    pub fn shutdown(&self) {
        if let Some(provider) = &self.otel_provider {
            if let Err(e) = provider.shutdown() {
                tracing::warn!(error = %e, "Failed to shut down trace exporter");
            }
        }
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A stored model call
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub id: String,
    pub session_id: String,
    pub operation: String,
    pub started_at: String,
    pub model_provider: String,
    pub model_id: String,
    pub user_id: Option<String>,
    pub tags: Option<String>,
    pub response_content: Option<String>,
    pub finish_reason: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub user_id: Option<String>,
    pub trace_count: u64,
    pub total_tokens: u64,
    pub error_count: u64,
}

impl std::fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session {} | Started: {} | Calls: {} | Tokens: {} | Errors: {}",
            self.session_id, self.started_at, self.trace_count, self.total_tokens, self.error_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_span_is_stored_with_context() {
        let temp = TempDir::new().unwrap();
        let telemetry = Telemetry::open(temp.path()).unwrap();
        let subscriber = tracing_subscriber::registry().with(telemetry.trace_layer());

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!(
                "gen_ai.chat",
                gen_ai.operation.name = "chat",
                gen_ai.provider.name = "openai",
                gen_ai.request.model = "gpt-4o-mini",
                session.id = "s-1",
                user.id = "alice",
                langfuse.tags = r#"{"env":"test"}"#,
                gen_ai.response.content = tracing::field::Empty,
                gen_ai.usage.input_tokens = tracing::field::Empty,
                gen_ai.usage.output_tokens = tracing::field::Empty,
            );
            span.record("gen_ai.response.content", "Hello");
            span.record("gen_ai.usage.input_tokens", 5u64);
            span.record("gen_ai.usage.output_tokens", 2u64);
        });

        let traces = telemetry.session_traces("s-1").unwrap();
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(trace.operation, "chat");
        assert_eq!(trace.model_provider, "openai");
        assert_eq!(trace.model_id, "gpt-4o-mini");
        assert_eq!(trace.user_id.as_deref(), Some("alice"));
        assert_eq!(trace.tags.as_deref(), Some(r#"{"env":"test"}"#));
        assert_eq!(trace.response_content.as_deref(), Some("Hello"));
        assert_eq!(trace.input_tokens, Some(5));

        let sessions = telemetry.session_summaries(10).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].total_tokens, 7);
        assert_eq!(sessions[0].error_count, 0);
    }

    #[test]
    fn test_spans_without_gen_ai_fields_are_ignored() {
        let temp = TempDir::new().unwrap();
        let telemetry = Telemetry::open(temp.path()).unwrap();
        let subscriber = tracing_subscriber::registry().with(telemetry.trace_layer());

        tracing::subscriber::with_default(subscriber, || {
            let _span = tracing::info_span!("unrelated", session.id = "s-1").entered();
        });

        assert!(telemetry.recent_traces(10).unwrap().is_empty());
    }

    #[test]
    fn test_trace_without_session_uses_process_session() {
        let temp = TempDir::new().unwrap();
        let telemetry = Telemetry::open(temp.path()).unwrap();
        let subscriber = tracing_subscriber::registry().with(telemetry.trace_layer());

        tracing::subscriber::with_default(subscriber, || {
            let _span = tracing::info_span!("gen_ai.embeddings", gen_ai.operation.name = "embeddings");
        });

        let traces = telemetry.recent_traces(10).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].session_id, telemetry.session_id().to_string());
        assert_eq!(traces[0].model_provider, "unknown");
    }
}
