//! Per-call observability context
//!
//! Passed explicitly to every model call. Decorators forward it verbatim to
//! the tracing backend; nothing here is merged or validated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifiers attached to a single model invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl InvocationContext {
    /// Fresh context with a generated session id
    pub fn new() -> Self {
        Self::for_session(Uuid::new_v4().to_string())
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Tags as a JSON object string, for span attributes
    pub fn tags_json(&self) -> String {
        serde_json::to_string(&self.tags).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new()
    }
}
