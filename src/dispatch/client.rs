//! Boundary to the external worker-execution service.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub parent_id: String,
    /// Resolved variant name, e.g. `scanner--gpt-5`.
    pub agent: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSession {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub session_id: String,
    pub agent: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub role: MessageRole,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionStatus {
    Busy { activity: Option<String> },
    Idle,
    Error { message: String },
}

/// Capability set the orchestrator needs from the execution service.
///
/// Per-call timeouts are the implementation's responsibility.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn create(&self, request: CreateSessionRequest) -> WorkerResult<WorkerSession>;

    /// Queue a prompt without waiting for the reply.
    async fn prompt_async(&self, request: PromptRequest) -> WorkerResult<()>;

    /// Most recent messages of a session, oldest first.
    async fn messages(&self, session_id: &str, limit: usize) -> WorkerResult<Vec<WorkerMessage>>;

    async fn abort(&self, session_id: &str) -> WorkerResult<()>;

    /// Status of every live session. Sessions absent from the map are gone.
    async fn status(&self) -> WorkerResult<HashMap<String, SessionStatus>>;

    async fn children(&self, parent_id: &str) -> WorkerResult<Vec<WorkerSession>>;
}

/// Latest assistant text, if any.
pub fn latest_assistant_text(messages: &[WorkerMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant && !m.text.trim().is_empty())
        .map(|m| m.text.as_str())
}
