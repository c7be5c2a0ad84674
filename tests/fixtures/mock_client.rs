//! Scripted worker client for testing without a live execution service.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use probe_pilot::dispatch::{
    CreateSessionRequest, MessageRole, PromptRequest, SessionStatus, WorkerClient, WorkerMessage,
    WorkerResult, WorkerSession,
};
use probe_pilot::error::WorkerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { agent: String, title: String },
    Prompt { session_id: String },
    Messages { session_id: String },
    Abort { session_id: String },
    Status,
}

#[derive(Default)]
pub struct MockWorkerClient {
    next_id: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    sessions: Mutex<HashMap<String, WorkerSession>>,
    statuses: Mutex<HashMap<String, SessionStatus>>,
    replies: Mutex<HashMap<String, String>>,
    /// Titles whose create call fails.
    create_failures: Mutex<HashMap<String, String>>,
    prompt_failure: Mutex<Option<String>>,
    failing_messages: Mutex<HashSet<String>>,
    status_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockWorkerClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create_for(&self, title: &str, message: &str) {
        self.create_failures
            .lock()
            .insert(title.to_string(), message.to_string());
    }

    pub fn fail_prompts(&self, message: &str) {
        *self.prompt_failure.lock() = Some(message.to_string());
    }

    pub fn clear_prompt_failure(&self) {
        *self.prompt_failure.lock() = None;
    }

    pub fn fail_messages_for(&self, session_id: &str) {
        self.failing_messages.lock().insert(session_id.to_string());
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) {
        self.statuses.lock().insert(session_id.to_string(), status);
    }

    /// Mark a session finished: absent from the status map, with a reply.
    pub fn finish(&self, session_id: &str, reply: &str) {
        self.statuses.lock().remove(session_id);
        self.replies
            .lock()
            .insert(session_id.to_string(), reply.to_string());
    }

    pub fn set_reply(&self, session_id: &str, reply: &str) {
        self.replies
            .lock()
            .insert(session_id.to_string(), reply.to_string());
    }

    /// Block `status` calls until the returned handle is notified.
    pub fn gate_status(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.status_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn created_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Create { .. }))
            .count()
    }

    pub fn status_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Status))
            .count()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Abort { session_id } => Some(session_id),
                _ => None,
            })
            .collect()
    }

    /// Session ids in creation order.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort_by_key(|id| id.trim_start_matches("ses_").parse::<usize>().unwrap_or(0));
        ids
    }
}

#[async_trait]
impl WorkerClient for MockWorkerClient {
    async fn create(&self, request: CreateSessionRequest) -> WorkerResult<WorkerSession> {
        self.calls.lock().push(Call::Create {
            agent: request.agent.clone(),
            title: request.title.clone(),
        });
        if let Some(message) = self.create_failures.lock().get(&request.title) {
            return Err(WorkerError::from_message(message));
        }

        let id = format!("ses_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let session = WorkerSession {
            id: id.clone(),
            parent_id: Some(request.parent_id),
            title: request.title,
        };
        self.sessions.lock().insert(id.clone(), session.clone());
        self.statuses
            .lock()
            .insert(id, SessionStatus::Busy { activity: None });
        Ok(session)
    }

    async fn prompt_async(&self, request: PromptRequest) -> WorkerResult<()> {
        self.calls.lock().push(Call::Prompt {
            session_id: request.session_id,
        });
        match self.prompt_failure.lock().as_deref() {
            Some(message) => Err(WorkerError::from_message(message)),
            None => Ok(()),
        }
    }

    async fn messages(&self, session_id: &str, _limit: usize) -> WorkerResult<Vec<WorkerMessage>> {
        self.calls.lock().push(Call::Messages {
            session_id: session_id.to_string(),
        });
        if self.failing_messages.lock().contains(session_id) {
            return Err(WorkerError::Unavailable("HTTP 503".into()));
        }
        Ok(self
            .replies
            .lock()
            .get(session_id)
            .map(|text| {
                vec![WorkerMessage {
                    role: MessageRole::Assistant,
                    text: text.clone(),
                    created_at: None,
                }]
            })
            .unwrap_or_default())
    }

    async fn abort(&self, session_id: &str) -> WorkerResult<()> {
        self.calls.lock().push(Call::Abort {
            session_id: session_id.to_string(),
        });
        self.statuses.lock().remove(session_id);
        Ok(())
    }

    async fn status(&self) -> WorkerResult<HashMap<String, SessionStatus>> {
        self.calls.lock().push(Call::Status);
        let gate = self.status_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.statuses.lock().clone())
    }

    async fn children(&self, parent_id: &str) -> WorkerResult<Vec<WorkerSession>> {
        Ok(self
            .sessions
            .lock()
            .values()
            .filter(|s| s.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }
}
