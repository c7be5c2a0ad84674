use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    GroupDispatched,
    TrackCompleted,
    TrackFailed,
    TrackAborted,
    GroupCompleted,
    FailoverTriggered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GroupDispatched => "group.dispatched",
            Self::TrackCompleted => "track.completed",
            Self::TrackFailed => "track.failed",
            Self::TrackAborted => "track.aborted",
            Self::GroupCompleted => "group.completed",
            Self::FailoverTriggered => "failover.triggered",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::TrackFailed | Self::FailoverTriggered)
    }

    pub fn is_group_level(&self) -> bool {
        matches!(self, Self::GroupDispatched | Self::GroupCompleted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub event_type: EventType,
    pub parent_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<(usize, usize)>,
}

impl DispatchEvent {
    pub fn new(event_type: EventType, parent_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            event_type,
            parent_id: parent_id.into(),
            created_at: at,
            group_id: None,
            session_id: None,
            message: None,
            progress: None,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, completed: usize, total: usize) -> Self {
        self.progress = Some((completed, total));
        self
    }

    pub fn body(&self) -> String {
        let mut parts = vec![format!("Parent: {}", self.parent_id)];

        if let Some(group_id) = &self.group_id {
            parts.push(format!("Group: {}", group_id));
        }
        if let Some(session_id) = &self.session_id {
            parts.push(format!("Session: {}", session_id));
        }
        if let Some((completed, total)) = self.progress {
            parts.push(format!("Progress: {}/{}", completed, total));
        }
        if let Some(msg) = &self.message {
            parts.push(msg.clone());
        }

        parts.join("\n")
    }
}
