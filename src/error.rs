use std::path::PathBuf;

use thiserror::Error;

use crate::state::DispatchOutcome;

/// Failure reported by the external worker-execution service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    RateLimited { retry_after_secs: Option<u64> },
    Timeout { operation: String },
    Unavailable(String),
    SessionNotFound(String),
    ContextOverflow(String),
    Rejected(String),
    Other(String),
}

impl WorkerError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Unavailable(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Outcome recorded against the worker kind that produced this error.
    pub fn outcome(&self) -> DispatchOutcome {
        if self.is_transient() {
            DispatchOutcome::RetryableFailure
        } else {
            DispatchOutcome::HardFailure
        }
    }

    /// Classify a raw error message from the execution service.
    /// Only unambiguous markers are matched; everything else is `Other`.
    pub fn from_message(msg: &str) -> Self {
        if msg.contains("429") || msg.contains("Too Many Requests") {
            return Self::RateLimited {
                retry_after_secs: Self::extract_retry_after(msg),
            };
        }
        if msg.contains("502") || msg.contains("503") || msg.contains("504") {
            return Self::Unavailable(msg.to_string());
        }
        if msg.contains("context_length_exceeded") || msg.contains("maximum context length") {
            return Self::ContextOverflow(msg.to_string());
        }
        if msg.contains("timed out after") || msg.contains("timeout after") {
            return Self::Timeout {
                operation: msg.to_string(),
            };
        }
        if msg.contains("session not found") || msg.contains("404") {
            return Self::SessionNotFound(msg.to_string());
        }
        Self::Other(msg.to_string())
    }

    fn extract_retry_after(msg: &str) -> Option<u64> {
        let msg_lower = msg.to_lowercase();
        for pattern in ["retry after ", "retry-after: ", "retry_after="] {
            if let Some(idx) = msg_lower.find(pattern) {
                let num_str: String = msg_lower[idx + pattern.len()..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                if let Ok(secs) = num_str.parse() {
                    return Some(secs);
                }
            }
        }
        None
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "Rate limited, retry after {}s", secs)
                } else {
                    write!(f, "Rate limited")
                }
            }
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
            Self::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            Self::ContextOverflow(msg) => write!(f, "Context overflow: {}", msg),
            Self::Rejected(msg) => write!(f, "Rejected: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for WorkerError {}

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Playbook error in {path}{}: {message}", rule_id.as_deref().map(|id| format!(" (rule '{}')", id)).unwrap_or_default())]
    Playbook {
        path: PathBuf,
        rule_id: Option<String>,
        message: String,
    },

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Track not found: {group_id}/{track}")]
    TrackNotFound { group_id: String, track: String },

    #[error("Invalid track transition: {from} → {to}")]
    InvalidTrackTransition { from: String, to: String },

    #[error("Empty dispatch plan: {0}")]
    EmptyPlan(String),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("State persistence failed: {0}")]
    StatePersistence(String),

    #[error("Note sink error: {0}")]
    Notes(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl PilotError {
    pub fn playbook(
        path: impl Into<PathBuf>,
        rule_id: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::Playbook {
            path: path.into(),
            rule_id: rule_id.map(str::to_string),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_rate_limit_with_retry_after() {
        let err = WorkerError::from_message("HTTP 429 Too Many Requests, retry after 12 seconds");
        assert_eq!(
            err,
            WorkerError::RateLimited {
                retry_after_secs: Some(12)
            }
        );
        assert!(err.is_transient());
        assert_eq!(err.outcome(), DispatchOutcome::RetryableFailure);
    }

    #[test]
    fn test_unknown_message_is_permanent() {
        let err = WorkerError::from_message("model refused the prompt");
        assert!(matches!(err, WorkerError::Other(_)));
        assert!(err.is_permanent());
        assert_eq!(err.outcome(), DispatchOutcome::HardFailure);
    }

    #[test]
    fn test_playbook_error_names_file_and_rule() {
        let err = PilotError::playbook("rules/base.yaml", Some("scan-first"), "missing route");
        let msg = err.to_string();
        assert!(msg.contains("rules/base.yaml"));
        assert!(msg.contains("scan-first"));
        assert!(msg.contains("missing route"));

        let err = PilotError::playbook("rules/base.yaml", None, "unsupported version 9");
        assert!(!err.to_string().contains("rule '"));
    }
}
