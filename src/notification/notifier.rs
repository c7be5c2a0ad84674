use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::DispatchEvent;
use crate::config::NotificationConfig;
use crate::state::file_safe;

#[derive(Clone)]
pub struct Notifier {
    config: NotificationConfig,
    logs_dir: Option<PathBuf>,
}

impl Notifier {
    pub fn new(config: NotificationConfig, logs_dir: Option<PathBuf>) -> Self {
        Self { config, logs_dir }
    }

    pub fn disabled() -> Self {
        Self::new(
            NotificationConfig {
                enabled: false,
                ..NotificationConfig::default()
            },
            None,
        )
    }

    /// Delivery failures are logged, never returned.
    pub async fn notify(&self, event: &DispatchEvent) {
        if !self.config.enabled {
            return;
        }

        if self.config.event_log {
            self.write_event_log(event).await;
        }

        if let Some(hook) = &self.config.hook_command {
            self.run_hook(hook, event).await;
        }
    }

    pub fn event_log_path(&self, parent_id: &str) -> Option<PathBuf> {
        self.logs_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", file_safe(parent_id))))
    }

    async fn write_event_log(&self, event: &DispatchEvent) {
        let (Some(logs_dir), Some(log_path)) =
            (&self.logs_dir, self.event_log_path(&event.parent_id))
        else {
            return;
        };

        let timestamp = event.created_at.format("%Y-%m-%dT%H:%M:%SZ");
        let log_line = format!(
            "[{}] {} {}: {}\n",
            timestamp,
            event.event_type.as_str(),
            event.group_id.as_deref().unwrap_or("-"),
            event.body().replace('\n', " | ")
        );

        if let Err(e) = tokio::fs::create_dir_all(logs_dir).await {
            warn!(error = %e, "Failed to create logs directory");
            return;
        }

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await;

        match result {
            Ok(mut file) => {
                if let Err(e) = file.write_all(log_line.as_bytes()).await {
                    warn!(error = %e, "Failed to write event log");
                }
            }
            Err(e) => {
                warn!(error = %e, path = %log_path.display(), "Failed to open event log");
            }
        }
    }

    async fn run_hook(&self, hook_cmd: &str, event: &DispatchEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(_) => return,
        };

        let result = Command::new("sh")
            .args(["-c", hook_cmd])
            .env("PILOT_EVENT", event.event_type.as_str())
            .env("PILOT_PARENT_ID", &event.parent_id)
            .env("PILOT_GROUP_ID", event.group_id.as_deref().unwrap_or(""))
            .env("PILOT_EVENT_JSON", &json)
            .output()
            .await;

        if let Err(e) = result {
            debug!(error = %e, hook = %hook_cmd, "Failed to run hook");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::notification::EventType;

    #[tokio::test]
    async fn test_event_log_appends_per_parent() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::new(
            NotificationConfig::default(),
            Some(dir.path().to_path_buf()),
        );

        let now = Utc::now();
        notifier
            .notify(&DispatchEvent::new(EventType::GroupDispatched, "ses_p", now).with_group("g1"))
            .await;
        notifier
            .notify(&DispatchEvent::new(EventType::GroupCompleted, "ses_p", now).with_group("g1"))
            .await;

        let log = std::fs::read_to_string(notifier.event_log_path("ses_p").unwrap()).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("group.dispatched g1"));
        assert!(lines[1].contains("group.completed g1"));
    }

    #[tokio::test]
    async fn test_disabled_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::new(
            NotificationConfig {
                enabled: false,
                ..NotificationConfig::default()
            },
            Some(dir.path().to_path_buf()),
        );
        notifier
            .notify(&DispatchEvent::new(EventType::TrackFailed, "ses_p", Utc::now()))
            .await;
        assert!(!notifier.event_log_path("ses_p").unwrap().exists());
    }
}
