//! Sink for merged dispatch results. Notes are buffered by `append` and only
//! durable after `flush` returns.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{PilotError, Result};
use crate::state::file_safe;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub parent_id: String,
    pub group_id: Option<String>,
    pub title: String,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait NoteSink: Send + Sync {
    async fn append(&self, note: Note) -> Result<()>;
    async fn flush(&self) -> Result<()>;
}

/// Appends notes as JSON lines to `<dir>/<parent>.jsonl`.
pub struct JsonlNoteSink {
    dir: PathBuf,
    pending: Mutex<Vec<Note>>,
}

impl JsonlNoteSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn path_for(&self, parent_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", file_safe(parent_id)))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl NoteSink for JsonlNoteSink {
    async fn append(&self, note: Note) -> Result<()> {
        self.pending.lock().push(note);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let notes = std::mem::take(&mut *self.pending.lock());
        if notes.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).await?;

        for (i, note) in notes.iter().enumerate() {
            let mut line = serde_json::to_string(note)?;
            line.push('\n');
            let written = async {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.path_for(&note.parent_id))
                    .await?;
                file.write_all(line.as_bytes()).await?;
                file.flush().await
            }
            .await;

            if let Err(e) = written {
                // Keep what was not written for the next flush.
                let mut pending = self.pending.lock();
                let mut restored = notes[i..].to_vec();
                restored.append(&mut pending);
                *pending = restored;
                return Err(PilotError::Notes(format!("flush failed: {}", e)));
            }
        }
        Ok(())
    }
}

/// In-memory sink; `flushed` holds notes that survived a flush.
#[derive(Default)]
pub struct MemoryNoteSink {
    pending: Mutex<Vec<Note>>,
    flushed: Mutex<Vec<Note>>,
}

impl MemoryNoteSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flushed(&self) -> Vec<Note> {
        self.flushed.lock().clone()
    }

    pub fn pending(&self) -> Vec<Note> {
        self.pending.lock().clone()
    }
}

#[async_trait]
impl NoteSink for MemoryNoteSink {
    async fn append(&self, note: Note) -> Result<()> {
        self.pending.lock().push(note);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let notes = std::mem::take(&mut *self.pending.lock());
        self.flushed.lock().extend(notes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn note(parent: &str, title: &str) -> Note {
        Note {
            parent_id: parent.into(),
            group_id: Some("grp_1".into()),
            title: title.into(),
            body: json!({"findings": ["x"]}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_only_durable_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlNoteSink::new(dir.path());

        sink.append(note("ses_p", "first")).await.unwrap();
        sink.append(note("ses_p", "second")).await.unwrap();
        assert!(!sink.path_for("ses_p").exists());
        assert_eq!(sink.pending_count(), 2);

        sink.flush().await.unwrap();
        let content = std::fs::read_to_string(sink.path_for("ses_p")).unwrap();
        let titles: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<Note>(l).unwrap().title)
            .collect();
        assert_eq!(titles, vec!["first", "second"]);
        assert_eq!(sink.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_sink_flush() {
        let sink = MemoryNoteSink::new();
        sink.append(note("ses_p", "a")).await.unwrap();
        assert!(sink.flushed().is_empty());
        sink.flush().await.unwrap();
        assert_eq!(sink.flushed().len(), 1);
        assert!(sink.pending().is_empty());
    }
}
