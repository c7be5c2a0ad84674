use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::types::SessionState;
use super::state_err_with;
use crate::error::Result;

/// Durable backing for the session state store. Calls are synchronous so a
/// mutation is on disk before the mutating operation returns.
pub trait StatePersistence: Send + Sync {
    fn load(&self, session_id: &str) -> Result<Option<SessionState>>;
    fn save(&self, session_id: &str, state: &SessionState) -> Result<()>;
}

/// One JSON document per session, written with temp-file + rename.
pub struct JsonFileStatePersistence {
    dir: PathBuf,
}

impl JsonFileStatePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| state_err_with("Failed to create state dir", e))?;
        Self::remove_interrupted_writes(&dir);
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_safe(session_id)))
    }

    fn remove_interrupted_writes(dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                debug!(path = %path.display(), "Removing interrupted state write");
                let _ = fs::remove_file(&path);
            }
        }
    }
}

impl StatePersistence for JsonFileStatePersistence {
    fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, session_id: &str, state: &SessionState) -> Result<()> {
        let path = self.path_for(session_id);
        let content = serde_json::to_vec_pretty(state)?;
        write_atomic(&path, &content)
    }
}

pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Session ids are opaque; keep file names portable.
pub(crate) fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
