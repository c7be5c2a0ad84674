//! JSON snapshot of a parent session's dispatch state, read by the UI.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::{ParallelGroup, ParallelTrack, TrackStatus};
use crate::error::Result;
use crate::state::{OracleProgress, SessionState, file_safe, write_atomic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSnapshot {
    pub parent_id: String,
    pub mode: String,
    pub phase: String,
    pub target: String,
    pub rule_id: Option<String>,
    pub route: Option<String>,
    pub tool: Option<String>,
    pub rationale: Vec<String>,
    pub oracle_progress: OracleProgress,
    pub groups: Vec<GroupSnapshot>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub group_id: String,
    pub label: String,
    pub completed: usize,
    pub total: usize,
    pub queued: usize,
    pub winner_id: Option<String>,
    pub tracks: Vec<TrackSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSnapshot {
    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,
    pub agent: String,
    pub purpose: String,
    pub last_activity: Option<String>,
    pub status: TrackStatus,
    pub is_winner: bool,
    pub duration_ms: Option<u64>,
}

impl DispatchSnapshot {
    pub fn build(
        parent_id: &str,
        state: &SessionState,
        groups: &[ParallelGroup],
        now: DateTime<Utc>,
    ) -> Self {
        let decision = state.last_decision.as_ref();
        Self {
            parent_id: parent_id.to_string(),
            mode: state.mode.to_string(),
            phase: state.phase.to_string(),
            target: state.target.to_string(),
            rule_id: decision.map(|d| d.rule_id.clone()),
            route: decision.and_then(|d| d.route.clone()),
            tool: decision.and_then(|d| d.tool.clone()),
            rationale: decision.map(|d| d.rationale.clone()).unwrap_or_default(),
            oracle_progress: state.oracle_progress,
            groups: groups
                .iter()
                .filter(|g| g.parent_id == parent_id)
                .map(|g| GroupSnapshot::build(g, now))
                .collect(),
            updated_at: now,
        }
    }
}

impl GroupSnapshot {
    fn build(group: &ParallelGroup, now: DateTime<Utc>) -> Self {
        Self {
            group_id: group.group_id.clone(),
            label: group.label.clone(),
            completed: group.completed_count(),
            total: group.tracks.len(),
            queued: group.queue.len(),
            winner_id: group.winner_session_id.clone(),
            tracks: group
                .tracks
                .iter()
                .map(|t| TrackSnapshot::build(t, now))
                .collect(),
        }
    }
}

impl TrackSnapshot {
    fn build(track: &ParallelTrack, now: DateTime<Utc>) -> Self {
        Self {
            session_id: track.session_id.clone(),
            agent: track.agent.clone(),
            purpose: track.purpose.clone(),
            last_activity: track.last_activity.clone(),
            status: track.status,
            is_winner: track.is_winner,
            duration_ms: track.duration_ms(now),
        }
    }
}

/// Writes one `<parent>.json` per parent session.
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, parent_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_safe(parent_id)))
    }

    pub fn write(&self, snapshot: &DispatchSnapshot) -> Result<PathBuf> {
        let path = self.path_for(&snapshot.parent_id);
        let content = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&path, &content)?;
        Ok(path)
    }

    pub fn read(&self, parent_id: &str) -> Result<Option<DispatchSnapshot>> {
        let path = self.path_for(parent_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }
}
