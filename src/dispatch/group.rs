use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_ms;
use crate::error::{PilotError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl TrackStatus {
    pub fn allowed_transitions(&self) -> &'static [TrackStatus] {
        use TrackStatus::*;
        match self {
            // Failed from pending: creation never reached the remote service.
            Pending => &[Running, Aborted, Failed],
            Running => &[Completed, Aborted, Failed],
            Completed => &[],
            Aborted => &[],
            Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: TrackStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime instance of one requested track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelTrack {
    pub track_id: String,
    /// Remote session, once created. Referenced by id only.
    pub session_id: Option<String>,
    pub purpose: String,
    pub worker_kind: String,
    /// Resolved variant name sent to the execution service.
    pub agent: String,
    pub provider: String,
    /// Qualified model, when a healthy alternative was resolved.
    pub model: Option<String>,
    pub prompt: String,
    pub status: TrackStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub last_activity: Option<String>,
    pub result: Option<String>,
    pub is_winner: bool,
}

impl ParallelTrack {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn matches(&self, key: &str) -> bool {
        self.track_id == key || self.session_id.as_deref() == Some(key)
    }

    pub fn transition(&mut self, to: TrackStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(PilotError::InvalidTrackTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.last_activity_at = now;
        if to == TrackStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Move to a terminal status. Already-terminal tracks are left alone and
    /// `false` is returned.
    pub fn finish(&mut self, to: TrackStatus, result: Option<String>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() || self.transition(to, now).is_err() {
            return false;
        }
        if result.is_some() {
            self.result = result;
        }
        true
    }

    pub fn touch(&mut self, activity: Option<String>, now: DateTime<Utc>) {
        self.last_activity_at = now;
        if activity.is_some() {
            self.last_activity = activity;
        }
    }

    /// Run time so far, or total once terminal. `None` before start.
    pub fn duration_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        let started = self.started_at?;
        Some(elapsed_ms(started, self.completed_at.unwrap_or(now)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLimits {
    pub default_cap: usize,
    pub provider_caps: HashMap<String, usize>,
    pub queue_enabled: bool,
}

impl GroupLimits {
    pub fn provider_cap(&self, provider: &str) -> Option<usize> {
        self.provider_caps.get(provider).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedTrack {
    pub purpose: String,
    pub agent: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub group_id: String,
    pub parent_id: String,
    pub label: String,
    pub tracks: Vec<ParallelTrack>,
    /// Pending track ids in submission order.
    pub queue: VecDeque<String>,
    pub limits: GroupLimits,
    /// Running tracks allowed at once in this group.
    pub concurrency: usize,
    pub dropped: Vec<DroppedTrack>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub winner_session_id: Option<String>,
    pub winner_rationale: Option<String>,
}

impl ParallelGroup {
    pub fn track(&self, key: &str) -> Option<&ParallelTrack> {
        self.tracks.iter().find(|t| t.matches(key))
    }

    pub fn track_mut(&mut self, key: &str) -> Option<&mut ParallelTrack> {
        self.tracks.iter_mut().find(|t| t.matches(key))
    }

    pub fn running_count(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.status == TrackStatus::Running)
            .count()
    }

    pub fn running_for_provider(&self, provider: &str) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.status == TrackStatus::Running && t.provider == provider)
            .count()
    }

    pub fn has_running(&self) -> bool {
        self.tracks.iter().any(|t| t.status == TrackStatus::Running)
    }

    pub fn completed_count(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.status == TrackStatus::Completed)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.tracks.iter().all(ParallelTrack::is_terminal)
    }

    pub fn free_slots(&self) -> usize {
        self.concurrency.saturating_sub(self.running_count())
    }

    /// Stamp `completed_at` the first time every track is terminal.
    pub(crate) fn refresh_completion(&mut self, now: DateTime<Utc>) -> bool {
        if self.completed_at.is_none() && self.is_complete() {
            self.completed_at = Some(now);
            return true;
        }
        false
    }

    pub(crate) fn remove_from_queue(&mut self, track_id: &str) {
        self.queue.retain(|id| id != track_id);
    }
}
