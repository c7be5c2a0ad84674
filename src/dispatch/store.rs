//! Injected registry of dispatch groups, shared by the orchestrator and the
//! poller.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::group::{ParallelGroup, ParallelTrack, TrackStatus};
use crate::error::{PilotError, Result};

#[derive(Default)]
pub struct GroupStore {
    groups: Mutex<HashMap<String, ParallelGroup>>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, group: ParallelGroup) {
        self.groups.lock().insert(group.group_id.clone(), group);
    }

    pub fn get(&self, group_id: &str) -> Option<ParallelGroup> {
        self.groups.lock().get(group_id).cloned()
    }

    pub fn remove(&self, group_id: &str) -> Option<ParallelGroup> {
        self.groups.lock().remove(group_id)
    }

    /// Apply `f` to a group under the store lock. `f` must not block.
    pub fn update<R>(&self, group_id: &str, f: impl FnOnce(&mut ParallelGroup) -> R) -> Result<R> {
        let mut groups = self.groups.lock();
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| PilotError::GroupNotFound(group_id.to_string()))?;
        Ok(f(group))
    }

    /// All groups, oldest first.
    pub fn list(&self) -> Vec<ParallelGroup> {
        let mut groups: Vec<ParallelGroup> = self.groups.lock().values().cloned().collect();
        groups.sort_by(|a, b| (a.created_at, &a.group_id).cmp(&(b.created_at, &b.group_id)));
        groups
    }

    pub fn groups_for_parent(&self, parent_id: &str) -> Vec<ParallelGroup> {
        self.list()
            .into_iter()
            .filter(|g| g.parent_id == parent_id)
            .collect()
    }

    pub fn parent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .groups
            .lock()
            .values()
            .map(|g| g.parent_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        ids
    }

    pub fn has_running(&self) -> bool {
        self.groups.lock().values().any(ParallelGroup::has_running)
    }

    /// True when any group still has tracks waiting for capacity.
    pub fn has_queued(&self) -> bool {
        self.groups.lock().values().any(|g| !g.queue.is_empty())
    }

    /// Running tracks for a provider across every group.
    pub fn running_for_provider(&self, provider: &str) -> usize {
        self.groups
            .lock()
            .values()
            .map(|g| g.running_for_provider(provider))
            .sum()
    }

    /// `(group_id, track_id)` of the track bound to a remote session.
    pub fn locate_session(&self, session_id: &str) -> Option<(String, String)> {
        self.groups.lock().values().find_map(|g| {
            g.tracks
                .iter()
                .find(|t| t.session_id.as_deref() == Some(session_id))
                .map(|t| (g.group_id.clone(), t.track_id.clone()))
        })
    }

    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.lock().is_empty()
    }

    /// Drop groups completed longer than `ttl` ago.
    pub fn prune_completed(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let mut groups = self.groups.lock();
        let expired: Vec<String> = groups
            .values()
            .filter(|g| g.completed_at.is_some_and(|at| now - at >= ttl))
            .map(|g| g.group_id.clone())
            .collect();
        for id in &expired {
            groups.remove(id);
            debug!(group_id = %id, "Pruned completed group");
        }
        expired
    }

    /// Move queued tracks of a group to `running` while both the group's
    /// concurrency and the provider caps (counted across all groups) allow.
    ///
    /// Submission order is kept: the first track that does not fit stops the
    /// walk, unless `skip_blocked` is set. Returns the reserved tracks.
    pub(crate) fn reserve_queued(
        &self,
        group_id: &str,
        now: DateTime<Utc>,
        skip_blocked: bool,
    ) -> Result<Vec<ParallelTrack>> {
        let mut groups = self.groups.lock();

        let mut provider_running: HashMap<String, usize> = HashMap::new();
        for track in groups
            .values()
            .flat_map(|g| g.tracks.iter())
            .filter(|t| t.status == TrackStatus::Running)
        {
            *provider_running.entry(track.provider.clone()).or_default() += 1;
        }

        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| PilotError::GroupNotFound(group_id.to_string()))?;

        let queued: Vec<String> = group.queue.iter().cloned().collect();
        let mut reserved = Vec::new();

        for track_id in queued {
            if group.free_slots() == 0 {
                break;
            }
            let cap = {
                let Some(track) = group.track(&track_id) else {
                    continue;
                };
                if track.status != TrackStatus::Pending {
                    continue;
                }
                group
                    .limits
                    .provider_cap(&track.provider)
                    .map(|cap| (track.provider.clone(), cap))
            };

            if let Some((provider, cap)) = &cap
                && provider_running.get(provider).copied().unwrap_or(0) >= *cap
            {
                debug!(group_id, track_id = %track_id, provider = %provider, cap, "Provider at capacity");
                if skip_blocked {
                    continue;
                }
                break;
            }

            let Some(track) = group.track_mut(&track_id) else {
                continue;
            };
            track.transition(TrackStatus::Running, now)?;
            *provider_running.entry(track.provider.clone()).or_default() += 1;
            reserved.push(track.clone());
        }

        let pending: HashSet<String> = group
            .tracks
            .iter()
            .filter(|t| t.status == TrackStatus::Pending)
            .map(|t| t.track_id.clone())
            .collect();
        group.queue.retain(|id| pending.contains(id));

        Ok(reserved)
    }
}
