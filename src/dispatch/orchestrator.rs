//! Bounded-concurrency dispatch of worker sessions.
//!
//! Locks on the group store are only taken for bookkeeping and never held
//! across a call to the worker client. Every remote call is followed by a
//! re-read of the track, so a concurrent abort always wins: a session created
//! for a track that was aborted meanwhile is aborted remotely right away.
//!
//! Remote errors never escape: creation and prompt failures become `failed`
//! tracks, abort errors are logged, message fetch errors skip the track.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{
    CreateSessionRequest, PromptRequest, WorkerClient, latest_assistant_text,
};
use super::group::{DroppedTrack, GroupLimits, ParallelGroup, ParallelTrack, TrackStatus};
use super::merge::{MergedResult, Verdict, inspect};
use super::plan::DispatchPlan;
use super::store::GroupStore;
use crate::clock::SharedClock;
use crate::config::{DispatchConfig, ModelRef, PilotConfig};
use crate::error::{PilotError, Result, WorkerError};
use crate::health::ModelHealthRegistry;
use crate::notification::{DispatchEvent, EventType, Notifier};
use crate::state::{DispatchOutcome, SessionState, SessionStateStore};

/// Messages fetched per track when collecting results.
const MESSAGE_LIMIT: usize = 20;

/// Per-call overrides of the configured dispatch limits.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub default_cap: Option<usize>,
    pub queue_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackResult {
    pub track_id: String,
    pub session_id: String,
    pub agent: String,
    pub purpose: String,
    pub status: TrackStatus,
    /// Latest assistant text, if the session produced any.
    pub text: Option<String>,
    pub structured: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectedResults {
    pub group_id: String,
    /// Non-quarantined tracks only.
    pub results: Vec<TrackResult>,
    pub merged: MergedResult,
    /// Never trust output from these sessions.
    pub quarantined_session_ids: Vec<String>,
}

pub struct DispatchOrchestrator {
    client: Arc<dyn WorkerClient>,
    groups: Arc<GroupStore>,
    health: Arc<ModelHealthRegistry>,
    states: Option<Arc<SessionStateStore>>,
    notifier: Notifier,
    config: DispatchConfig,
    cooldown: Duration,
    clock: SharedClock,
    /// Parents whose persisted model health was fed into `health`.
    restored_parents: Mutex<HashSet<String>>,
}

impl DispatchOrchestrator {
    pub fn new(
        client: Arc<dyn WorkerClient>,
        groups: Arc<GroupStore>,
        health: Arc<ModelHealthRegistry>,
        config: &PilotConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            client,
            groups,
            health,
            states: None,
            notifier: Notifier::disabled(),
            config: config.dispatch.clone(),
            cooldown: Duration::from_millis(config.health.cooldown_ms),
            clock,
            restored_parents: Mutex::new(HashSet::new()),
        }
    }

    /// Feed dispatch outcomes and failover into session state.
    pub fn with_state_store(mut self, states: Arc<SessionStateStore>) -> Self {
        self.states = Some(states);
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn groups(&self) -> &Arc<GroupStore> {
        &self.groups
    }

    pub fn health(&self) -> &Arc<ModelHealthRegistry> {
        &self.health
    }

    pub fn client(&self) -> &Arc<dyn WorkerClient> {
        &self.client
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn state_store(&self) -> Option<&Arc<SessionStateStore>> {
        self.states.as_ref()
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Create a group for `plan` and start as many tracks as capacity allows.
    ///
    /// Group concurrency is `min(max_tracks, default_cap)`. Tracks that do not
    /// fit are queued in submission order, or dropped with a reason when
    /// queueing is disabled.
    pub async fn dispatch(
        &self,
        parent_id: &str,
        plan: &DispatchPlan,
        max_tracks: usize,
        opts: DispatchOptions,
    ) -> Result<ParallelGroup> {
        if plan.is_empty() {
            return Err(PilotError::EmptyPlan(plan.label.clone()));
        }

        let now = self.clock.now();
        let limits = GroupLimits {
            default_cap: opts.default_cap.unwrap_or(self.config.default_cap).max(1),
            provider_caps: self.config.provider_caps.clone(),
            queue_enabled: opts.queue_enabled.unwrap_or(self.config.queue_enabled),
        };
        let concurrency = max_tracks.max(1).min(limits.default_cap);
        let group_id = format!("grp_{}", &Uuid::new_v4().simple().to_string()[..12]);

        let tracks: Vec<ParallelTrack> = plan
            .tracks
            .iter()
            .enumerate()
            .map(|(i, request)| {
                let profile = self.resolve_profile(parent_id, &request.agent);
                ParallelTrack {
                    track_id: format!("t{}", i + 1),
                    session_id: None,
                    purpose: request.purpose.clone(),
                    worker_kind: request.agent.clone(),
                    agent: profile.agent,
                    provider: profile.provider,
                    model: profile.model,
                    prompt: request.prompt.clone(),
                    status: TrackStatus::Pending,
                    created_at: now,
                    started_at: None,
                    completed_at: None,
                    last_activity_at: now,
                    last_activity: None,
                    result: None,
                    is_winner: false,
                }
            })
            .collect();
        let total = tracks.len();
        let queue_enabled = limits.queue_enabled;

        self.groups.insert(ParallelGroup {
            group_id: group_id.clone(),
            parent_id: parent_id.to_string(),
            label: plan.label.clone(),
            queue: tracks.iter().map(|t| t.track_id.clone()).collect(),
            tracks,
            limits,
            concurrency,
            dropped: Vec::new(),
            created_at: now,
            completed_at: None,
            winner_session_id: None,
            winner_rationale: None,
        });

        let initial = self.groups.reserve_queued(&group_id, now, !queue_enabled)?;
        let started = initial.len();
        if !queue_enabled {
            self.drop_unstarted(&group_id)?;
        }

        info!(
            group_id = %group_id,
            parent_id,
            label = %plan.label,
            tracks = total,
            concurrency,
            started,
            "Dispatching group"
        );

        self.launch(&group_id, parent_id, initial).await;
        self.promote(&group_id, parent_id, !queue_enabled).await?;

        let group = self
            .groups
            .get(&group_id)
            .ok_or_else(|| PilotError::GroupNotFound(group_id.clone()))?;

        self.notifier
            .notify(
                &DispatchEvent::new(EventType::GroupDispatched, parent_id, self.clock.now())
                    .with_group(&group_id)
                    .with_progress(group.running_count(), group.tracks.len())
                    .with_message(format!(
                        "{} ({} queued, {} dropped)",
                        group.label,
                        group.queue.len(),
                        group.dropped.len()
                    )),
            )
            .await;

        Ok(group)
    }

    /// Start queued tracks up to currently free capacity, in submission order.
    /// Returns the number of tracks started; zero when nothing fits.
    pub async fn dispatch_queued_tracks(&self, group_id: &str) -> Result<usize> {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| PilotError::GroupNotFound(group_id.to_string()))?;
        if group.queue.is_empty() {
            return Ok(0);
        }
        self.promote(group_id, &group.parent_id, false).await
    }

    /// Fetch the latest output of running and completed tracks, quarantine
    /// untrusted output and merge the rest.
    pub async fn collect_results(&self, group_id: &str) -> Result<CollectedResults> {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| PilotError::GroupNotFound(group_id.to_string()))?;

        let candidates: Vec<(ParallelTrack, String)> = group
            .tracks
            .iter()
            .filter(|t| matches!(t.status, TrackStatus::Running | TrackStatus::Completed))
            .filter_map(|t| t.session_id.clone().map(|sid| (t.clone(), sid)))
            .collect();

        let fetched = join_all(candidates.into_iter().map(|(track, session_id)| async move {
            let messages = self.client.messages(&session_id, MESSAGE_LIMIT).await;
            (track, session_id, messages)
        }))
        .await;

        let mut collected = CollectedResults {
            group_id: group_id.to_string(),
            ..CollectedResults::default()
        };
        let mut texts: HashMap<String, String> = HashMap::new();

        for (track, session_id, messages) in fetched {
            let messages = match messages {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(group_id, session_id = %session_id, error = %e, "Failed to fetch track messages");
                    continue;
                }
            };
            let text = latest_assistant_text(&messages).map(str::to_string);

            let verdict = text.as_deref().map(inspect).unwrap_or(Verdict::Unstructured);
            if let Verdict::Quarantined { reason } = &verdict {
                warn!(group_id, session_id = %session_id, reason = %reason, "Track output quarantined");
                collected.quarantined_session_ids.push(session_id);
                continue;
            }
            if let Verdict::Structured(block) = &verdict {
                collected.merged.absorb(block);
            }
            if let Some(text) = &text {
                texts.insert(track.track_id.clone(), text.clone());
            }

            collected.results.push(TrackResult {
                track_id: track.track_id,
                session_id,
                agent: track.agent,
                purpose: track.purpose,
                status: track.status,
                text,
                structured: matches!(verdict, Verdict::Structured(_)),
            });
        }

        if !texts.is_empty() {
            self.groups.update(group_id, |g| {
                for (track_id, text) in texts {
                    if let Some(track) = g.track_mut(&track_id) {
                        track.result = Some(text);
                    }
                }
            })?;
        }

        debug!(
            group_id,
            results = collected.results.len(),
            quarantined = collected.quarantined_session_ids.len(),
            "Collected group results"
        );
        Ok(collected)
    }

    /// Abort one track by track id or session id. Returns false when the
    /// track was already terminal.
    pub async fn abort_track(&self, group_id: &str, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let (parent_id, aborted) = self.groups.update(group_id, |g| {
            let track = g.track_mut(key).ok_or_else(|| PilotError::TrackNotFound {
                group_id: group_id.to_string(),
                track: key.to_string(),
            })?;
            let aborted = abort_local(track, "aborted by request", now);
            let track_id = track.track_id.clone();
            g.remove_from_queue(&track_id);
            g.refresh_completion(now);
            Ok::<_, PilotError>((g.parent_id.clone(), aborted))
        })??;

        let Some(session) = aborted else {
            return Ok(false);
        };
        if let Some(session_id) = &session {
            self.abort_remote(session_id).await;
        }

        let mut event = DispatchEvent::new(EventType::TrackAborted, &parent_id, now)
            .with_group(group_id)
            .with_message(format!("track {} aborted", key));
        if let Some(session_id) = session {
            event = event.with_session(session_id);
        }
        self.notifier.notify(&event).await;
        self.promote(group_id, &parent_id, false).await?;
        Ok(true)
    }

    /// Keep the winner and abort every other non-terminal track. The winner
    /// and rationale are recorded on the group.
    pub async fn abort_all_except(
        &self,
        group_id: &str,
        winner: &str,
        rationale: &str,
    ) -> Result<usize> {
        let now = self.clock.now();
        let (parent_id, sessions, count) = self.groups.update(group_id, |g| {
            let winner_id = g
                .track(winner)
                .map(|t| t.track_id.clone())
                .ok_or_else(|| PilotError::TrackNotFound {
                    group_id: group_id.to_string(),
                    track: winner.to_string(),
                })?;

            let mut sessions = Vec::new();
            let mut count = 0;
            for track in g.tracks.iter_mut() {
                if track.track_id == winner_id {
                    track.is_winner = true;
                    g.winner_session_id =
                        Some(track.session_id.clone().unwrap_or_else(|| track.track_id.clone()));
                    continue;
                }
                track.is_winner = false;
                if let Some(session) = abort_local(track, "aborted: another track won", now) {
                    count += 1;
                    sessions.extend(session);
                }
            }
            g.queue.retain(|id| *id == winner_id);
            g.winner_rationale = Some(rationale.to_string());
            g.refresh_completion(now);
            Ok::<_, PilotError>((g.parent_id.clone(), sessions, count))
        })??;

        info!(group_id, winner, aborted = count, "Winner selected");
        self.abort_remote_all(&sessions).await;
        if count > 0 {
            self.notifier
                .notify(
                    &DispatchEvent::new(EventType::TrackAborted, &parent_id, now)
                        .with_group(group_id)
                        .with_message(format!("{} tracks aborted, winner {}", count, winner)),
                )
                .await;
        }
        // A queued winner starts once the losers free their slots.
        self.promote(group_id, &parent_id, false).await?;
        Ok(count)
    }

    /// Abort every non-terminal track of the group.
    pub async fn abort_all(&self, group_id: &str, reason: &str) -> Result<usize> {
        let now = self.clock.now();
        let (parent_id, sessions, count) = self.groups.update(group_id, |g| {
            let mut sessions = Vec::new();
            let mut count = 0;
            for track in g.tracks.iter_mut() {
                if let Some(session) = abort_local(track, reason, now) {
                    count += 1;
                    sessions.extend(session);
                }
            }
            g.queue.clear();
            g.refresh_completion(now);
            (g.parent_id.clone(), sessions, count)
        })?;

        info!(group_id, aborted = count, reason, "Group aborted");
        self.abort_remote_all(&sessions).await;
        if count > 0 {
            self.notifier
                .notify(
                    &DispatchEvent::new(EventType::TrackAborted, &parent_id, now)
                        .with_group(group_id)
                        .with_message(format!("{} tracks aborted: {}", count, reason)),
                )
                .await;
        }
        Ok(count)
    }

    /// Abort every group of a parent session.
    pub async fn abort_parent(&self, parent_id: &str, reason: &str) -> Result<usize> {
        let mut total = 0;
        for group in self.groups.groups_for_parent(parent_id) {
            if !group.is_complete() {
                total += self.abort_all(&group.group_id, reason).await?;
            }
        }
        Ok(total)
    }

    /// Mark a running track completed and record a successful dispatch.
    pub(crate) async fn complete_track(
        &self,
        group_id: &str,
        track_id: &str,
        activity: Option<String>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let Some(track) = self.groups.update(group_id, |g| {
            let track = g.track_mut(track_id)?;
            if !track.finish(TrackStatus::Completed, None, now) {
                return None;
            }
            track.touch(activity, now);
            let track = track.clone();
            g.refresh_completion(now);
            Some((g.parent_id.clone(), track))
        })?
        else {
            return Ok(false);
        };
        let (parent_id, track) = track;

        debug!(group_id, track_id, "Track completed");
        self.record_success(&parent_id, &track);
        let mut event = DispatchEvent::new(EventType::TrackCompleted, &parent_id, now)
            .with_group(group_id)
            .with_message(track.purpose.clone());
        if let Some(session_id) = &track.session_id {
            event = event.with_session(session_id);
        }
        self.notifier.notify(&event).await;
        Ok(true)
    }

    /// Mark a track failed with `message` as its result.
    pub(crate) async fn fail_track(
        &self,
        group_id: &str,
        track_id: &str,
        error: &WorkerError,
    ) -> Result<bool> {
        let now = self.clock.now();
        let Some((parent_id, track)) = self.groups.update(group_id, |g| {
            let track = g.track_mut(track_id)?;
            if !track.finish(TrackStatus::Failed, Some(error.to_string()), now) {
                return None;
            }
            let track = track.clone();
            g.remove_from_queue(track_id);
            g.refresh_completion(now);
            Some((g.parent_id.clone(), track))
        })?
        else {
            return Ok(false);
        };

        warn!(group_id, track_id, error = %error, "Track failed");
        self.record_failure(&parent_id, &track, error).await;
        let mut event = DispatchEvent::new(EventType::TrackFailed, &parent_id, now)
            .with_group(group_id)
            .with_message(error.to_string());
        if let Some(session_id) = &track.session_id {
            event = event.with_session(session_id);
        }
        self.notifier.notify(&event).await;
        Ok(true)
    }

    /// Abort a track locally for a lifecycle reason (staleness, remote
    /// deletion). `abort_remote` also cancels the remote session.
    pub(crate) async fn expire_track(
        &self,
        group_id: &str,
        track_id: &str,
        reason: &str,
        abort_remote: bool,
    ) -> Result<bool> {
        let now = self.clock.now();
        let aborted = self.groups.update(group_id, |g| {
            let aborted = g
                .track_mut(track_id)
                .and_then(|track| abort_local(track, reason, now));
            g.remove_from_queue(track_id);
            g.refresh_completion(now);
            aborted
        })?;

        let Some(session) = aborted else {
            return Ok(false);
        };
        info!(group_id, track_id, reason, "Track expired");
        if abort_remote && let Some(session_id) = &session {
            self.abort_remote(session_id).await;
        }
        Ok(true)
    }

    /// Refresh the heartbeat of a running track. Returns false when the track
    /// is gone or no longer running.
    pub(crate) fn touch_track(
        &self,
        group_id: &str,
        track_id: &str,
        activity: Option<String>,
    ) -> bool {
        let now = self.clock.now();
        let touched = self.groups.update(group_id, |g| match g.track_mut(track_id) {
            Some(track) if track.status == TrackStatus::Running => {
                track.touch(activity, now);
                true
            }
            _ => false,
        });
        match touched {
            Ok(touched) => touched,
            Err(e) => {
                debug!(group_id, track_id, error = %e, "Skipping heartbeat");
                false
            }
        }
    }

    /// Reserve and launch queued tracks until nothing more fits. Launch
    /// failures free capacity, hence the loop.
    async fn promote(&self, group_id: &str, parent_id: &str, skip_blocked: bool) -> Result<usize> {
        let mut started = 0;
        loop {
            let reserved = self
                .groups
                .reserve_queued(group_id, self.clock.now(), skip_blocked)?;
            if reserved.is_empty() {
                break;
            }
            started += reserved.len();
            self.launch(group_id, parent_id, reserved).await;
        }
        if started > 0 {
            debug!(group_id, started, "Promoted queued tracks");
        }
        Ok(started)
    }

    async fn launch(&self, group_id: &str, parent_id: &str, tracks: Vec<ParallelTrack>) {
        join_all(
            tracks
                .into_iter()
                .map(|track| self.start_track(group_id, parent_id, track)),
        )
        .await;
    }

    async fn start_track(&self, group_id: &str, parent_id: &str, track: ParallelTrack) {
        let request = CreateSessionRequest {
            parent_id: parent_id.to_string(),
            agent: track.agent.clone(),
            title: track.purpose.clone(),
        };
        let session = match self.client.create(request).await {
            Ok(session) => session,
            Err(e) => {
                let _ = self.fail_track(group_id, &track.track_id, &e).await;
                return;
            }
        };

        let now = self.clock.now();
        let still_running = self
            .groups
            .update(group_id, |g| {
                let Some(t) = g.track_mut(&track.track_id) else {
                    return false;
                };
                t.session_id = Some(session.id.clone());
                if t.status != TrackStatus::Running {
                    return false;
                }
                t.touch(Some("session created".to_string()), now);
                // A winner picked while still queued gets its session id now.
                let is_winner = t.is_winner;
                if is_winner {
                    g.winner_session_id = Some(session.id.clone());
                }
                true
            })
            .unwrap_or(false);
        if !still_running {
            debug!(group_id, session_id = %session.id, "Track aborted during creation");
            self.abort_remote(&session.id).await;
            return;
        }

        let prompt = PromptRequest {
            session_id: session.id.clone(),
            agent: track.agent.clone(),
            text: track.prompt.clone(),
        };
        if let Err(e) = self.client.prompt_async(prompt).await {
            if let Ok(true) = self.fail_track(group_id, &track.track_id, &e).await {
                self.abort_remote(&session.id).await;
            }
            return;
        }

        debug!(
            group_id,
            track_id = %track.track_id,
            session_id = %session.id,
            agent = %track.agent,
            "Track started"
        );
    }

    fn drop_unstarted(&self, group_id: &str) -> Result<()> {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| PilotError::GroupNotFound(group_id.to_string()))?;
        let group_full = group.free_slots() == 0;
        let reasons: HashMap<String, String> = group
            .queue
            .iter()
            .filter_map(|id| group.track(id))
            .map(|t| {
                let reason = match group.limits.provider_cap(&t.provider) {
                    Some(cap) if self.groups.running_for_provider(&t.provider) >= cap => {
                        format!("provider '{}' at cap {}", t.provider, cap)
                    }
                    _ if group_full => format!("group at concurrency {}", group.concurrency),
                    _ => "no capacity".to_string(),
                };
                (t.track_id.clone(), reason)
            })
            .collect();

        let now = self.clock.now();
        self.groups.update(group_id, |g| {
            let queued: VecDeque<String> = std::mem::take(&mut g.queue);
            for id in queued {
                let Some(pos) = g.tracks.iter().position(|t| t.track_id == id) else {
                    continue;
                };
                let track = g.tracks.remove(pos);
                let reason = reasons
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| "no capacity".to_string());
                debug!(group_id, track_id = %id, reason = %reason, "Track dropped");
                g.dropped.push(DroppedTrack {
                    purpose: track.purpose,
                    agent: track.worker_kind,
                    reason,
                });
            }
            g.refresh_completion(now);
        })
    }

    fn resolve_profile(&self, parent_id: &str, worker_kind: &str) -> TrackProfile {
        let state = self.states.as_ref().map(|states| states.get(parent_id));
        if let Some(state) = &state {
            self.restore_health(parent_id, state);
        }
        if let Some(pinned) = state
            .as_ref()
            .and_then(|s| s.profile_overrides.get(worker_kind))
            && self.health.is_model_healthy(&pinned.model, self.cooldown)
        {
            return TrackProfile {
                agent: pinned.variant.clone(),
                provider: ModelRef::parse(&pinned.model).provider,
                model: Some(pinned.model.clone()),
            };
        }

        let variant = self.health.resolve_healthy_variant(worker_kind, self.cooldown);
        match variant.model {
            Some(model) => TrackProfile {
                agent: variant.name,
                provider: model.provider.clone(),
                model: Some(model.qualified()),
            },
            None => TrackProfile {
                agent: variant.name,
                provider: ModelRef::parse(self.config.model_for(worker_kind)).provider,
                model: None,
            },
        }
    }

    /// Cooldowns persisted with a parent session outlive a restart: feed
    /// them into the registry the first time the parent dispatches.
    fn restore_health(&self, parent_id: &str, state: &SessionState) {
        if !self.restored_parents.lock().insert(parent_id.to_string()) {
            return;
        }
        let restored = self.health.restore(&state.model_health, self.cooldown);
        if restored > 0 {
            info!(parent_id, restored, "Restored model health from session state");
        }
    }

    fn record_success(&self, parent_id: &str, track: &ParallelTrack) {
        if let Some(model) = &track.model {
            self.health.clear(model);
            if let Some(states) = &self.states
                && states.get(parent_id).model_health.contains_key(model)
            {
                states.clear_model_unhealthy(parent_id, model);
            }
        }
        if let Some(states) = &self.states {
            states.record_dispatch_outcome(parent_id, &track.worker_kind, DispatchOutcome::Success);
        }
    }

    async fn record_failure(&self, parent_id: &str, track: &ParallelTrack, error: &WorkerError) {
        if error.is_transient()
            && let Some(model) = &track.model
        {
            let reason = error.to_string();
            self.health.mark_model_unhealthy(model, &reason);
            if let Some(states) = &self.states {
                states.mark_model_unhealthy(parent_id, model, &reason);
            }
        }

        let Some(states) = &self.states else {
            return;
        };
        let (_, triggered) =
            states.record_dispatch_outcome_checked(parent_id, &track.worker_kind, error.outcome());
        if triggered {
            self.trigger_failover(parent_id, track).await;
        }
    }

    /// Take the failing model out of rotation and pin the kind to the next
    /// healthy one.
    async fn trigger_failover(&self, parent_id: &str, track: &ParallelTrack) {
        let reason = "consecutive dispatch failures";
        if let Some(model) = &track.model {
            self.health.mark_model_unhealthy(model, reason);
            if let Some(states) = &self.states {
                states.mark_model_unhealthy(parent_id, model, reason);
            }
        }

        let next = self
            .health
            .resolve_healthy_variant(&track.worker_kind, self.cooldown);
        if let (Some(states), Some(model)) = (&self.states, &next.model) {
            states.set_profile_override(parent_id, &track.worker_kind, &model.qualified(), &next.name);
        }

        warn!(
            parent_id,
            worker_kind = %track.worker_kind,
            next = %next.name,
            "Failover triggered"
        );
        self.notifier
            .notify(
                &DispatchEvent::new(EventType::FailoverTriggered, parent_id, self.clock.now())
                    .with_message(format!("{} -> {}", track.worker_kind, next.name)),
            )
            .await;
    }

    async fn abort_remote(&self, session_id: &str) {
        if let Err(e) = self.client.abort(session_id).await {
            warn!(session_id, error = %e, "Remote abort failed, local state kept");
        }
    }

    async fn abort_remote_all(&self, sessions: &[String]) {
        join_all(sessions.iter().map(|sid| self.abort_remote(sid))).await;
    }
}

struct TrackProfile {
    agent: String,
    provider: String,
    model: Option<String>,
}

/// Abort a non-terminal track. Returns `Some(session_id)` when the track
/// changed state, `None` when it was already terminal.
fn abort_local(
    track: &mut ParallelTrack,
    reason: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Option<Option<String>> {
    if !track.finish(TrackStatus::Aborted, None, now) {
        return None;
    }
    track.touch(Some(reason.to_string()), now);
    Some(track.session_id.clone())
}
