//! Background reconciliation of running tracks.
//!
//! One tick at a time: a tick requested while another is in flight is
//! skipped, not queued. Idle ticks (nothing running or queued, nothing left
//! to announce) do no remote calls.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::elapsed_ms;
use crate::config::PollerConfig;
use crate::dispatch::{DispatchOrchestrator, ParallelGroup, SessionStatus, TrackStatus};
use crate::error::WorkerError;
use crate::notes::{Note, NoteSink};
use crate::notification::{DispatchEvent, EventType};
use crate::snapshot::{DispatchSnapshot, SnapshotWriter};
use crate::state::SessionState;

/// Out-of-band session lifecycle signal from the execution service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    SessionDeleted { session_id: String },
    SessionIdle { session_id: String },
    SessionError { session_id: String, message: String },
    SessionActivity { session_id: String, activity: Option<String> },
}

impl LifecycleEvent {
    /// Parse a raw `(type, properties)` signal. Unknown types and signals
    /// without a session id yield `None`.
    pub fn from_raw(event_type: &str, props: &Value) -> Option<Self> {
        let session_id = raw_session_id(props)?;
        match event_type {
            "session.deleted" => Some(Self::SessionDeleted { session_id }),
            "session.idle" => Some(Self::SessionIdle { session_id }),
            "session.error" => Some(Self::SessionError {
                session_id,
                message: raw_error_message(props),
            }),
            "session.activity" | "session.updated" | "message.updated" => {
                Some(Self::SessionActivity {
                    session_id,
                    activity: props
                        .get("activity")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
            _ => None,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionDeleted { session_id }
            | Self::SessionIdle { session_id }
            | Self::SessionError { session_id, .. }
            | Self::SessionActivity { session_id, .. } => session_id,
        }
    }
}

fn raw_session_id(props: &Value) -> Option<String> {
    ["sessionID", "sessionId", "session_id"]
        .iter()
        .find_map(|key| props.get(*key).and_then(Value::as_str))
        .or_else(|| props.pointer("/info/id").and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn raw_error_message(props: &Value) -> String {
    props
        .pointer("/error/message")
        .or_else(|| props.pointer("/error/data/message"))
        .or_else(|| props.get("error"))
        .or_else(|| props.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("session error")
        .to_string()
}

/// What a tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub skipped: bool,
    pub idle: bool,
    pub pruned: usize,
    pub completed: usize,
    pub failed: usize,
    pub promoted: usize,
    pub announced: Vec<String>,
}

pub struct BackgroundPoller {
    inner: Arc<PollerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct PollerInner {
    orchestrator: Arc<DispatchOrchestrator>,
    config: PollerConfig,
    in_flight: AtomicBool,
    announced: Mutex<HashSet<String>>,
    snapshots: Option<SnapshotWriter>,
    notes: Option<Arc<dyn NoteSink>>,
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BackgroundPoller {
    pub fn new(orchestrator: Arc<DispatchOrchestrator>, config: &PollerConfig) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                orchestrator,
                config: config.clone(),
                in_flight: AtomicBool::new(false),
                announced: Mutex::new(HashSet::new()),
                snapshots: None,
                notes: None,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Builder methods take effect only before `ensure_polling`.
    pub fn with_snapshots(mut self, writer: SnapshotWriter) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.snapshots = Some(writer),
            None => warn!("Poller already running; snapshot writer ignored"),
        }
        self
    }

    pub fn with_notes(mut self, sink: Arc<dyn NoteSink>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.notes = Some(sink),
            None => warn!("Poller already running; note sink ignored"),
        }
        self
    }

    /// Start the polling loop unless it is already running. Returns true when
    /// this call started it.
    pub fn ensure_polling(&self) -> bool {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let inner = Arc::clone(&self.inner);
        let period = Duration::from_millis(inner.config.interval_ms.max(1));
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                inner.tick().await;
            }
        }));
        info!(interval_ms = period.as_millis() as u64, "Background polling started");
        true
    }

    pub fn stop_polling(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                handle.abort();
                info!("Background polling stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub async fn tick(&self) -> TickReport {
        self.inner.tick().await
    }

    /// Apply a lifecycle signal to the track bound to its session. Returns
    /// false when no track is bound to the session or nothing changed.
    pub async fn handle_event(&self, event: LifecycleEvent) -> bool {
        self.inner.handle_event(event).await
    }
}

impl Drop for BackgroundPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

impl PollerInner {
    async fn tick(&self) -> TickReport {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Tick already in flight, skipping");
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        }
        let _guard = TickGuard(&self.in_flight);

        let groups = self.orchestrator.groups();
        if !groups.has_running() && !groups.has_queued() && !self.has_unannounced() {
            return TickReport {
                idle: true,
                ..TickReport::default()
            };
        }

        let mut report = TickReport::default();
        report.pruned = self.prune_stale().await;
        let (completed, failed) = self.poll_status().await;
        report.completed = completed;
        report.failed = failed;
        report.promoted = self.promote_queued().await;
        report.announced = self.announce_completed().await;

        let ttl = chrono::Duration::seconds(self.config.completed_group_ttl_secs as i64);
        let pruned_groups = groups.prune_completed(self.orchestrator.clock().now(), ttl);
        if !pruned_groups.is_empty() {
            let mut announced = self.announced.lock();
            for id in &pruned_groups {
                announced.remove(id);
            }
        }

        self.write_snapshots();
        report
    }

    fn has_unannounced(&self) -> bool {
        let announced = self.announced.lock().clone();
        self.orchestrator
            .groups()
            .list()
            .iter()
            .any(|g| g.completed_at.is_some() && !announced.contains(&g.group_id))
    }

    async fn prune_stale(&self) -> usize {
        let now = self.orchestrator.clock().now();
        let ttl_ms = self.config.stale_track_ttl_secs.saturating_mul(1000);
        let stale: Vec<(String, String, u64)> = self
            .orchestrator
            .groups()
            .list()
            .iter()
            .flat_map(|g| {
                g.tracks
                    .iter()
                    .filter(|t| t.status == TrackStatus::Running)
                    .map(|t| (g.group_id.clone(), t.track_id.clone(), elapsed_ms(t.last_activity_at, now)))
                    .collect::<Vec<_>>()
            })
            .filter(|(_, _, idle_ms)| *idle_ms >= ttl_ms)
            .collect();

        let mut pruned = 0;
        for (group_id, track_id, idle_ms) in stale {
            let reason = format!("stale: no activity for {}s", idle_ms / 1000);
            match self
                .orchestrator
                .expire_track(&group_id, &track_id, &reason, true)
                .await
            {
                Ok(true) => pruned += 1,
                Ok(false) => {}
                Err(e) => warn!(group_id = %group_id, track_id = %track_id, error = %e, "Failed to prune stale track"),
            }
        }
        pruned
    }

    async fn poll_status(&self) -> (usize, usize) {
        let running: Vec<(String, String, String)> = self
            .orchestrator
            .groups()
            .list()
            .iter()
            .flat_map(|g| {
                g.tracks
                    .iter()
                    .filter(|t| t.status == TrackStatus::Running)
                    .filter_map(|t| {
                        t.session_id
                            .clone()
                            .map(|sid| (g.group_id.clone(), t.track_id.clone(), sid))
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        if running.is_empty() {
            return (0, 0);
        }

        let statuses = match self.orchestrator.client().status().await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(error = %e, "Status poll failed");
                return (0, 0);
            }
        };

        let (mut completed, mut failed) = (0, 0);
        for (group_id, track_id, session_id) in running {
            let outcome = match statuses.get(&session_id) {
                None | Some(SessionStatus::Idle) => self
                    .orchestrator
                    .complete_track(&group_id, &track_id, Some("idle".to_string()))
                    .await
                    .map(|done| {
                        completed += usize::from(done);
                    }),
                Some(SessionStatus::Error { message }) => self
                    .orchestrator
                    .fail_track(&group_id, &track_id, &WorkerError::from_message(message))
                    .await
                    .map(|done| {
                        failed += usize::from(done);
                    }),
                // Only a reported activity counts as a heartbeat.
                Some(SessionStatus::Busy {
                    activity: Some(activity),
                }) => {
                    self.orchestrator
                        .touch_track(&group_id, &track_id, Some(activity.clone()));
                    Ok(())
                }
                Some(SessionStatus::Busy { activity: None }) => Ok(()),
            };
            if let Err(e) = outcome {
                warn!(group_id = %group_id, track_id = %track_id, error = %e, "Failed to update track");
            }
        }
        (completed, failed)
    }

    async fn promote_queued(&self) -> usize {
        let queued: Vec<String> = self
            .orchestrator
            .groups()
            .list()
            .into_iter()
            .filter(|g| !g.queue.is_empty())
            .map(|g| g.group_id)
            .collect();

        let mut promoted = 0;
        for group_id in queued {
            match self.orchestrator.dispatch_queued_tracks(&group_id).await {
                Ok(n) => promoted += n,
                Err(e) => warn!(group_id = %group_id, error = %e, "Failed to promote queued tracks"),
            }
        }
        promoted
    }

    /// Announce each completed group once, keyed by group id.
    async fn announce_completed(&self) -> Vec<String> {
        let completed: Vec<ParallelGroup> = {
            let groups = self.orchestrator.groups().list();
            let mut announced = self.announced.lock();
            groups
                .into_iter()
                .filter(|g| g.completed_at.is_some())
                .filter(|g| announced.insert(g.group_id.clone()))
                .collect()
        };

        let mut ids = Vec::with_capacity(completed.len());
        for group in completed {
            self.announce(&group).await;
            ids.push(group.group_id);
        }
        ids
    }

    async fn announce(&self, group: &ParallelGroup) {
        let now = self.orchestrator.clock().now();
        let collected = match self.orchestrator.collect_results(&group.group_id).await {
            Ok(collected) => Some(collected),
            Err(e) => {
                warn!(group_id = %group.group_id, error = %e, "Failed to collect results");
                None
            }
        };

        if let (Some(sink), Some(collected)) = (&self.notes, &collected) {
            let body = serde_json::to_value(collected).unwrap_or(Value::Null);
            let note = Note {
                parent_id: group.parent_id.clone(),
                group_id: Some(group.group_id.clone()),
                title: format!("group completed: {}", group.label),
                body,
                created_at: now,
            };
            if let Err(e) = sink.append(note).await {
                warn!(group_id = %group.group_id, error = %e, "Failed to append note");
            } else if let Err(e) = sink.flush().await {
                warn!(group_id = %group.group_id, error = %e, "Failed to flush notes");
            }
        }

        let quarantined = collected
            .as_ref()
            .map(|c| c.quarantined_session_ids.len())
            .unwrap_or(0);
        info!(
            group_id = %group.group_id,
            parent_id = %group.parent_id,
            completed = group.completed_count(),
            total = group.tracks.len(),
            quarantined,
            "Group completed"
        );

        let mut event = DispatchEvent::new(EventType::GroupCompleted, &group.parent_id, now)
            .with_group(&group.group_id)
            .with_progress(group.completed_count(), group.tracks.len());
        if let Some(winner) = &group.winner_session_id {
            event = event.with_message(format!("winner: {}", winner));
        }
        self.orchestrator.notifier().notify(&event).await;
    }

    async fn handle_event(&self, event: LifecycleEvent) -> bool {
        let Some((group_id, track_id)) = self
            .orchestrator
            .groups()
            .locate_session(event.session_id())
        else {
            debug!(session_id = event.session_id(), "Lifecycle event for unknown session");
            return false;
        };

        let changed = match event {
            LifecycleEvent::SessionDeleted { .. } => {
                self.orchestrator
                    .expire_track(&group_id, &track_id, "remote session deleted", false)
                    .await
            }
            LifecycleEvent::SessionIdle { .. } => {
                self.orchestrator
                    .complete_track(&group_id, &track_id, Some("idle".to_string()))
                    .await
            }
            LifecycleEvent::SessionError { message, .. } => {
                self.orchestrator
                    .fail_track(&group_id, &track_id, &WorkerError::from_message(&message))
                    .await
            }
            LifecycleEvent::SessionActivity { activity, .. } => {
                return self.orchestrator.touch_track(&group_id, &track_id, activity);
            }
        };

        match changed {
            Ok(true) => {
                if let Err(e) = self.orchestrator.dispatch_queued_tracks(&group_id).await {
                    warn!(group_id = %group_id, error = %e, "Failed to promote queued tracks");
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(group_id = %group_id, error = %e, "Failed to apply lifecycle event");
                false
            }
        }
    }

    fn write_snapshots(&self) {
        let Some(writer) = &self.snapshots else {
            return;
        };
        let now = self.orchestrator.clock().now();
        let groups = self.orchestrator.groups().list();
        let parents = self.orchestrator.groups().parent_ids();

        for parent_id in parents {
            let state = self
                .orchestrator
                .state_store()
                .map(|store| store.get(&parent_id))
                .unwrap_or_else(SessionState::default);
            let snapshot = DispatchSnapshot::build(&parent_id, &state, &groups, now);
            if let Err(e) = writer.write(&snapshot) {
                warn!(parent_id = %parent_id, error = %e, "Failed to write dispatch snapshot");
            }
        }
    }
}
