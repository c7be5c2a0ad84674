//! Keyed session state store.
//!
//! `get` never fails: unknown ids get a default state. Every named operation
//! applies one mutation under the lock, persists it synchronously, then
//! notifies observers before returning. A persistence failure switches the
//! store to in-memory operation for the rest of its lifetime; it is reported
//! once and never retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::events::SessionEvent;
use super::persistence::StatePersistence;
use super::types::{
    DecisionRecord, DispatchOutcome, FailureReason, Mode, Phase, ProfileOverride, SessionState,
    TargetCategory,
};
use crate::clock::SharedClock;
use crate::health::ModelHealthRecord;

#[derive(Debug, Clone)]
pub struct StateChange {
    pub session_id: String,
    pub state: SessionState,
    pub reason: String,
}

pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, change: &StateChange);
}

impl<F> StateObserver for F
where
    F: Fn(&StateChange) + Send + Sync,
{
    fn on_state_change(&self, change: &StateChange) {
        self(change)
    }
}

pub struct SessionStateStore {
    states: Mutex<HashMap<String, SessionState>>,
    persistence: Option<Box<dyn StatePersistence>>,
    durable: AtomicBool,
    observers: RwLock<Vec<Arc<dyn StateObserver>>>,
    failover_threshold: u32,
    clock: SharedClock,
}

impl SessionStateStore {
    pub fn in_memory(failover_threshold: u32, clock: SharedClock) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            persistence: None,
            durable: AtomicBool::new(false),
            observers: RwLock::new(Vec::new()),
            failover_threshold: failover_threshold.max(1),
            clock,
        }
    }

    pub fn with_persistence(
        persistence: Box<dyn StatePersistence>,
        failover_threshold: u32,
        clock: SharedClock,
    ) -> Self {
        Self {
            persistence: Some(persistence),
            durable: AtomicBool::new(true),
            ..Self::in_memory(failover_threshold, clock)
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) {
        self.observers.write().push(observer);
    }

    /// False once persistence has failed (or was never configured).
    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::Acquire)
    }

    pub fn failover_threshold(&self) -> u32 {
        self.failover_threshold
    }

    pub fn get(&self, session_id: &str) -> SessionState {
        let mut states = self.states.lock();
        self.entry(&mut states, session_id).clone()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn set_mode(&self, session_id: &str, mode: Mode) -> SessionState {
        self.update(session_id, "set_mode", |state, _| state.mode = mode)
    }

    pub fn set_phase(&self, session_id: &str, phase: Phase) -> SessionState {
        self.update(session_id, "set_phase", |state, _| state.phase = phase)
    }

    pub fn set_target(&self, session_id: &str, target: TargetCategory) -> SessionState {
        self.update(session_id, "set_target", |state, _| state.target = target)
    }

    pub fn record_failure(
        &self,
        session_id: &str,
        reason: FailureReason,
        summary: &str,
    ) -> SessionState {
        self.update(session_id, "record_failure", |state, now| {
            state.record_failure(reason, summary, now)
        })
    }

    pub fn set_candidate(&self, session_id: &str, candidate: &str) -> SessionState {
        self.update(session_id, "set_candidate", |state, _| {
            state.latest_candidate = Some(candidate.to_string());
            state.candidate_pending_verification = true;
            state.verified = false;
        })
    }

    pub fn clear_candidate(&self, session_id: &str) -> SessionState {
        self.update(session_id, "clear_candidate", |state, _| {
            state.latest_candidate = None;
            state.candidate_pending_verification = false;
        })
    }

    pub fn mark_model_unhealthy(&self, session_id: &str, model: &str, reason: &str) -> SessionState {
        self.update(session_id, "mark_model_unhealthy", |state, now| {
            state.model_health.insert(
                model.to_string(),
                ModelHealthRecord {
                    unhealthy_since: now,
                    reason: reason.to_string(),
                },
            );
        })
    }

    pub fn clear_model_unhealthy(&self, session_id: &str, model: &str) -> SessionState {
        self.update(session_id, "clear_model_unhealthy", |state, _| {
            state.model_health.remove(model);
        })
    }

    /// Record a dispatch result for a worker kind. The returned state has
    /// `pending_failover` set once the kind reaches the failover threshold.
    pub fn record_dispatch_outcome(
        &self,
        session_id: &str,
        worker_kind: &str,
        outcome: DispatchOutcome,
    ) -> SessionState {
        self.record_dispatch_outcome_checked(session_id, worker_kind, outcome)
            .0
    }

    /// Like [`record_dispatch_outcome`](Self::record_dispatch_outcome), also
    /// reporting whether this call triggered failover.
    pub fn record_dispatch_outcome_checked(
        &self,
        session_id: &str,
        worker_kind: &str,
        outcome: DispatchOutcome,
    ) -> (SessionState, bool) {
        let threshold = self.failover_threshold;
        let (state, triggered) =
            self.mutate(session_id, "record_dispatch_outcome", |state, now| {
                state.record_dispatch_outcome(worker_kind, outcome, threshold, now)
            });
        if triggered {
            warn!(
                session_id,
                worker_kind,
                consecutive_failures = threshold,
                "Dispatch failure threshold reached, failover pending"
            );
        }
        (state, triggered)
    }

    pub fn set_profile_override(
        &self,
        session_id: &str,
        worker_kind: &str,
        model: &str,
        variant: &str,
    ) -> SessionState {
        self.update(session_id, "set_profile_override", |state, _| {
            state.profile_overrides.insert(
                worker_kind.to_string(),
                ProfileOverride {
                    model: model.to_string(),
                    variant: variant.to_string(),
                },
            );
        })
    }

    pub fn clear_profile_override(&self, session_id: &str, worker_kind: &str) -> SessionState {
        self.update(session_id, "clear_profile_override", |state, _| {
            state.profile_overrides.remove(worker_kind);
        })
    }

    pub fn record_oracle_progress(
        &self,
        session_id: &str,
        passed: u32,
        failed: u32,
        total: u32,
    ) -> SessionState {
        self.update(session_id, "record_oracle_progress", |state, _| {
            state.oracle_progress.passed = passed;
            state.oracle_progress.failed = failed;
            state.oracle_progress.total = total.max(passed.saturating_add(failed));
        })
    }

    pub fn set_last_decision(&self, session_id: &str, decision: DecisionRecord) -> SessionState {
        self.update(session_id, "set_last_decision", |state, _| {
            state.last_decision = Some(decision)
        })
    }

    pub fn reset_loop_counters(&self, session_id: &str) -> SessionState {
        self.update(session_id, "reset_loop_counters", |state, _| {
            state.reset_loop_counters()
        })
    }

    pub fn apply_event(&self, session_id: &str, event: SessionEvent) -> SessionState {
        let reason = format!("event:{}", event);
        self.update(session_id, &reason, |state, now| {
            state.apply_event(event, now)
        })
    }

    fn update<F>(&self, session_id: &str, reason: &str, f: F) -> SessionState
    where
        F: FnOnce(&mut SessionState, DateTime<Utc>),
    {
        self.mutate(session_id, reason, f).0
    }

    fn mutate<F, R>(&self, session_id: &str, reason: &str, f: F) -> (SessionState, R)
    where
        F: FnOnce(&mut SessionState, DateTime<Utc>) -> R,
    {
        let now = self.clock.now();
        let (snapshot, out) = {
            let mut states = self.states.lock();
            let state = self.entry(&mut states, session_id);
            let out = f(state, now);
            state.updated_at = Some(now);
            let snapshot = state.clone();
            self.persist(session_id, &snapshot);
            (snapshot, out)
        };

        debug!(session_id, reason, "Session state updated");
        self.notify(StateChange {
            session_id: session_id.to_string(),
            state: snapshot.clone(),
            reason: reason.to_string(),
        });
        (snapshot, out)
    }

    fn entry<'a>(
        &self,
        states: &'a mut HashMap<String, SessionState>,
        session_id: &str,
    ) -> &'a mut SessionState {
        states
            .entry(session_id.to_string())
            .or_insert_with(|| self.restore(session_id).unwrap_or_default())
    }

    fn restore(&self, session_id: &str) -> Option<SessionState> {
        if !self.is_durable() {
            return None;
        }
        let persistence = self.persistence.as_ref()?;
        match persistence.load(session_id) {
            Ok(state) => state,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to restore session state, using defaults");
                None
            }
        }
    }

    fn persist(&self, session_id: &str, state: &SessionState) {
        if !self.is_durable() {
            return;
        }
        let Some(persistence) = self.persistence.as_ref() else {
            return;
        };
        if let Err(e) = persistence.save(session_id, state)
            && self.durable.swap(false, Ordering::AcqRel)
        {
            warn!(
                session_id,
                error = %e,
                "Session state persistence failed, continuing in memory only"
            );
        }
    }

    fn notify(&self, change: StateChange) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_state_change(&change);
        }
    }
}
