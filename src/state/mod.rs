//! Per-session state: mode, phase, loop counters, failure history and
//! dispatch health, kept in memory and mirrored to disk.

mod events;
mod persistence;
mod store;
mod types;

use crate::error::PilotError;

fn state_err(msg: impl std::fmt::Display) -> PilotError {
    PilotError::StatePersistence(msg.to_string())
}

fn state_err_with<E: std::fmt::Display>(context: &str, err: E) -> PilotError {
    state_err(format!("{}: {}", context, err))
}

pub use events::SessionEvent;
pub(crate) use persistence::{file_safe, write_atomic};
pub use persistence::{JsonFileStatePersistence, StatePersistence};
pub use store::{SessionStateStore, StateChange, StateObserver};
pub use types::{
    DecisionRecord, DispatchOutcome, FailureReason, Mode, OracleProgress, Phase, ProfileOverride,
    SessionState, TargetCategory, WorkerHealth,
};
