//! Parallel dispatch of worker sessions.
//!
//! - `DispatchPlan` / `Planner`: what to run
//! - `ParallelGroup` / `ParallelTrack`: runtime bookkeeping in a `GroupStore`
//! - `DispatchOrchestrator`: create, promote, collect, abort
//! - `WorkerClient`: the external execution service

mod client;
mod group;
mod merge;
mod orchestrator;
mod plan;
mod store;

pub use client::{
    CreateSessionRequest, MessageRole, PromptRequest, SessionStatus, WorkerClient, WorkerMessage,
    WorkerResult, WorkerSession, latest_assistant_text,
};
pub use group::{DroppedTrack, GroupLimits, ParallelGroup, ParallelTrack, TrackStatus};
pub use merge::{MergedResult, Verdict, inspect};
pub use orchestrator::{CollectedResults, DispatchOptions, DispatchOrchestrator, TrackResult};
pub use plan::{DispatchPlan, PlanKind, Planner, RESULT_FORMAT, TrackRequest};
pub use store::GroupStore;
