pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod logging;
pub mod notes;
pub mod notification;
pub mod playbook;
pub mod poller;
pub mod snapshot;
pub mod state;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use config::{ModelRef, PilotConfig, ProjectPaths};
pub use dispatch::{
    CollectedResults, DispatchOptions, DispatchOrchestrator, DispatchPlan, GroupStore,
    ParallelGroup, ParallelTrack, Planner, TrackStatus, WorkerClient,
};
pub use error::{PilotError, Result, WorkerError};
pub use health::{AgentVariant, ModelHealthRegistry};
pub use notes::{JsonlNoteSink, MemoryNoteSink, Note, NoteSink};
pub use notification::{DispatchEvent, EventType, Notifier};
pub use playbook::{NextAction, PlaybookCache, PlaybookContext, PlaybookRegistry, decide_next_action};
pub use poller::{BackgroundPoller, LifecycleEvent, TickReport};
pub use snapshot::{DispatchSnapshot, SnapshotWriter};
pub use state::{SessionEvent, SessionState, SessionStateStore};
