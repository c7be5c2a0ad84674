//! Configuration types and loading.
//!
//! - `PilotConfig`: top-level configuration with validation
//! - Section configs for dispatch, model health, failover, polling, playbooks,
//!   state persistence and notification
//! - `ModelRef`: `provider/model` parsing for per-provider capacity

mod model;
mod settings;

pub use model::{DEFAULT_MODEL, ModelRef, UNKNOWN_PROVIDER};
pub use settings::{
    DispatchConfig, FailoverConfig, HealthConfig, NotificationConfig, PilotConfig, PlanLimits,
    PlaybookConfig, PollerConfig, ProjectPaths, StateConfig, TrackLimit,
};
