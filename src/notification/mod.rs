//! Dispatch event notification.
//!
//! - `DispatchEvent`: group and track lifecycle events
//! - `Notifier`: event log and hook command delivery

mod events;
mod notifier;

pub use events::{DispatchEvent, EventType};
pub use notifier::Notifier;
