//! Declarative next-action rules.
//!
//! A registry holds base rules (default flow) and conditional rules (urgent
//! overrides). Selection is a pure function of registry and context.

mod context;
mod engine;
mod registry;
mod types;

pub use context::{CONTEXT_FIELDS, NUMERIC_FIELDS, PlaybookContext};
pub use engine::{
    NextAction, decide_next_action, render, resolve_next_action, rule_matches, select_rule,
};
pub use registry::{PlaybookCache, PlaybookRegistry};
pub use types::{
    Comparator, ContextValue, MandatoryAction, PlaybookRule, SUPPORTED_VERSION, StateHint,
    TriggerClause,
};
