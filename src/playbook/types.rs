//! Playbook rule types.
//!
//! `Raw*` structs mirror the on-disk document shape and are only used while
//! loading; the registry validates them into [`PlaybookRule`] with
//! tagged trigger clauses.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::state::{Mode, TargetCategory};

/// Document versions this crate can load.
pub const SUPPORTED_VERSION: u32 = 1;

/// Typed value of a context field or an equality clause operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl ContextValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    pub fn holds(&self, actual: i64, bound: i64) -> bool {
        match self {
            Self::Gt => actual > bound,
            Self::Gte => actual >= bound,
            Self::Lt => actual < bound,
            Self::Lte => actual <= bound,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerClause {
    /// Empty lists accept any mode/target.
    Pattern {
        modes: Vec<Mode>,
        targets: Vec<TargetCategory>,
    },
    Equals {
        field: String,
        value: ContextValue,
    },
    /// Every comparator must hold.
    Threshold {
        field: String,
        bounds: Vec<(Comparator, i64)>,
    },
}

/// Flags and events a rule says it addresses. Advisory only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateHint {
    pub flags: Vec<String>,
    pub events: Vec<String>,
}

impl StateHint {
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.events.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MandatoryAction {
    pub tool: Option<String>,
    pub route: Option<String>,
}

impl MandatoryAction {
    pub fn is_empty(&self) -> bool {
        self.tool.as_deref().is_none_or(str::is_empty)
            && self.route.as_deref().is_none_or(str::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybookRule {
    pub id: String,
    pub order: i64,
    pub description: Vec<String>,
    pub trigger: Vec<TriggerClause>,
    pub state_hint: StateHint,
    pub action: MandatoryAction,
    pub source: PathBuf,
}

// On-disk shape.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawDocument {
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<RawRule>,
    #[serde(default)]
    pub conditional_rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub description: Lines,
    #[serde(default)]
    pub trigger: RawTrigger,
    #[serde(default)]
    pub state_hint: StateHint,
    #[serde(default)]
    pub mandatory_next_action: MandatoryAction,
}

/// A single line or a list of lines.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Lines {
    One(String),
    Many(Vec<String>),
}

impl Default for Lines {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl Lines {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(line) => vec![line],
            Self::Many(lines) => lines,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RawTrigger {
    pub pattern: Option<RawPattern>,
    pub equals: Vec<RawEquals>,
    pub counters: Vec<RawThreshold>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RawPattern {
    pub modes: Vec<Mode>,
    pub targets: Vec<TargetCategory>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawEquals {
    pub field: String,
    pub value: ContextValue,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawThreshold {
    pub field: String,
    pub gt: Option<i64>,
    pub gte: Option<i64>,
    pub lt: Option<i64>,
    pub lte: Option<i64>,
}

impl RawThreshold {
    pub fn bounds(&self) -> Vec<(Comparator, i64)> {
        [
            (Comparator::Gt, self.gt),
            (Comparator::Gte, self.gte),
            (Comparator::Lt, self.lt),
            (Comparator::Lte, self.lte),
        ]
        .into_iter()
        .filter_map(|(cmp, bound)| bound.map(|b| (cmp, b)))
        .collect()
    }
}
