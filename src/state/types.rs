use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::ModelHealthRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Ctf,
    Bounty,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ctf => "ctf",
            Self::Bounty => "bounty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Scan,
    Plan,
    Execute,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Plan => "plan",
            Self::Execute => "execute",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetCategory {
    WebApi,
    Web3,
    Pwn,
    Rev,
    Crypto,
    Forensics,
    Misc,
    #[default]
    Unknown,
}

impl TargetCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebApi => "web_api",
            Self::Web3 => "web3",
            Self::Pwn => "pwn",
            Self::Rev => "rev",
            Self::Crypto => "crypto",
            Self::Forensics => "forensics",
            Self::Misc => "misc",
            Self::Unknown => "unknown",
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(Mode, Phase, TargetCategory, FailureReason, DispatchOutcome);

/// Why the last attempt failed; drives downstream rule matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    VerificationMismatch,
    ToolingTimeout,
    ContextOverflow,
    HypothesisStall,
    UnsatClaim,
    StaticDynamicContradiction,
    ExploitChainBroken,
    EnvironmentMismatch,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerificationMismatch => "verification_mismatch",
            Self::ToolingTimeout => "tooling_timeout",
            Self::ContextOverflow => "context_overflow",
            Self::HypothesisStall => "hypothesis_stall",
            Self::UnsatClaim => "unsat_claim",
            Self::StaticDynamicContradiction => "static_dynamic_contradiction",
            Self::ExploitChainBroken => "exploit_chain_broken",
            Self::EnvironmentMismatch => "environment_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success,
    RetryableFailure,
    HardFailure,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::HardFailure => "hard_failure",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// Dispatch results rolled up per worker kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub success_count: u32,
    pub retryable_failure_count: u32,
    pub hard_failure_count: u32,
    pub consecutive_failures: u32,
    pub last_outcome: Option<DispatchOutcome>,
    pub last_outcome_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileOverride {
    pub model: String,
    pub variant: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleProgress {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
}

/// Last next-action decision, kept for the UI snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub rule_id: String,
    pub tool: Option<String>,
    pub route: Option<String>,
    pub rationale: Vec<String>,
    pub decided_at: DateTime<Utc>,
}

/// Accumulated state of one parent session.
///
/// Instances handed out by the store are snapshots; the store applies every
/// change through its named operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub mode: Mode,
    pub phase: Phase,
    pub target: TargetCategory,

    pub scan_complete: bool,
    pub plan_ready: bool,
    pub candidate_pending_verification: bool,
    pub verified: bool,
    pub pending_failover: bool,
    pub failover_worker_kind: Option<String>,

    pub latest_candidate: Option<String>,
    pub latest_verified: Option<String>,

    pub no_new_evidence_loops: u32,
    pub stale_pattern_loops: u32,
    pub contradiction_debt: u32,
    pub verify_fail_count: u32,
    pub context_overflow_count: u32,
    pub timeout_count: u32,

    pub last_failure_reason: Option<FailureReason>,
    pub last_failure_summary: Option<String>,
    pub failure_reason_counts: BTreeMap<FailureReason, u32>,
    pub last_failure_at: Option<DateTime<Utc>>,

    pub dispatch_health: BTreeMap<String, WorkerHealth>,
    pub model_health: BTreeMap<String, ModelHealthRecord>,
    pub profile_overrides: BTreeMap<String, ProfileOverride>,
    pub oracle_progress: OracleProgress,
    pub last_decision: Option<DecisionRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Highest consecutive failure count across worker kinds.
    pub fn max_consecutive_failures(&self) -> u32 {
        self.dispatch_health
            .values()
            .map(|h| h.consecutive_failures)
            .max()
            .unwrap_or(0)
    }

    pub fn failure_count(&self, reason: FailureReason) -> u32 {
        self.failure_reason_counts.get(&reason).copied().unwrap_or(0)
    }

    pub(crate) fn record_failure(
        &mut self,
        reason: FailureReason,
        summary: &str,
        now: DateTime<Utc>,
    ) {
        self.last_failure_reason = Some(reason);
        self.last_failure_summary = Some(summary.to_string());
        self.last_failure_at = Some(now);
        *self.failure_reason_counts.entry(reason).or_insert(0) += 1;
    }

    pub(crate) fn reset_loop_counters(&mut self) {
        self.no_new_evidence_loops = 0;
        self.stale_pattern_loops = 0;
    }

    pub(crate) fn reset_failure_counters(&mut self) {
        self.reset_loop_counters();
        self.verify_fail_count = 0;
        self.context_overflow_count = 0;
        self.timeout_count = 0;
        self.failure_reason_counts.clear();
        self.clear_failover();
    }

    pub(crate) fn clear_failover(&mut self) {
        if let Some(kind) = self.failover_worker_kind.take()
            && let Some(health) = self.dispatch_health.get_mut(&kind)
        {
            health.consecutive_failures = 0;
        }
        self.pending_failover = false;
    }

    /// Roll an outcome into the worker kind's counters. Returns true when this
    /// outcome pushed the kind over the failover threshold.
    pub(crate) fn record_dispatch_outcome(
        &mut self,
        worker_kind: &str,
        outcome: DispatchOutcome,
        failover_threshold: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let health = self
            .dispatch_health
            .entry(worker_kind.to_string())
            .or_default();
        match outcome {
            DispatchOutcome::Success => {
                health.success_count += 1;
                health.consecutive_failures = 0;
            }
            DispatchOutcome::RetryableFailure => {
                health.retryable_failure_count += 1;
                health.consecutive_failures += 1;
            }
            DispatchOutcome::HardFailure => {
                health.hard_failure_count += 1;
                health.consecutive_failures += 1;
            }
        }
        health.last_outcome = Some(outcome);
        health.last_outcome_at = Some(now);

        let over_threshold = health.consecutive_failures >= failover_threshold;
        if over_threshold && !self.pending_failover {
            self.pending_failover = true;
            self.failover_worker_kind = Some(worker_kind.to_string());
            return true;
        }
        false
    }
}
