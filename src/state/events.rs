use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{FailureReason, Phase, SessionState};

/// Closed set of discrete signals that adjust session counters and flags.
///
/// | event | effect |
/// |---|---|
/// | `scan_completed` | `scan_complete`; phase scan → plan |
/// | `plan_completed` | `plan_ready`; phase → execute |
/// | `candidate_found` | `candidate_pending_verification` |
/// | `verify_success` | `verified`; failure counters reset; failover cleared |
/// | `verify_fail` | `verify_fail_count` +1; failure `verification_mismatch` |
/// | `new_evidence` | loop counters reset |
/// | `no_new_evidence` | `no_new_evidence_loops` +1 |
/// | `same_payload_repeat` | `stale_pattern_loops` +1 |
/// | `context_length_exceeded` | `context_overflow_count` +1; failure `context_overflow` |
/// | `tool_timeout` | `timeout_count` +1; failure `tooling_timeout` |
/// | `static_dynamic_contradiction` | `contradiction_debt` +1; failure recorded |
/// | `contradiction_resolved` | `contradiction_debt` -1 (saturating) |
/// | `unsat_claim`, `exploit_chain_broken`, `environment_mismatch`, `hypothesis_stall` | failure recorded |
/// | `failover_completed` | failover cleared |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    ScanCompleted,
    PlanCompleted,
    CandidateFound,
    VerifySuccess,
    VerifyFail,
    NewEvidence,
    NoNewEvidence,
    SamePayloadRepeat,
    ContextLengthExceeded,
    ToolTimeout,
    StaticDynamicContradiction,
    ContradictionResolved,
    UnsatClaim,
    ExploitChainBroken,
    EnvironmentMismatch,
    HypothesisStall,
    FailoverCompleted,
}

impl SessionEvent {
    pub const ALL: [SessionEvent; 17] = [
        Self::ScanCompleted,
        Self::PlanCompleted,
        Self::CandidateFound,
        Self::VerifySuccess,
        Self::VerifyFail,
        Self::NewEvidence,
        Self::NoNewEvidence,
        Self::SamePayloadRepeat,
        Self::ContextLengthExceeded,
        Self::ToolTimeout,
        Self::StaticDynamicContradiction,
        Self::ContradictionResolved,
        Self::UnsatClaim,
        Self::ExploitChainBroken,
        Self::EnvironmentMismatch,
        Self::HypothesisStall,
        Self::FailoverCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScanCompleted => "scan_completed",
            Self::PlanCompleted => "plan_completed",
            Self::CandidateFound => "candidate_found",
            Self::VerifySuccess => "verify_success",
            Self::VerifyFail => "verify_fail",
            Self::NewEvidence => "new_evidence",
            Self::NoNewEvidence => "no_new_evidence",
            Self::SamePayloadRepeat => "same_payload_repeat",
            Self::ContextLengthExceeded => "context_length_exceeded",
            Self::ToolTimeout => "tool_timeout",
            Self::StaticDynamicContradiction => "static_dynamic_contradiction",
            Self::ContradictionResolved => "contradiction_resolved",
            Self::UnsatClaim => "unsat_claim",
            Self::ExploitChainBroken => "exploit_chain_broken",
            Self::EnvironmentMismatch => "environment_mismatch",
            Self::HypothesisStall => "hypothesis_stall",
            Self::FailoverCompleted => "failover_completed",
        }
    }

    /// Failure reason this event records, if any.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::VerifyFail => Some(FailureReason::VerificationMismatch),
            Self::ContextLengthExceeded => Some(FailureReason::ContextOverflow),
            Self::ToolTimeout => Some(FailureReason::ToolingTimeout),
            Self::StaticDynamicContradiction => Some(FailureReason::StaticDynamicContradiction),
            Self::UnsatClaim => Some(FailureReason::UnsatClaim),
            Self::ExploitChainBroken => Some(FailureReason::ExploitChainBroken),
            Self::EnvironmentMismatch => Some(FailureReason::EnvironmentMismatch),
            Self::HypothesisStall => Some(FailureReason::HypothesisStall),
            _ => None,
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| format!("unknown session event '{}'", s))
    }
}

impl SessionState {
    pub(crate) fn apply_event(&mut self, event: SessionEvent, now: DateTime<Utc>) {
        match event {
            SessionEvent::ScanCompleted => {
                self.scan_complete = true;
                if self.phase == Phase::Scan {
                    self.phase = Phase::Plan;
                }
            }
            SessionEvent::PlanCompleted => {
                self.plan_ready = true;
                self.phase = Phase::Execute;
            }
            SessionEvent::CandidateFound => {
                self.candidate_pending_verification = true;
            }
            SessionEvent::VerifySuccess => {
                self.verified = true;
                self.candidate_pending_verification = false;
                if self.latest_candidate.is_some() {
                    self.latest_verified = self.latest_candidate.clone();
                }
                self.reset_failure_counters();
            }
            SessionEvent::VerifyFail => {
                self.verified = false;
                self.candidate_pending_verification = false;
                self.verify_fail_count += 1;
            }
            SessionEvent::NewEvidence => self.reset_loop_counters(),
            SessionEvent::NoNewEvidence => self.no_new_evidence_loops += 1,
            SessionEvent::SamePayloadRepeat => self.stale_pattern_loops += 1,
            SessionEvent::ContextLengthExceeded => self.context_overflow_count += 1,
            SessionEvent::ToolTimeout => self.timeout_count += 1,
            SessionEvent::StaticDynamicContradiction => self.contradiction_debt += 1,
            SessionEvent::ContradictionResolved => {
                self.contradiction_debt = self.contradiction_debt.saturating_sub(1);
            }
            SessionEvent::FailoverCompleted => self.clear_failover(),
            SessionEvent::UnsatClaim
            | SessionEvent::ExploitChainBroken
            | SessionEvent::EnvironmentMismatch
            | SessionEvent::HypothesisStall => {}
        }

        if let Some(reason) = event.failure_reason() {
            self.record_failure(reason, &format!("event: {}", event), now);
        }
    }
}
