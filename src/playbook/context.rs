use crate::state::SessionState;

use super::types::ContextValue;

/// Read-only view of a session that rules match against.
///
/// Fields are addressed by their camelCase names in rule documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybookContext {
    pub mode: String,
    pub phase: String,
    pub target: String,
    pub scan_complete: bool,
    pub plan_ready: bool,
    pub candidate_pending_verification: bool,
    pub verified: bool,
    pub pending_failover: bool,
    pub has_candidate: bool,
    pub failover_worker_kind: String,
    pub no_new_evidence_loops: i64,
    pub stale_pattern_loops: i64,
    pub contradiction_debt: i64,
    pub verify_fail_count: i64,
    pub context_overflow_count: i64,
    pub timeout_count: i64,
    pub consecutive_failures: i64,
    pub last_failure_reason: String,
    pub oracle_passed: i64,
    pub oracle_failed: i64,
    pub oracle_total: i64,
    pub parallel_enabled: bool,
}

/// Field names accepted by `equals` and `counters` clauses.
pub const CONTEXT_FIELDS: &[&str] = &[
    "mode",
    "phase",
    "target",
    "scanComplete",
    "planReady",
    "candidatePendingVerification",
    "verified",
    "pendingFailover",
    "hasCandidate",
    "failoverWorkerKind",
    "noNewEvidenceLoops",
    "stalePatternLoops",
    "contradictionDebt",
    "verifyFailCount",
    "contextOverflowCount",
    "timeoutCount",
    "consecutiveFailures",
    "lastFailureReason",
    "oraclePassed",
    "oracleFailed",
    "oracleTotal",
    "parallelEnabled",
];

/// Fields usable in threshold clauses.
pub const NUMERIC_FIELDS: &[&str] = &[
    "noNewEvidenceLoops",
    "stalePatternLoops",
    "contradictionDebt",
    "verifyFailCount",
    "contextOverflowCount",
    "timeoutCount",
    "consecutiveFailures",
    "oraclePassed",
    "oracleFailed",
    "oracleTotal",
];

impl PlaybookContext {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            mode: state.mode.as_str().to_string(),
            phase: state.phase.as_str().to_string(),
            target: state.target.as_str().to_string(),
            scan_complete: state.scan_complete,
            plan_ready: state.plan_ready,
            candidate_pending_verification: state.candidate_pending_verification,
            verified: state.verified,
            pending_failover: state.pending_failover,
            has_candidate: state.latest_candidate.is_some(),
            failover_worker_kind: state.failover_worker_kind.clone().unwrap_or_default(),
            no_new_evidence_loops: state.no_new_evidence_loops.into(),
            stale_pattern_loops: state.stale_pattern_loops.into(),
            contradiction_debt: state.contradiction_debt.into(),
            verify_fail_count: state.verify_fail_count.into(),
            context_overflow_count: state.context_overflow_count.into(),
            timeout_count: state.timeout_count.into(),
            consecutive_failures: state.max_consecutive_failures().into(),
            last_failure_reason: state
                .last_failure_reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_else(|| "none".to_string()),
            oracle_passed: state.oracle_progress.passed.into(),
            oracle_failed: state.oracle_progress.failed.into(),
            oracle_total: state.oracle_progress.total.into(),
            parallel_enabled: true,
        }
    }

    pub fn with_parallel_enabled(mut self, enabled: bool) -> Self {
        self.parallel_enabled = enabled;
        self
    }

    pub fn get(&self, field: &str) -> Option<ContextValue> {
        let text = |s: &String| Some(ContextValue::Text(s.clone()));
        let flag = |b: bool| Some(ContextValue::Bool(b));
        let int = |n: i64| Some(ContextValue::Int(n));

        match field {
            "mode" => text(&self.mode),
            "phase" => text(&self.phase),
            "target" => text(&self.target),
            "scanComplete" => flag(self.scan_complete),
            "planReady" => flag(self.plan_ready),
            "candidatePendingVerification" => flag(self.candidate_pending_verification),
            "verified" => flag(self.verified),
            "pendingFailover" => flag(self.pending_failover),
            "hasCandidate" => flag(self.has_candidate),
            "failoverWorkerKind" => text(&self.failover_worker_kind),
            "noNewEvidenceLoops" => int(self.no_new_evidence_loops),
            "stalePatternLoops" => int(self.stale_pattern_loops),
            "contradictionDebt" => int(self.contradiction_debt),
            "verifyFailCount" => int(self.verify_fail_count),
            "contextOverflowCount" => int(self.context_overflow_count),
            "timeoutCount" => int(self.timeout_count),
            "consecutiveFailures" => int(self.consecutive_failures),
            "lastFailureReason" => text(&self.last_failure_reason),
            "oraclePassed" => int(self.oracle_passed),
            "oracleFailed" => int(self.oracle_failed),
            "oracleTotal" => int(self.oracle_total),
            "parallelEnabled" => flag(self.parallel_enabled),
            _ => None,
        }
    }
}
