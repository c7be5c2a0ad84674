//! Side-effect-free dispatch plan builders.

use serde::{Deserialize, Serialize};

use crate::config::{PlanLimits, TrackLimit};

/// Output contract appended to every generated prompt; `merge` reads it back.
pub const RESULT_FORMAT: &str = "End your reply with one JSON object: \
{\"findings\": [...], \"evidence\": [...], \"next_steps\": [...]}";

const SCAN_ANGLES: &[&str] = &[
    "attack surface and entry points",
    "input handling and parsing",
    "authentication, sessions and access control",
    "versions, dependencies and known weaknesses",
    "configuration, secrets and debug artifacts",
];

const DEEP_WORK_ANGLES: &[&str] = &[
    "reproduce the strongest lead end to end",
    "challenge the current assumptions",
    "search for an alternative path to the goal",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Scan,
    Hypothesis,
    DeepWork,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRequest {
    pub purpose: String,
    /// Worker kind.
    pub agent: String,
    pub prompt: String,
}

impl TrackRequest {
    pub fn new(
        purpose: impl Into<String>,
        agent: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            purpose: purpose.into(),
            agent: agent.into(),
            prompt: prompt.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPlan {
    pub label: String,
    pub kind: PlanKind,
    pub tracks: Vec<TrackRequest>,
}

impl DispatchPlan {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: PlanKind::Custom,
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: TrackRequest) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }
}

/// Builds plans within the configured per-kind track limits.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    limits: PlanLimits,
}

impl Planner {
    pub fn new(limits: PlanLimits) -> Self {
        Self { limits }
    }

    /// `n` scan tracks spread round-robin over `agents`, each on its own angle.
    pub fn plan_scan(&self, goal: &str, agents: &[String], n: Option<usize>) -> DispatchPlan {
        let mut plan = DispatchPlan {
            label: format!("scan: {}", goal),
            kind: PlanKind::Scan,
            tracks: Vec::new(),
        };
        if agents.is_empty() {
            return plan;
        }

        let count = self.limits.scan.clamp(n);
        for i in 0..count {
            let agent = &agents[i % agents.len()];
            let angle = SCAN_ANGLES[i % SCAN_ANGLES.len()];
            plan.tracks.push(TrackRequest::new(
                format!("scan-{}: {}", i + 1, angle),
                agent.clone(),
                prompt(goal, &format!("Scan focus: {}.", angle)),
            ));
        }
        plan
    }

    /// One track per hypothesis, in the given (ranked) order.
    pub fn plan_hypotheses(&self, goal: &str, hypotheses: &[String], agent: &str) -> DispatchPlan {
        let count = clamp_to_items(&self.limits.hypothesis, hypotheses.len());
        DispatchPlan {
            label: format!("hypotheses: {}", goal),
            kind: PlanKind::Hypothesis,
            tracks: hypotheses
                .iter()
                .take(count)
                .enumerate()
                .map(|(i, hypothesis)| {
                    TrackRequest::new(
                        format!("hypothesis-{}: {}", i + 1, hypothesis),
                        agent,
                        prompt(
                            goal,
                            &format!(
                                "Test this hypothesis and report whether it holds: {}",
                                hypothesis
                            ),
                        ),
                    )
                })
                .collect(),
        }
    }

    /// Parallel deep-work tracks on one agent. Empty `angles` uses the
    /// built-in angles.
    pub fn plan_deep_work(&self, goal: &str, agent: &str, angles: &[String]) -> DispatchPlan {
        let angles: Vec<String> = if angles.is_empty() {
            DEEP_WORK_ANGLES.iter().map(|a| a.to_string()).collect()
        } else {
            angles.to_vec()
        };
        let count = clamp_to_items(&self.limits.deep_work, angles.len());

        DispatchPlan {
            label: format!("deep work: {}", goal),
            kind: PlanKind::DeepWork,
            tracks: angles
                .iter()
                .take(count)
                .enumerate()
                .map(|(i, angle)| {
                    TrackRequest::new(
                        format!("deep-{}: {}", i + 1, angle),
                        agent,
                        prompt(goal, &format!("Work angle: {}.", angle)),
                    )
                })
                .collect(),
        }
    }
}

fn clamp_to_items(limit: &TrackLimit, items: usize) -> usize {
    if items == 0 {
        return 0;
    }
    limit.clamp(Some(items))
}

fn prompt(goal: &str, focus: &str) -> String {
    format!("Goal: {}\n{}\n\n{}", goal, focus, RESULT_FORMAT)
}
