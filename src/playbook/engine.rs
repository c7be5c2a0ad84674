use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::context::PlaybookContext;
use super::registry::PlaybookRegistry;
use super::types::{PlaybookRule, TriggerClause};
use crate::state::{DecisionRecord, SessionStateStore};

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder_pattern() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{([A-Za-z][A-Za-z0-9_]*)\}").unwrap())
}

/// The single action the parent must take next. The engine decides; the
/// caller invokes the tool or follows the route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextAction {
    pub rule_id: String,
    pub tool: Option<String>,
    pub route: Option<String>,
    pub rationale: Vec<String>,
}

impl NextAction {
    pub fn to_decision(&self, decided_at: DateTime<Utc>) -> DecisionRecord {
        DecisionRecord {
            rule_id: self.rule_id.clone(),
            tool: self.tool.clone(),
            route: self.route.clone(),
            rationale: self.rationale.clone(),
            decided_at,
        }
    }
}

pub fn rule_matches(rule: &PlaybookRule, ctx: &PlaybookContext) -> bool {
    rule.trigger.iter().all(|clause| clause_holds(clause, ctx))
}

fn clause_holds(clause: &TriggerClause, ctx: &PlaybookContext) -> bool {
    match clause {
        TriggerClause::Pattern { modes, targets } => {
            let mode_ok = modes.is_empty() || modes.iter().any(|m| m.as_str() == ctx.mode);
            let target_ok =
                targets.is_empty() || targets.iter().any(|t| t.as_str() == ctx.target);
            mode_ok && target_ok
        }
        TriggerClause::Equals { field, value } => ctx.get(field).as_ref() == Some(value),
        TriggerClause::Threshold { field, bounds } => {
            match ctx.get(field).and_then(|v| v.as_int()) {
                Some(actual) => bounds.iter().all(|(cmp, bound)| cmp.holds(actual, *bound)),
                None => false,
            }
        }
    }
}

/// First matching rule: conditional rules before base rules, each list in
/// `(order, id)` order.
pub fn select_rule<'a>(
    registry: &'a PlaybookRegistry,
    ctx: &PlaybookContext,
) -> Option<&'a PlaybookRule> {
    registry.rules_in_precedence().find(|rule| rule_matches(rule, ctx))
}

pub fn resolve_next_action(
    registry: &PlaybookRegistry,
    ctx: &PlaybookContext,
) -> Option<NextAction> {
    let rule = select_rule(registry, ctx)?;
    debug!(rule_id = %rule.id, "Playbook rule matched");
    Some(NextAction {
        rule_id: rule.id.clone(),
        tool: rule.action.tool.clone(),
        route: rule.action.route.clone(),
        rationale: rule
            .description
            .iter()
            .map(|line| render(line, ctx))
            .collect(),
    })
}

/// Substitute `{field}` placeholders. Unknown fields stay as written.
pub fn render(template: &str, ctx: &PlaybookContext) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &Captures| match ctx.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Resolve the next action for a session and record it as the session's
/// last decision.
pub fn decide_next_action(
    store: &SessionStateStore,
    registry: &PlaybookRegistry,
    session_id: &str,
    parallel_enabled: bool,
    now: DateTime<Utc>,
) -> Option<NextAction> {
    let state = store.get(session_id);
    let ctx = PlaybookContext::from_state(&state).with_parallel_enabled(parallel_enabled);
    let action = resolve_next_action(registry, &ctx)?;
    store.set_last_decision(session_id, action.to_decision(now));
    Some(action)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::state::{Mode, SessionEvent, SessionState, TargetCategory};

    const RULES: &str = r#"
version: 1
rules:
  - id: base-scan
    order: 10
    description:
      - "Phase {phase}: scan the {target} target."
    trigger:
      equals:
        - field: scanComplete
          value: false
    mandatory_next_action: { tool: run_scan }
  - id: base-plan
    order: 20
    description: "Build a plan ({unknownThing})."
    mandatory_next_action: { route: planner }
conditional_rules:
  - id: stuck
    order: 5
    description: "No new evidence for {noNewEvidenceLoops} loops."
    trigger:
      counters:
        - field: noNewEvidenceLoops
          gte: 3
    mandatory_next_action: { route: pivot }
  - id: bounty-web
    order: 1
    description: "Bounty web target."
    trigger:
      pattern:
        modes: [bounty]
        targets: [web_api]
    mandatory_next_action: { tool: scope_check }
"#;

    fn registry() -> PlaybookRegistry {
        PlaybookRegistry::from_documents(&[(PathBuf::from("test.yaml"), RULES.to_string())])
            .unwrap()
    }

    #[test]
    fn test_base_rule_when_no_conditional_matches() {
        let ctx = PlaybookContext::from_state(&SessionState::default());
        let action = resolve_next_action(&registry(), &ctx).unwrap();
        assert_eq!(action.rule_id, "base-scan");
        assert_eq!(action.tool.as_deref(), Some("run_scan"));
        assert_eq!(action.rationale, vec!["Phase scan: scan the unknown target."]);
    }

    #[test]
    fn test_conditional_rules_take_precedence() {
        let state = SessionState {
            no_new_evidence_loops: 4,
            ..SessionState::default()
        };
        let ctx = PlaybookContext::from_state(&state);
        let action = resolve_next_action(&registry(), &ctx).unwrap();
        assert_eq!(action.rule_id, "stuck");
        assert_eq!(action.route.as_deref(), Some("pivot"));
        assert_eq!(action.rationale, vec!["No new evidence for 4 loops."]);
    }

    #[test]
    fn test_pattern_requires_mode_and_target() {
        let registry = registry();
        let mut state = SessionState {
            mode: Mode::Bounty,
            ..SessionState::default()
        };
        let ctx = PlaybookContext::from_state(&state);
        assert_eq!(select_rule(&registry, &ctx).unwrap().id, "base-scan");

        state.target = TargetCategory::WebApi;
        let ctx = PlaybookContext::from_state(&state);
        assert_eq!(select_rule(&registry, &ctx).unwrap().id, "bounty-web");
    }

    #[test]
    fn test_unknown_placeholder_left_literal() {
        let state = SessionState {
            scan_complete: true,
            ..SessionState::default()
        };
        let ctx = PlaybookContext::from_state(&state);
        let action = resolve_next_action(&registry(), &ctx).unwrap();
        assert_eq!(action.rule_id, "base-plan");
        assert_eq!(action.rationale, vec!["Build a plan ({unknownThing})."]);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let registry = registry();
        let ctx = PlaybookContext::from_state(&SessionState::default());
        let first = resolve_next_action(&registry, &ctx);
        for _ in 0..10 {
            assert_eq!(resolve_next_action(&registry, &ctx), first);
        }
    }

    #[test]
    fn test_decision_recorded_on_state() {
        let clock = ManualClock::starting_now();
        let store = SessionStateStore::in_memory(3, clock.clone());
        let registry = registry();

        for _ in 0..3 {
            store.apply_event("ses_1", SessionEvent::NoNewEvidence);
        }
        let action = decide_next_action(&store, &registry, "ses_1", true, clock.now()).unwrap();
        assert_eq!(action.rule_id, "stuck");

        let decision = store.get("ses_1").last_decision.unwrap();
        assert_eq!(decision.rule_id, "stuck");
        assert_eq!(decision.route.as_deref(), Some("pivot"));
    }
}
