#![allow(dead_code)]

pub mod mock_client;

use std::collections::HashMap;
use std::sync::Arc;

use probe_pilot::clock::{ManualClock, SharedClock};
use probe_pilot::config::PilotConfig;
use probe_pilot::dispatch::{DispatchOrchestrator, DispatchPlan, GroupStore, TrackRequest};
use probe_pilot::health::ModelHealthRegistry;
use probe_pilot::state::SessionStateStore;

use mock_client::MockWorkerClient;

pub struct Harness {
    pub client: Arc<MockWorkerClient>,
    pub clock: Arc<ManualClock>,
    pub states: Arc<SessionStateStore>,
    pub orchestrator: Arc<DispatchOrchestrator>,
}

/// Config with one single-model pool per worker kind, so each kind maps to
/// exactly one provider.
pub fn config(default_cap: usize, provider_caps: &[(&str, usize)]) -> PilotConfig {
    let mut config = PilotConfig::default();
    config.dispatch.default_cap = default_cap;
    config.dispatch.provider_caps = provider_caps
        .iter()
        .map(|(p, c)| (p.to_string(), *c))
        .collect();
    config.health.model_pools = HashMap::from([
        ("scanner".to_string(), vec!["openai/gpt-5".to_string()]),
        (
            "analyst".to_string(),
            vec!["anthropic/claude-sonnet-4-5".to_string()],
        ),
        (
            "verifier".to_string(),
            vec![
                "google/gemini-2.5-pro".to_string(),
                "openai/gpt-5".to_string(),
            ],
        ),
    ]);
    config
}

pub fn harness(config: &PilotConfig) -> Harness {
    let clock = ManualClock::starting_now();
    let shared: SharedClock = clock.clone();
    let states = Arc::new(SessionStateStore::in_memory(
        config.failover.consecutive_failure_threshold,
        shared,
    ));
    harness_with(config, clock, states)
}

/// Harness over an existing state store, e.g. one reopened from disk.
pub fn harness_with(
    config: &PilotConfig,
    clock: Arc<ManualClock>,
    states: Arc<SessionStateStore>,
) -> Harness {
    let client = MockWorkerClient::new();
    let shared: SharedClock = clock.clone();
    let health = Arc::new(ModelHealthRegistry::new(&config.health, shared.clone()));
    let orchestrator = Arc::new(
        DispatchOrchestrator::new(
            client.clone(),
            Arc::new(GroupStore::new()),
            health,
            config,
            shared,
        )
        .with_state_store(states.clone()),
    );
    Harness {
        client,
        clock,
        states,
        orchestrator,
    }
}

pub fn plan(label: &str, agent: &str, n: usize) -> DispatchPlan {
    (1..=n).fold(DispatchPlan::new(label), |plan, i| {
        plan.with_track(TrackRequest::new(
            format!("{}-{}", agent, i),
            agent,
            format!("task {}", i),
        ))
    })
}
