use probe_pilot::config::{PilotConfig, ProjectPaths};

#[test]
fn test_default_config() {
    let config = PilotConfig::default();

    assert_eq!(config.dispatch.default_cap, 3);
    assert!(config.dispatch.queue_enabled);
    assert_eq!(config.dispatch.provider_cap("openai"), Some(2));
    assert_eq!(config.dispatch.plan_limits.scan.max_tracks, 5);

    assert_eq!(config.health.cooldown_ms, 300_000);
    assert_eq!(config.health.default_pool.len(), 3);
    assert_eq!(config.failover.consecutive_failure_threshold, 3);

    assert_eq!(config.poller.interval_ms, 2000);
    assert_eq!(config.poller.stale_track_ttl_secs, 900);

    assert!(config.playbook.sources.is_empty());
    assert!(config.state.state_dir.is_none());
    assert!(config.validate().is_ok());
}

#[tokio::test]
async fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = PilotConfig::load(dir.path()).await.unwrap();
    assert_eq!(config.dispatch.default_cap, 3);
}

#[tokio::test]
async fn test_load_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        r#"
[dispatch]
default_cap = 4

[dispatch.agent_models]
scanner = "openai/gpt-5"

[health.model_pools]
scanner = ["openai/gpt-5", "google/gemini-2.5-pro"]

[poller]
interval_ms = 500
"#,
    )
    .unwrap();

    let config = PilotConfig::load(dir.path()).await.unwrap();
    assert_eq!(config.dispatch.default_cap, 4);
    assert_eq!(config.dispatch.model_for("scanner"), "openai/gpt-5");
    assert_eq!(config.health.pool_for("scanner").len(), 2);
    assert_eq!(config.poller.interval_ms, 500);
    // Untouched sections keep their defaults.
    assert_eq!(config.poller.stale_track_ttl_secs, 900);
    assert_eq!(config.failover.consecutive_failure_threshold, 3);
}

#[tokio::test]
async fn test_load_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        "[dispatch]\ndefault_cap = 0\n\n[dispatch.provider_caps]\nopenai = 0\n",
    )
    .unwrap();

    let err = PilotConfig::load(dir.path()).await.unwrap_err().to_string();
    assert!(err.contains("default_cap"));
    assert!(err.contains("provider_caps.openai"));
}

#[tokio::test]
async fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PilotConfig::default();
    config.dispatch.queue_enabled = false;
    config.health.cooldown_ms = 60_000;
    config.save(dir.path()).await.unwrap();

    let loaded = PilotConfig::load(dir.path()).await.unwrap();
    assert!(!loaded.dispatch.queue_enabled);
    assert_eq!(loaded.health.cooldown_ms, 60_000);
}

#[tokio::test]
async fn test_project_paths() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ProjectPaths::new(dir.path().to_path_buf(), &PilotConfig::default().state);
    assert!(paths.state_dir.starts_with(&paths.pilot_dir));
    paths.ensure_dirs().await.unwrap();
    assert!(paths.snapshot_dir.is_dir());
    assert!(paths.logs_dir.is_dir());
}
