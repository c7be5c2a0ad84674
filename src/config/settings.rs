use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{PilotError, Result};

use super::model::{DEFAULT_MODEL, default_model_pool};

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub failover: FailoverConfig,
    pub poller: PollerConfig,
    pub playbook: PlaybookConfig,
    pub state: StateConfig,
    pub notification: NotificationConfig,
}

impl PilotConfig {
    pub async fn load(pilot_dir: &Path) -> Result<Self> {
        let config_path = pilot_dir.join(CONFIG_FILE);
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, pilot_dir: &Path) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(pilot_dir).await?;
        let content =
            toml::to_string_pretty(self).map_err(|e| PilotError::Config(e.to_string()))?;
        fs::write(pilot_dir.join(CONFIG_FILE), content).await?;
        Ok(())
    }

    /// Validate configuration values, reporting every violation at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.dispatch.default_cap == 0 {
            errors.push("dispatch.default_cap must be greater than 0".into());
        }
        for (provider, cap) in &self.dispatch.provider_caps {
            if *cap == 0 {
                errors.push(format!(
                    "dispatch.provider_caps.{} must be greater than 0",
                    provider
                ));
            }
        }
        for (kind, limit) in [
            ("scan", &self.dispatch.plan_limits.scan),
            ("hypothesis", &self.dispatch.plan_limits.hypothesis),
            ("deep_work", &self.dispatch.plan_limits.deep_work),
        ] {
            if limit.default_tracks == 0 {
                errors.push(format!(
                    "dispatch.plan_limits.{}.default_tracks must be greater than 0",
                    kind
                ));
            }
            if limit.default_tracks > limit.max_tracks {
                errors.push(format!(
                    "dispatch.plan_limits.{}.default_tracks must be <= max_tracks",
                    kind
                ));
            }
        }

        for (kind, pool) in &self.health.model_pools {
            if pool.is_empty() {
                errors.push(format!("health.model_pools.{} must not be empty", kind));
            }
        }

        if self.failover.consecutive_failure_threshold == 0 {
            errors.push("failover.consecutive_failure_threshold must be greater than 0".into());
        }

        if self.poller.interval_ms == 0 {
            errors.push("poller.interval_ms must be greater than 0".into());
        }
        if self.poller.stale_track_ttl_secs == 0 {
            errors.push("poller.stale_track_ttl_secs must be greater than 0".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PilotError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum concurrently running tracks in one group.
    pub default_cap: usize,
    /// Maximum running tracks per provider across every group.
    pub provider_caps: HashMap<String, usize>,
    /// Queue tracks beyond capacity instead of dropping them.
    pub queue_enabled: bool,
    pub plan_limits: PlanLimits,
    /// Primary model per worker kind, as `provider/model`.
    pub agent_models: HashMap<String, String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let mut provider_caps = HashMap::new();
        provider_caps.insert("anthropic".to_string(), 3);
        provider_caps.insert("openai".to_string(), 2);
        provider_caps.insert("google".to_string(), 2);

        Self {
            default_cap: 3,
            provider_caps,
            queue_enabled: true,
            plan_limits: PlanLimits::default(),
            agent_models: HashMap::new(),
        }
    }
}

impl DispatchConfig {
    pub fn provider_cap(&self, provider: &str) -> Option<usize> {
        self.provider_caps.get(provider).copied()
    }

    pub fn model_for(&self, worker_kind: &str) -> &str {
        self.agent_models
            .get(worker_kind)
            .map(String::as_str)
            .unwrap_or(DEFAULT_MODEL)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanLimits {
    pub scan: TrackLimit,
    pub hypothesis: TrackLimit,
    pub deep_work: TrackLimit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackLimit {
    pub default_tracks: usize,
    pub max_tracks: usize,
}

impl Default for TrackLimit {
    fn default() -> Self {
        Self {
            default_tracks: 3,
            max_tracks: 5,
        }
    }
}

impl TrackLimit {
    /// Requested count clamped to `1..=max_tracks`; `None` means the default.
    pub fn clamp(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_tracks)
            .clamp(1, self.max_tracks.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Time an unhealthy model stays excluded.
    pub cooldown_ms: u64,
    /// Ordered alternative models per worker kind.
    pub model_pools: HashMap<String, Vec<String>>,
    /// Pool used for worker kinds without their own entry.
    pub default_pool: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 300_000,
            model_pools: HashMap::new(),
            default_pool: default_model_pool(),
        }
    }
}

impl HealthConfig {
    pub fn pool_for(&self, worker_kind: &str) -> &[String] {
        self.model_pools
            .get(worker_kind)
            .map(Vec::as_slice)
            .unwrap_or(&self.default_pool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Consecutive failures of one worker kind that trigger failover.
    pub consecutive_failure_threshold: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    /// Running tracks without activity for this long are pruned.
    pub stale_track_ttl_secs: u64,
    /// Completed groups older than this are dropped from the store.
    pub completed_group_ttl_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            stale_track_ttl_secs: 900,
            completed_group_ttl_secs: 6 * 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybookConfig {
    /// Rule documents merged at load. Empty means the bundled playbook.
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory for per-session state files. `None` keeps state in memory.
    pub state_dir: Option<PathBuf>,
    /// Directory for UI snapshots. `None` disables snapshot writing.
    pub snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub event_log: bool,
    pub hook_command: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_log: true,
            hook_command: None,
        }
    }
}

/// Well-known locations under a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub pilot_dir: PathBuf,
    pub state_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: PathBuf, config: &StateConfig) -> Self {
        let pilot_dir = root.join(".probe-pilot");
        Self {
            state_dir: config
                .state_dir
                .clone()
                .unwrap_or_else(|| pilot_dir.join("state")),
            snapshot_dir: config
                .snapshot_dir
                .clone()
                .unwrap_or_else(|| pilot_dir.join("snapshots")),
            logs_dir: pilot_dir.join("logs"),
            pilot_dir,
            root,
        }
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.pilot_dir,
            &self.state_dir,
            &self.snapshot_dir,
            &self.logs_dir,
        ] {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}
