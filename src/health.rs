//! Model health registry.
//!
//! Circuit breaker over the fixed pool of worker models. A model marked
//! unhealthy is skipped until its cooldown elapses; the record does not need
//! to be cleared for the model to become eligible again, though a successful
//! dispatch clears it. Resolution never fails: when every alternative is
//! cooling down the bare worker kind is returned (degraded service over hard
//! failure).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{SharedClock, elapsed_ms};
use crate::config::{HealthConfig, ModelRef};

/// Joins a worker kind and a model id into a variant name.
pub const VARIANT_SEPARATOR: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHealthRecord {
    pub unhealthy_since: DateTime<Utc>,
    pub reason: String,
}

impl ModelHealthRecord {
    pub fn is_cooling_down(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        (elapsed_ms(self.unhealthy_since, now) as u128) < cooldown.as_millis()
    }
}

/// Resolved execution profile for a worker kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentVariant {
    pub worker_kind: String,
    /// `None` when no alternative was healthy and the bare kind is used.
    pub model: Option<ModelRef>,
    pub name: String,
}

impl AgentVariant {
    fn qualified(worker_kind: &str, model: ModelRef) -> Self {
        Self {
            name: variant_name(worker_kind, &model.model_id),
            worker_kind: worker_kind.to_string(),
            model: Some(model),
        }
    }

    fn bare(worker_kind: &str) -> Self {
        Self {
            worker_kind: worker_kind.to_string(),
            model: None,
            name: worker_kind.to_string(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.model.is_none()
    }
}

pub fn variant_name(worker_kind: &str, model_id: &str) -> String {
    format!("{}{}{}", worker_kind, VARIANT_SEPARATOR, model_id)
}

/// Split a variant name back into `(worker_kind, model_id)`.
pub fn split_variant(name: &str) -> (&str, Option<&str>) {
    match name.split_once(VARIANT_SEPARATOR) {
        Some((kind, model)) => (kind, Some(model)),
        None => (name, None),
    }
}

pub struct ModelHealthRegistry {
    pools: HashMap<String, Vec<String>>,
    default_pool: Vec<String>,
    records: RwLock<HashMap<String, ModelHealthRecord>>,
    clock: SharedClock,
}

impl ModelHealthRegistry {
    pub fn new(config: &HealthConfig, clock: SharedClock) -> Self {
        Self {
            pools: config.model_pools.clone(),
            default_pool: config.default_pool.clone(),
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Adopt records persisted with a session. Records past their cooldown
    /// are ignored and a newer in-memory record is kept. Returns how many
    /// records were taken over.
    pub fn restore<'a>(
        &self,
        records: impl IntoIterator<Item = (&'a String, &'a ModelHealthRecord)>,
        cooldown: Duration,
    ) -> usize {
        let now = self.clock.now();
        let mut current = self.records.write();
        let mut restored = 0;
        for (model, record) in records {
            if !record.is_cooling_down(now, cooldown) {
                continue;
            }
            let newer = current
                .get(model)
                .is_none_or(|known| known.unhealthy_since < record.unhealthy_since);
            if newer {
                current.insert(model.clone(), record.clone());
                restored += 1;
            }
        }
        restored
    }

    pub fn pool_for(&self, worker_kind: &str) -> &[String] {
        self.pools
            .get(worker_kind)
            .map(Vec::as_slice)
            .unwrap_or(&self.default_pool)
    }

    pub fn mark_model_unhealthy(&self, model: &str, reason: &str) -> ModelHealthRecord {
        let record = ModelHealthRecord {
            unhealthy_since: self.clock.now(),
            reason: reason.to_string(),
        };
        self.records
            .write()
            .insert(model.to_string(), record.clone());
        info!(model, reason, "Model marked unhealthy");
        record
    }

    /// Drop the unhealthy record after a successful dispatch.
    pub fn clear(&self, model: &str) -> bool {
        let removed = self.records.write().remove(model).is_some();
        if removed {
            debug!(model, "Model health record cleared");
        }
        removed
    }

    pub fn is_model_healthy(&self, model: &str, cooldown: Duration) -> bool {
        let now = self.clock.now();
        self.records
            .read()
            .get(model)
            .is_none_or(|record| !record.is_cooling_down(now, cooldown))
    }

    pub fn record(&self, model: &str) -> Option<ModelHealthRecord> {
        self.records.read().get(model).cloned()
    }

    pub fn resolve_healthy_variant(&self, worker_kind: &str, cooldown: Duration) -> AgentVariant {
        for model in self.pool_for(worker_kind) {
            if self.is_model_healthy(model, cooldown) {
                return AgentVariant::qualified(worker_kind, ModelRef::parse(model));
            }
        }
        debug!(worker_kind, "No healthy model in pool, using base worker kind");
        AgentVariant::bare(worker_kind)
    }

    /// First healthy variant name for the worker kind, or the kind itself.
    pub fn resolve_healthy_agent(&self, worker_kind: &str, cooldown: Duration) -> String {
        self.resolve_healthy_variant(worker_kind, cooldown).name
    }
}
