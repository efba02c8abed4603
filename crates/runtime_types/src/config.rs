//! Configuration types for the runtime core

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::event::Payload;

/// Tuning knobs for the event dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of events retained in the history ring
    pub max_history: usize,
    /// Capacity of each priority queue; events beyond this are dropped
    pub queue_capacity: usize,
    /// Deliveries slower than this are flagged (but still complete)
    pub slow_handler_ms: u64,
    /// How long the dispatch loop sleeps when all queues are empty
    pub idle_poll_ms: u64,
    /// Pause after a loop-internal error before retrying
    pub error_backoff_ms: u64,
    /// Collect per-event-type metrics
    pub enable_metrics: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_history: 1000,
            queue_capacity: 1024,
            slow_handler_ms: 1000,
            idle_poll_ms: 10,
            error_backoff_ms: 100,
            enable_metrics: true,
        }
    }
}

/// Per-module configuration record, passed to modules opaquely through
/// `ModuleContext`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub enabled: bool,
    /// Free-form settings the module interprets itself
    pub settings: Payload,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settings: Payload::new(),
        }
    }
}

/// Host-level configuration for the module registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tiers whose modules are allowed to register. Tier 1 is always on.
    pub enabled_tiers: BTreeSet<u8>,
    /// Modules disabled regardless of tier
    pub disabled_modules: BTreeSet<String>,
    /// Per-module configuration records
    pub modules: HashMap<String, ModuleConfig>,
    pub dispatcher: DispatcherConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled_tiers: BTreeSet::from([1]),
            disabled_modules: BTreeSet::new(),
            modules: HashMap::new(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file at '{}'", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("could not parse configuration file at '{}'", path.display()))?;
        Ok(config)
    }

    /// Tier 1 is unconditionally enabled; other tiers must be opted in.
    pub fn is_tier_enabled(&self, tier: u8) -> bool {
        tier == 1 || self.enabled_tiers.contains(&tier)
    }

    /// A module is enabled unless explicitly disabled, either in the
    /// disabled list or in its own configuration record.
    pub fn is_module_enabled(&self, name: &str) -> bool {
        if self.disabled_modules.contains(name) {
            return false;
        }
        self.modules.get(name).map(|m| m.enabled).unwrap_or(true)
    }

    /// The module's configuration record, or the default when absent.
    pub fn module_config(&self, name: &str) -> ModuleConfig {
        self.modules.get(name).cloned().unwrap_or_default()
    }
}
