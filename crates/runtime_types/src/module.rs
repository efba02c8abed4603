//! Module lifecycle contract
//!
//! Every feature module implements [`Module`]. The registry is the only
//! component that drives the lifecycle hooks and mutates [`ModuleStatus`];
//! modules never touch their own status.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ModuleConfig;
use crate::event::EventBus;

/// Lifecycle state of a registered module. Mutated only by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Unloaded,
    Loading,
    Loaded,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Terminal for the module: no automatic retry.
    Error,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleStatus::Unloaded => "unloaded",
            ModuleStatus::Loading => "loading",
            ModuleStatus::Loaded => "loaded",
            ModuleStatus::Starting => "starting",
            ModuleStatus::Running => "running",
            ModuleStatus::Stopping => "stopping",
            ModuleStatus::Stopped => "stopped",
            ModuleStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Static description of a module, supplied at registration and immutable
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique module name
    pub name: String,
    pub version: String,
    pub description: String,
    /// Names of modules this module requires, in declaration order
    pub dependencies: Vec<String>,
    /// Configuration tier the module belongs to (tier 1 is always enabled)
    pub tier: u8,
    /// Load priority hint (lower loads earlier among unrelated modules)
    pub load_priority: i32,
    pub enabled: bool,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            dependencies: Vec::new(),
            tier: 1,
            load_priority: 50,
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_tier(mut self, tier: u8) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_load_priority(mut self, load_priority: i32) -> Self {
        self.load_priority = load_priority;
        self
    }
}

/// Health report returned by a module's `health_check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub healthy: bool,
    pub status: String,
    pub detail: Option<String>,
}

impl ModuleHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            status: "ok".to_string(),
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            status: "error".to_string(),
            detail: Some(detail.into()),
        }
    }
}

/// Opaque collaborator handles a module receives at construction.
///
/// The orchestration core never interprets the gateway or data store; modules
/// downcast them to the concrete types the host wired in.
#[derive(Clone, Default)]
pub struct ModuleContext {
    gateway: Option<Arc<dyn Any + Send + Sync>>,
    data_store: Option<Arc<dyn Any + Send + Sync>>,
    config: ModuleConfig,
}

impl ModuleContext {
    pub fn new(config: ModuleConfig) -> Self {
        Self {
            gateway: None,
            data_store: None,
            config,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn Any + Send + Sync>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_data_store(mut self, data_store: Arc<dyn Any + Send + Sync>) -> Self {
        self.data_store = Some(data_store);
        self
    }

    /// The messaging gateway, downcast to the host's concrete type.
    pub fn gateway<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.gateway
            .clone()
            .and_then(|g| g.downcast::<T>().ok())
    }

    /// The data store, downcast to the host's concrete type.
    pub fn data_store<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data_store
            .clone()
            .and_then(|d| d.downcast::<T>().ok())
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("has_gateway", &self.gateway.is_some())
            .field("has_data_store", &self.data_store.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// Core trait every feature module implements.
///
/// Hooks are invoked only by the registry, always in dependency order. A hook
/// returning `Err` moves the module to [`ModuleStatus::Error`], excludes it
/// from later phases, and never stops sibling modules.
#[async_trait]
pub trait Module: Send + Sync {
    /// Static description of this module.
    fn descriptor(&self) -> ModuleDescriptor;

    /// One-time initialization before any module is started.
    async fn initialize(&mut self) -> anyhow::Result<()>;

    /// Starts the module's work. Background tasks spawned here must be
    /// retained so `cleanup` can cancel them.
    async fn start(&mut self) -> anyhow::Result<()>;

    /// Stops the module's work.
    async fn stop(&mut self) -> anyhow::Result<()>;

    /// Called during startup, before `start`. The module subscribes its
    /// event handlers on the bus here.
    async fn register_handlers(&mut self, bus: Arc<dyn EventBus>) -> anyhow::Result<()> {
        let _ = bus;
        Ok(())
    }

    /// Commands this module owns, for command-to-module routing.
    fn commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Independent health probe. An `Err` is reported as unhealthy without
    /// affecting other modules.
    async fn health_check(&self) -> anyhow::Result<ModuleHealth> {
        Ok(ModuleHealth::healthy())
    }

    /// Mandatory teardown after `stop`: cancel retained background tasks and
    /// release resources.
    async fn cleanup(&mut self) {}
}
