//! Module registry and lifecycle orchestration.
//!
//! The registry owns every registered module instance and drives it through
//! the lifecycle: register → initialize → start → (run) → stop. Startup order
//! follows a topological sort of the declared dependency graph; shutdown runs
//! in reverse. A module that fails any lifecycle hook lands in the terminal
//! `Error` state and is skipped by later phases; the walk always continues to
//! the remaining modules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{error, info, warn};
use serde_json::json;

use runtime_types::{
    event_types, EventPriority, Module, ModuleDescriptor, ModuleHealth, ModuleStatus, Payload,
    RegistryError, RuntimeConfig,
};

use crate::dispatcher::EventDispatcher;

struct ModuleEntry {
    instance: Box<dyn Module>,
    descriptor: ModuleDescriptor,
    status: ModuleStatus,
    error: Option<String>,
}

/// Registry counters and bookkeeping snapshot.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total: usize,
    pub running: usize,
    pub failed: Vec<String>,
    pub by_status: HashMap<ModuleStatus, usize>,
    pub load_order: Vec<String>,
    pub dependency_graph: HashMap<String, Vec<String>>,
}

/// Aggregate health report across all registered modules.
#[derive(Debug, Clone)]
pub struct RegistryHealth {
    pub healthy: bool,
    pub modules: HashMap<String, ModuleHealth>,
}

/// Owns module instances and drives their lifecycle in dependency order.
pub struct ModuleRegistry {
    dispatcher: Arc<EventDispatcher>,
    config: RuntimeConfig,
    modules: HashMap<String, ModuleEntry>,
    registration_order: Vec<String>,
    dependency_graph: HashMap<String, Vec<String>>,
    load_order: Vec<String>,
    starting: bool,
}

impl ModuleRegistry {
    pub fn new(dispatcher: Arc<EventDispatcher>, config: RuntimeConfig) -> Self {
        Self {
            dispatcher,
            config,
            modules: HashMap::new(),
            registration_order: Vec::new(),
            dependency_graph: HashMap::new(),
            load_order: Vec::new(),
            starting: false,
        }
    }

    /// Registers a module instance. Duplicate names and modules disabled by
    /// tier or configuration are skipped with a log line, not an error. A
    /// dependency cycle rejects the registration and leaves the registry
    /// exactly as it was.
    pub async fn register(&mut self, instance: Box<dyn Module>) -> Result<(), RegistryError> {
        let descriptor = instance.descriptor();
        let name = descriptor.name.clone();

        if self.modules.contains_key(&name) {
            warn!("module '{name}' already registered, skipping");
            return Ok(());
        }
        if !self.config.is_tier_enabled(descriptor.tier) {
            info!(
                "module '{name}' skipped: tier {} is disabled",
                descriptor.tier
            );
            return Ok(());
        }
        if !descriptor.enabled || !self.config.is_module_enabled(&name) {
            info!("module '{name}' skipped: disabled by configuration");
            return Ok(());
        }

        // Validate the candidate graph before touching any registry state
        let mut candidate_graph = self.dependency_graph.clone();
        candidate_graph.insert(name.clone(), descriptor.dependencies.clone());
        let mut candidate_order = self.registration_order.clone();
        candidate_order.push(name.clone());
        let load_order = compute_load_order(&candidate_order, &candidate_graph)?;

        self.modules.insert(
            name.clone(),
            ModuleEntry {
                instance,
                descriptor,
                status: ModuleStatus::Loaded,
                error: None,
            },
        );
        self.registration_order = candidate_order;
        self.dependency_graph = candidate_graph;
        self.load_order = load_order;

        info!("module '{name}' registered");
        self.emit_lifecycle(event_types::MODULE_LOADED, &name, None).await;
        Ok(())
    }

    /// Initializes modules in dependency order. A missing dependency or a
    /// failed `initialize` marks the module `Error`; the walk continues.
    pub async fn initialize_all(&mut self) {
        let order = self.load_order.clone();
        for name in order {
            let Some(entry) = self.modules.get(&name) else {
                continue;
            };
            if entry.status != ModuleStatus::Loaded {
                continue;
            }

            if let Some(missing) = entry
                .descriptor
                .dependencies
                .iter()
                .find(|dep| !self.modules.contains_key(*dep))
            {
                let err = RegistryError::MissingDependency {
                    module: name.clone(),
                    dependency: missing.clone(),
                };
                error!("{err}");
                self.fail_module(&name, err.to_string()).await;
                continue;
            }

            let hook_result = match self.modules.get_mut(&name) {
                Some(entry) => {
                    entry.status = ModuleStatus::Loading;
                    let result = entry.instance.initialize().await;
                    if result.is_ok() {
                        entry.status = ModuleStatus::Loaded;
                    }
                    Some(result)
                }
                None => None,
            };
            match hook_result {
                Some(Ok(())) => info!("module '{name}' initialized"),
                Some(Err(e)) => {
                    error!("module '{name}' failed to initialize: {e:#}");
                    self.fail_module(&name, format!("{e:#}")).await;
                }
                None => {}
            }
        }
    }

    /// Starts initialized modules in dependency order. Returns `false`
    /// without doing anything if a start walk is already in progress. Each
    /// module gets `register_handlers` then `start`; a failure of either
    /// marks it `Error` and the walk continues.
    pub async fn start_all(&mut self) -> bool {
        if self.starting {
            warn!("start_all already in progress, ignoring");
            return false;
        }
        self.starting = true;

        let order = self.load_order.clone();
        let bus: Arc<dyn runtime_types::EventBus> = Arc::clone(&self.dispatcher) as Arc<dyn runtime_types::EventBus>;
        for name in order {
            let hook_result = match self.modules.get_mut(&name) {
                Some(entry) if entry.status == ModuleStatus::Loaded => {
                    entry.status = ModuleStatus::Starting;
                    let result = match entry.instance.register_handlers(Arc::clone(&bus)).await {
                        Ok(()) => entry.instance.start().await,
                        Err(e) => Err(e),
                    };
                    if result.is_ok() {
                        entry.status = ModuleStatus::Running;
                    }
                    Some(result)
                }
                _ => None,
            };

            match hook_result {
                Some(Ok(())) => {
                    info!("module '{name}' started");
                    self.emit_lifecycle(event_types::MODULE_STARTED, &name, None).await;
                }
                Some(Err(e)) => {
                    error!("module '{name}' failed to start: {e:#}");
                    self.fail_module(&name, format!("{e:#}")).await;
                }
                None => {}
            }
        }

        self.starting = false;
        true
    }

    /// Stops running modules in reverse dependency order. A failed `stop` is
    /// logged and shutdown continues; `cleanup` and subscription release run
    /// regardless.
    pub async fn stop_all(&mut self) {
        let order: Vec<String> = self.load_order.iter().rev().cloned().collect();
        for name in order {
            let stopped = match self.modules.get_mut(&name) {
                Some(entry) if entry.status == ModuleStatus::Running => {
                    entry.status = ModuleStatus::Stopping;
                    if let Err(e) = entry.instance.stop().await {
                        error!("module '{name}' failed to stop cleanly: {e:#}");
                    }
                    entry.instance.cleanup().await;
                    entry.status = ModuleStatus::Stopped;
                    true
                }
                _ => false,
            };

            if stopped {
                self.dispatcher.unsubscribe_module(&name);
                info!("module '{name}' stopped");
                self.emit_lifecycle(event_types::MODULE_STOPPED, &name, None).await;
            }
        }
    }

    /// Runs every module's health check independently. A check that returns
    /// `Err` marks that module unhealthy; the aggregate is healthy only when
    /// every module is.
    pub async fn health_check(&self) -> RegistryHealth {
        let mut modules = HashMap::new();
        let mut healthy = true;
        for (name, entry) in &self.modules {
            let mut health = match entry.instance.health_check().await {
                Ok(health) => health,
                Err(e) => ModuleHealth::unhealthy(format!("health check failed: {e:#}")),
            };
            health.healthy = health.healthy && entry.status == ModuleStatus::Running;
            health.status = entry.status.to_string();
            if health.detail.is_none() {
                health.detail = entry.error.clone();
            }
            healthy = healthy && health.healthy;
            modules.insert(name.clone(), health);
        }
        RegistryHealth { healthy, modules }
    }

    pub fn get_module(&self, name: &str) -> Option<&dyn Module> {
        self.modules.get(name).map(|entry| entry.instance.as_ref())
    }

    pub fn get_module_status(&self, name: &str) -> Option<ModuleStatus> {
        self.modules.get(name).map(|entry| entry.status)
    }

    pub fn is_module_running(&self, name: &str) -> bool {
        self.get_module_status(name) == Some(ModuleStatus::Running)
    }

    /// Names of running modules, in load order.
    pub fn get_running_modules(&self) -> Vec<String> {
        self.load_order
            .iter()
            .filter(|name| self.is_module_running(name))
            .cloned()
            .collect()
    }

    /// Command names of running modules mapped to their owner. The first
    /// module to claim a command in load order wins; collisions are logged.
    pub fn get_all_commands(&self) -> HashMap<String, String> {
        let mut commands: HashMap<String, String> = HashMap::new();
        for name in &self.load_order {
            let Some(entry) = self.modules.get(name) else {
                continue;
            };
            if entry.status != ModuleStatus::Running {
                continue;
            }
            for command in entry.instance.commands() {
                if let Some(owner) = commands.get(&command) {
                    warn!(
                        "command '{command}' from module '{name}' already provided by '{owner}'"
                    );
                } else {
                    commands.insert(command, name.clone());
                }
            }
        }
        commands
    }

    pub fn get_stats(&self) -> RegistryStats {
        let mut by_status: HashMap<ModuleStatus, usize> = HashMap::new();
        let mut failed = Vec::new();
        for (name, entry) in &self.modules {
            *by_status.entry(entry.status).or_default() += 1;
            if entry.status == ModuleStatus::Error {
                failed.push(name.clone());
            }
        }
        failed.sort();
        RegistryStats {
            total: self.modules.len(),
            running: by_status.get(&ModuleStatus::Running).copied().unwrap_or(0),
            failed,
            by_status,
            load_order: self.load_order.clone(),
            dependency_graph: self.dependency_graph.clone(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Marks a module failed. `Error` is terminal: later lifecycle phases
    /// skip the entry.
    async fn fail_module(&mut self, name: &str, detail: String) {
        if let Some(entry) = self.modules.get_mut(name) {
            entry.status = ModuleStatus::Error;
            entry.error = Some(detail.clone());
        }
        self.emit_lifecycle(event_types::MODULE_ERROR, name, Some(detail)).await;
    }

    async fn emit_lifecycle(&self, event_type: &str, module_name: &str, detail: Option<String>) {
        let mut payload = Payload::new();
        payload.insert("module_name".to_string(), json!(module_name));
        if let Some(detail) = detail {
            payload.insert("error".to_string(), json!(detail));
        }
        self.dispatcher
            .emit(event_type, payload, Some("module_registry"), EventPriority::High)
            .await;
    }
}

/// Topological sort of `order` by declared dependencies, dependencies first.
/// Ties keep registration order. Dependency names absent from the graph are
/// ignored here and surfaced by `initialize_all`. A cycle yields
/// `CyclicDependency` naming the module it was detected at.
fn compute_load_order(
    order: &[String],
    graph: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, RegistryError> {
    fn visit(
        name: &str,
        graph: &HashMap<String, Vec<String>>,
        permanent: &mut HashSet<String>,
        temporary: &mut HashSet<String>,
        sorted: &mut Vec<String>,
    ) -> Result<(), RegistryError> {
        if permanent.contains(name) {
            return Ok(());
        }
        if !temporary.insert(name.to_string()) {
            return Err(RegistryError::CyclicDependency(name.to_string()));
        }
        if let Some(dependencies) = graph.get(name) {
            for dependency in dependencies {
                if graph.contains_key(dependency) {
                    visit(dependency, graph, permanent, temporary, sorted)?;
                }
            }
        }
        temporary.remove(name);
        permanent.insert(name.to_string());
        sorted.push(name.to_string());
        Ok(())
    }

    let mut permanent = HashSet::new();
    let mut temporary = HashSet::new();
    let mut sorted = Vec::with_capacity(order.len());
    for name in order {
        visit(name, graph, &mut permanent, &mut temporary, &mut sorted)?;
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use runtime_types::DispatcherConfig;
    use std::sync::Mutex as StdMutex;

    type CallLog = Arc<StdMutex<Vec<String>>>;

    /// Test module that records its lifecycle calls and can be told to fail
    /// a given hook.
    struct RecordingModule {
        descriptor: ModuleDescriptor,
        log: CallLog,
        fail_on: Option<&'static str>,
    }

    impl RecordingModule {
        fn boxed(name: &str, dependencies: &[&str], log: CallLog) -> Box<dyn Module> {
            Self::failing(name, dependencies, log, None)
        }

        fn failing(
            name: &str,
            dependencies: &[&str],
            log: CallLog,
            fail_on: Option<&'static str>,
        ) -> Box<dyn Module> {
            Box::new(Self {
                descriptor: ModuleDescriptor::new(name, "1.0.0").with_dependencies(
                    dependencies.iter().map(|d| (*d).to_string()).collect(),
                ),
                log,
                fail_on,
            })
        }

        fn record(&self, hook: &str) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.descriptor.name, hook));
            if self.fail_on == Some(hook) {
                Err(anyhow!("{} deliberately failed {}", self.descriptor.name, hook))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Module for RecordingModule {
        fn descriptor(&self) -> ModuleDescriptor {
            self.descriptor.clone()
        }

        async fn initialize(&mut self) -> anyhow::Result<()> {
            self.record("initialize")
        }

        async fn start(&mut self) -> anyhow::Result<()> {
            self.record("start")
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            self.record("stop")
        }

        async fn cleanup(&mut self) {
            let _ = self.record("cleanup");
        }

        fn commands(&self) -> Vec<String> {
            vec![format!("{}-cmd", self.descriptor.name), "shared".to_string()]
        }
    }

    fn new_registry() -> ModuleRegistry {
        let dispatcher = Arc::new(EventDispatcher::new(DispatcherConfig::default()));
        ModuleRegistry::new(dispatcher, RuntimeConfig::default())
    }

    fn calls(log: &CallLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_register_and_full_lifecycle_order() {
        let mut registry = new_registry();
        let log: CallLog = Arc::default();

        // b depends on a, registered out of order
        registry
            .register(RecordingModule::boxed("b", &["a"], Arc::clone(&log)))
            .await
            .unwrap();
        registry
            .register(RecordingModule::boxed("a", &[], Arc::clone(&log)))
            .await
            .unwrap();
        assert_eq!(registry.get_stats().load_order, ["a", "b"]);

        registry.initialize_all().await;
        assert_eq!(calls(&log), ["a:initialize", "b:initialize"]);

        assert!(registry.start_all().await);
        assert!(registry.is_module_running("a"));
        assert!(registry.is_module_running("b"));
        assert_eq!(registry.get_running_modules(), ["a", "b"]);

        log.lock().unwrap().clear();
        registry.stop_all().await;
        // Dependents stop before their dependencies
        assert_eq!(
            calls(&log),
            ["b:stop", "b:cleanup", "a:stop", "a:cleanup"]
        );
        assert_eq!(registry.get_module_status("a"), Some(ModuleStatus::Stopped));
        assert_eq!(registry.get_module_status("b"), Some(ModuleStatus::Stopped));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_noop() {
        let mut registry = new_registry();
        let log: CallLog = Arc::default();
        registry
            .register(RecordingModule::boxed("a", &[], Arc::clone(&log)))
            .await
            .unwrap();
        registry
            .register(RecordingModule::boxed("a", &[], Arc::clone(&log)))
            .await
            .unwrap();
        assert_eq!(registry.get_stats().total, 1);
    }

    #[tokio::test]
    async fn test_disabled_module_is_skipped() {
        let mut config = RuntimeConfig::default();
        config.disabled_modules.insert("a".to_string());
        let dispatcher = Arc::new(EventDispatcher::new(DispatcherConfig::default()));
        let mut registry = ModuleRegistry::new(dispatcher, config);

        let log: CallLog = Arc::default();
        registry
            .register(RecordingModule::boxed("a", &[], Arc::clone(&log)))
            .await
            .unwrap();
        registry
            .register(RecordingModule::boxed("b", &[], Arc::clone(&log)))
            .await
            .unwrap();
        assert_eq!(registry.get_module_status("a"), None);
        assert_eq!(registry.get_stats().load_order, ["b"]);
    }

    #[tokio::test]
    async fn test_disabled_tier_is_skipped() {
        let mut registry = new_registry();
        let log: CallLog = Arc::default();
        let tiered = Box::new(RecordingModule {
            descriptor: ModuleDescriptor::new("experimental", "0.1.0").with_tier(3),
            log,
            fail_on: None,
        });
        registry.register(tiered).await.unwrap();
        assert_eq!(registry.get_stats().total, 0);
    }

    #[tokio::test]
    async fn test_cycle_rejected_without_partial_state() {
        let mut registry = new_registry();
        let log: CallLog = Arc::default();
        registry
            .register(RecordingModule::boxed("a", &["b"], Arc::clone(&log)))
            .await
            .unwrap();
        let before = registry.get_stats();

        let result = registry
            .register(RecordingModule::boxed("b", &["a"], Arc::clone(&log)))
            .await;
        assert!(matches!(result, Err(RegistryError::CyclicDependency(_))));

        // Failed registration must leave the registry untouched
        let after = registry.get_stats();
        assert_eq!(after.total, before.total);
        assert_eq!(after.load_order, before.load_order);
        assert_eq!(after.dependency_graph, before.dependency_graph);
        assert_eq!(registry.get_module_status("b"), None);
    }

    #[tokio::test]
    async fn test_missing_dependency_fails_module_and_continues() {
        let mut registry = new_registry();
        let log: CallLog = Arc::default();
        registry
            .register(RecordingModule::boxed("a", &["ghost"], Arc::clone(&log)))
            .await
            .unwrap();
        registry
            .register(RecordingModule::boxed("b", &[], Arc::clone(&log)))
            .await
            .unwrap();

        registry.initialize_all().await;
        assert_eq!(registry.get_module_status("a"), Some(ModuleStatus::Error));
        assert_eq!(registry.get_module_status("b"), Some(ModuleStatus::Loaded));
        assert_eq!(calls(&log), ["b:initialize"]);
        assert_eq!(registry.get_stats().failed, ["a"]);
    }

    #[tokio::test]
    async fn test_start_failure_is_isolated() {
        let mut registry = new_registry();
        let log: CallLog = Arc::default();
        registry
            .register(RecordingModule::failing("a", &[], Arc::clone(&log), Some("start")))
            .await
            .unwrap();
        registry
            .register(RecordingModule::boxed("b", &[], Arc::clone(&log)))
            .await
            .unwrap();

        registry.initialize_all().await;
        assert!(registry.start_all().await);

        assert_eq!(registry.get_module_status("a"), Some(ModuleStatus::Error));
        assert!(registry.is_module_running("b"));

        // Error is terminal: the failed module never starts on a later walk
        assert!(registry.start_all().await);
        assert_eq!(registry.get_module_status("a"), Some(ModuleStatus::Error));
    }

    #[tokio::test]
    async fn test_stop_failure_still_cleans_up() {
        let mut registry = new_registry();
        let log: CallLog = Arc::default();
        registry
            .register(RecordingModule::failing("a", &[], Arc::clone(&log), Some("stop")))
            .await
            .unwrap();
        registry.initialize_all().await;
        assert!(registry.start_all().await);

        registry.stop_all().await;
        assert_eq!(registry.get_module_status("a"), Some(ModuleStatus::Stopped));
        assert!(calls(&log).contains(&"a:cleanup".to_string()));
    }

    #[tokio::test]
    async fn test_command_aggregation_first_wins() {
        let mut registry = new_registry();
        let log: CallLog = Arc::default();
        registry
            .register(RecordingModule::boxed("a", &[], Arc::clone(&log)))
            .await
            .unwrap();
        registry
            .register(RecordingModule::boxed("b", &[], Arc::clone(&log)))
            .await
            .unwrap();
        registry.initialize_all().await;
        assert!(registry.start_all().await);

        let commands = registry.get_all_commands();
        assert_eq!(commands["a-cmd"], "a");
        assert_eq!(commands["b-cmd"], "b");
        // Both modules claim "shared"; the first in load order owns it
        assert_eq!(commands["shared"], "a");
    }

    #[tokio::test]
    async fn test_health_check_aggregates_per_module() {
        let mut registry = new_registry();
        let log: CallLog = Arc::default();
        registry
            .register(RecordingModule::boxed("a", &[], Arc::clone(&log)))
            .await
            .unwrap();
        registry
            .register(RecordingModule::failing("b", &[], Arc::clone(&log), Some("start")))
            .await
            .unwrap();
        registry.initialize_all().await;
        assert!(registry.start_all().await);

        let health = registry.health_check().await;
        assert!(!health.healthy);
        assert!(health.modules["a"].healthy);
        assert!(!health.modules["b"].healthy);
        assert_eq!(health.modules["a"].status, "running");
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_emitted() {
        let mut registry = new_registry();
        let log: CallLog = Arc::default();
        registry
            .register(RecordingModule::boxed("a", &[], Arc::clone(&log)))
            .await
            .unwrap();
        registry.initialize_all().await;
        assert!(registry.start_all().await);
        registry.stop_all().await;

        let history = registry.dispatcher().get_event_history(0, None);
        let sequence: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            sequence,
            [
                event_types::MODULE_LOADED,
                event_types::MODULE_STARTED,
                event_types::MODULE_STOPPED
            ]
        );
        assert_eq!(history[0].payload["module_name"], json!("a"));
    }

    #[test]
    fn test_compute_load_order_respects_dependencies() {
        let order = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        let mut graph = HashMap::new();
        graph.insert("a".to_string(), vec![]);
        graph.insert("b".to_string(), vec!["a".to_string()]);
        graph.insert("c".to_string(), vec!["b".to_string(), "a".to_string()]);

        let sorted = compute_load_order(&order, &graph).unwrap();
        assert_eq!(sorted, ["a", "b", "c"]);
    }

    #[test]
    fn test_compute_load_order_detects_cycles() {
        let order = vec!["a".to_string(), "b".to_string()];
        let mut graph = HashMap::new();
        graph.insert("a".to_string(), vec!["b".to_string()]);
        graph.insert("b".to_string(), vec!["a".to_string()]);

        let result = compute_load_order(&order, &graph);
        assert!(matches!(result, Err(RegistryError::CyclicDependency(_))));
    }
}
