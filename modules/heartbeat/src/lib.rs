//! Heartbeat module: periodic liveness ticks over the event bus.
//!
//! Emits `heartbeat.tick` at a configurable interval while running and
//! answers `heartbeat.ping` queries with the current tick count. Mostly
//! useful as a wiring check for a freshly assembled runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use runtime_types::{
    handler_fn, EventBus, EventPriority, Module, ModuleContext, ModuleDescriptor, ModuleHealth,
    Payload,
};

pub const TICK_EVENT: &str = "heartbeat.tick";
pub const PING_EVENT: &str = "heartbeat.ping";

const DEFAULT_INTERVAL_MS: u64 = 1000;

pub struct HeartbeatModule {
    ctx: ModuleContext,
    interval: Duration,
    bus: Option<Arc<dyn EventBus>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl HeartbeatModule {
    pub fn new(ctx: ModuleContext) -> Self {
        let interval_ms = ctx
            .config()
            .settings
            .get("interval_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_INTERVAL_MS);
        Self {
            ctx,
            interval: Duration::from_millis(interval_ms.max(1)),
            bus: None,
            cancel: CancellationToken::new(),
            task: None,
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }
}

#[async_trait]
impl Module for HeartbeatModule {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("heartbeat", env!("CARGO_PKG_VERSION"))
            .with_description("periodic liveness ticks over the event bus")
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        debug!("heartbeat interval is {:?}", self.interval);
        Ok(())
    }

    async fn register_handlers(&mut self, bus: Arc<dyn EventBus>) -> anyhow::Result<()> {
        let ticks = Arc::clone(&self.ticks);
        bus.subscribe(
            &[PING_EVENT],
            handler_fn(move |_event_type, _payload| {
                let ticks = Arc::clone(&ticks);
                async move { Ok(json!({ "pong": true, "ticks": ticks.load(Ordering::Relaxed) })) }
            }),
            Some("heartbeat"),
            0,
        )?;
        self.bus = Some(bus);
        Ok(())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let bus = self
            .bus
            .clone()
            .ok_or_else(|| anyhow::anyhow!("heartbeat started before handler registration"))?;
        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let ticks = Arc::clone(&self.ticks);

        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let seq = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                        let mut payload = Payload::new();
                        payload.insert("seq".to_string(), json!(seq));
                        if !bus.emit(TICK_EVENT, payload, Some("heartbeat"), EventPriority::Normal).await {
                            warn!("heartbeat tick {seq} was not accepted");
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("heartbeat task failed to join: {e}");
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<ModuleHealth> {
        match &self.task {
            Some(task) if !task.is_finished() => {
                let mut health = ModuleHealth::healthy();
                health.detail = Some(format!("{} ticks", self.tick_count()));
                Ok(health)
            }
            _ => Ok(ModuleHealth::unhealthy("tick task not running")),
        }
    }

    fn commands(&self) -> Vec<String> {
        vec!["heartbeat".to_string()]
    }

    async fn cleanup(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_types::{ModuleConfig, SubscribeError, SubscriptionId};
    use std::sync::Mutex;

    /// Minimal bus double that records emitted events.
    #[derive(Default)]
    struct RecordingBus {
        emitted: Mutex<Vec<String>>,
        subscribed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventBus for RecordingBus {
        fn subscribe(
            &self,
            event_types: &[&str],
            _handler: Arc<dyn runtime_types::EventHandler>,
            _owner_module: Option<&str>,
            _priority: i32,
        ) -> Result<SubscriptionId, SubscribeError> {
            self.subscribed
                .lock()
                .unwrap()
                .extend(event_types.iter().map(|t| t.to_string()));
            Ok(SubscriptionId("test_0".to_string()))
        }

        fn unsubscribe_module(&self, _owner_module: &str) {}

        async fn emit(
            &self,
            event_type: &str,
            _payload: Payload,
            _source_module: Option<&str>,
            _priority: EventPriority,
        ) -> bool {
            self.emitted.lock().unwrap().push(event_type.to_string());
            true
        }
    }

    fn module_with_interval(interval_ms: u64) -> HeartbeatModule {
        let mut config = ModuleConfig::default();
        config
            .settings
            .insert("interval_ms".to_string(), json!(interval_ms));
        HeartbeatModule::new(ModuleContext::new(config))
    }

    #[tokio::test]
    async fn test_reads_interval_from_settings() {
        let module = module_with_interval(25);
        assert_eq!(module.interval, Duration::from_millis(25));

        let default = HeartbeatModule::new(ModuleContext::default());
        assert_eq!(default.interval, Duration::from_millis(DEFAULT_INTERVAL_MS));
    }

    #[tokio::test]
    async fn test_start_requires_registered_handlers() {
        let mut module = module_with_interval(10);
        assert!(module.start().await.is_err());
    }

    #[tokio::test]
    async fn test_ticks_until_stopped() {
        let mut module = module_with_interval(5);
        let bus = Arc::new(RecordingBus::default());
        module
            .register_handlers(Arc::clone(&bus) as Arc<dyn EventBus>)
            .await
            .unwrap();
        assert_eq!(bus.subscribed.lock().unwrap().as_slice(), [PING_EVENT]);

        module.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        module.stop().await.unwrap();

        let ticks = module.tick_count();
        assert!(ticks > 0, "expected at least one tick");
        assert_eq!(bus.emitted.lock().unwrap().len() as u64, ticks);

        // No further ticks after stop
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(module.tick_count(), ticks);
    }

    #[tokio::test]
    async fn test_health_reflects_task_state() {
        let mut module = module_with_interval(5);
        assert!(!module.health_check().await.unwrap().healthy);

        let bus = Arc::new(RecordingBus::default());
        module
            .register_handlers(Arc::clone(&bus) as Arc<dyn EventBus>)
            .await
            .unwrap();
        module.start().await.unwrap();
        assert!(module.health_check().await.unwrap().healthy);
        module.stop().await.unwrap();
        assert!(!module.health_check().await.unwrap().healthy);
    }
}
