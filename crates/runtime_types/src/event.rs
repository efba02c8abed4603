//! Event model for the in-process dispatcher
//!
//! Events are immutable once created. The payload is a plain JSON object so
//! modules can exchange structured data without sharing concrete types.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SubscribeError;

/// Event payload: a JSON object keyed by field name.
pub type Payload = serde_json::Map<String, Value>;

/// Delivery tier of an event. High-priority events are always dequeued ahead
/// of pending normal/low ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventPriority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl EventPriority {
    /// Maps a raw priority level to a tier. Unknown levels fall back to
    /// `Normal`.
    pub fn from_level(level: i64) -> Self {
        match level {
            0 => EventPriority::Low,
            2 => EventPriority::High,
            _ => EventPriority::Normal,
        }
    }

    /// All tiers in dispatch order (high first).
    pub const DISPATCH_ORDER: [EventPriority; 3] =
        [EventPriority::High, EventPriority::Normal, EventPriority::Low];
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPriority::Low => write!(f, "low"),
            EventPriority::Normal => write!(f, "normal"),
            EventPriority::High => write!(f, "high"),
        }
    }
}

/// An immutable record of something that happened.
#[derive(Debug, Clone)]
pub struct Event {
    /// Type tag, e.g. `module.started`
    pub event_type: String,
    /// Structured event data
    pub payload: Payload,
    /// Creation time
    pub timestamp: SystemTime,
    /// Module that emitted the event, if any
    pub source_module: Option<String>,
    /// Unique id for tracing and deduplication
    pub event_id: String,
    /// Delivery tier
    pub priority: EventPriority,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        payload: Payload,
        source_module: Option<String>,
        priority: EventPriority,
    ) -> Self {
        let event_type = event_type.into();
        let event_id = format!("{}_{}", event_type, uuid::Uuid::new_v4());
        Self {
            event_type,
            payload,
            timestamp: SystemTime::now(),
            source_module,
            event_id,
            priority,
        }
    }
}

/// A registered interest in one or more event types.
///
/// The same subscription may be filed under several event types; per-type
/// subscriber lists are kept sorted by descending priority, ties by
/// registration order.
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub handler: Arc<dyn EventHandler>,
    pub event_types: BTreeSet<String>,
    pub owner_module: Option<String>,
    pub priority: i32,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_types", &self.event_types)
            .field("owner_module", &self.owner_module)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Opaque subscription identifier returned by `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handler invoked for every delivered event.
///
/// Handlers run isolated from each other: an error (or panic) in one never
/// prevents sibling handlers from running.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event_type: &str, payload: &Payload) -> anyhow::Result<Value>;
}

/// Adapter that turns an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(String, Payload) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle_event(&self, event_type: &str, payload: &Payload) -> anyhow::Result<Value> {
        (self.0)(event_type.to_string(), payload.clone()).await
    }
}

/// Wraps an async closure as a shareable event handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(String, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// The bus surface modules see when registering handlers.
///
/// The concrete dispatcher implements this trait; modules hold it as
/// `Arc<dyn EventBus>` so feature crates depend only on this crate.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Registers `handler` for every type in `event_types`.
    fn subscribe(
        &self,
        event_types: &[&str],
        handler: Arc<dyn EventHandler>,
        owner_module: Option<&str>,
        priority: i32,
    ) -> Result<SubscriptionId, SubscribeError>;

    /// Removes all subscriptions owned by a module. Idempotent.
    fn unsubscribe_module(&self, owner_module: &str);

    /// Publishes an event. Returns `false` if the event was filtered out or
    /// could not be enqueued; producers are never blocked.
    async fn emit(
        &self,
        event_type: &str,
        payload: Payload,
        source_module: Option<&str>,
        priority: EventPriority,
    ) -> bool;
}

/// Standard lifecycle event types emitted by the registry and dispatcher.
pub mod event_types {
    pub const MODULE_LOADED: &str = "module.loaded";
    pub const MODULE_STARTED: &str = "module.started";
    pub const MODULE_STOPPED: &str = "module.stopped";
    pub const MODULE_ERROR: &str = "module.error";
    pub const DISPATCHER_HEALTH_CHECK: &str = "dispatcher.health_check";
}
