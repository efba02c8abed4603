//! Priority-aware publish/subscribe event dispatcher
//!
//! A single dispatch loop drains three bounded priority queues in strict
//! high → normal → low order and fans each event out to its subscribers.
//! Producers never block: `emit` uses `try_send` and reports overload by
//! returning `false`. Subscriber failures are isolated per handler and never
//! reach producers or the loop.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use runtime_types::{
    event_types, DispatcherConfig, Event, EventBus, EventHandler, EventPriority, Payload,
    SubscribeError, Subscription, SubscriptionId,
};

/// Predicate applied to every emitted event. An event is enqueued only if
/// all registered filters accept it.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Per-event-type delivery metrics.
#[derive(Debug, Clone, Default)]
pub struct EventTypeMetrics {
    pub count: u64,
    pub total_time: Duration,
    pub error_count: u64,
    pub last_event: Option<SystemTime>,
}

/// Snapshot of dispatcher metrics.
#[derive(Debug, Clone)]
pub struct DispatcherMetrics {
    /// Events accepted by `emit`
    pub event_count: u64,
    /// Events fully fanned out by the dispatch loop
    pub processed_count: u64,
    /// Handler failures plus loop-internal errors
    pub error_count: u64,
    /// Events dropped at a full queue
    pub dropped_count: u64,
    /// Deliveries that exceeded the slow threshold
    pub slow_deliveries: u64,
    pub avg_processing_ms: f64,
    pub queue_depths: QueueDepths,
    pub by_type: HashMap<String, EventTypeMetrics>,
    pub history_size: usize,
    pub is_running: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDepths {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

/// Subscription table counts.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionStats {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    pub by_module: HashMap<String, usize>,
}

/// Dispatcher self-check report.
#[derive(Debug, Clone)]
pub struct DispatcherHealth {
    pub healthy: bool,
    pub is_running: bool,
    pub emit_accepted: bool,
    pub response_time: Duration,
}

#[derive(Default)]
struct MetricsState {
    event_count: u64,
    processed_count: u64,
    error_count: u64,
    dropped_count: u64,
    slow_deliveries: u64,
    total_processing: Duration,
    by_type: HashMap<String, EventTypeMetrics>,
}

struct QueueReceivers {
    high: mpsc::Receiver<Event>,
    normal: mpsc::Receiver<Event>,
    low: mpsc::Receiver<Event>,
}

impl QueueReceivers {
    /// Pulls at most one event per scan, highest tier first.
    fn next_event(&mut self) -> Option<Event> {
        for priority in EventPriority::DISPATCH_ORDER {
            let receiver = match priority {
                EventPriority::High => &mut self.high,
                EventPriority::Normal => &mut self.normal,
                EventPriority::Low => &mut self.low,
            };
            if let Ok(event) = receiver.try_recv() {
                return Some(event);
            }
        }
        None
    }
}

/// In-process, priority-aware publish/subscribe bus.
pub struct EventDispatcher {
    config: DispatcherConfig,
    subscriptions: RwLock<HashMap<String, Vec<Arc<Subscription>>>>,
    filters: RwLock<Vec<EventFilter>>,
    history: StdMutex<VecDeque<Event>>,
    metrics: StdMutex<MetricsState>,
    high_tx: mpsc::Sender<Event>,
    normal_tx: mpsc::Sender<Event>,
    low_tx: mpsc::Sender<Event>,
    receivers: Arc<TokioMutex<QueueReceivers>>,
    loop_task: TokioMutex<Option<JoinHandle<()>>>,
    cancel: StdMutex<Option<CancellationToken>>,
    running: AtomicBool,
    subscription_seq: AtomicU64,
}

impl EventDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (high_tx, high_rx) = mpsc::channel(capacity);
        let (normal_tx, normal_rx) = mpsc::channel(capacity);
        let (low_tx, low_rx) = mpsc::channel(capacity);
        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
            filters: RwLock::new(Vec::new()),
            history: StdMutex::new(VecDeque::new()),
            metrics: StdMutex::new(MetricsState::default()),
            high_tx,
            normal_tx,
            low_tx,
            receivers: Arc::new(TokioMutex::new(QueueReceivers {
                high: high_rx,
                normal: normal_rx,
                low: low_rx,
            })),
            loop_task: TokioMutex::new(None),
            cancel: StdMutex::new(None),
            running: AtomicBool::new(false),
            subscription_seq: AtomicU64::new(0),
        }
    }

    /// Starts the single dispatch loop. Idempotent: a second call while the
    /// loop is running is a logged no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("event dispatcher already running");
            return;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        // The loop task holds the receiver lock for its lifetime; the lock is
        // released on exit so the dispatcher can be restarted after stop().
        let receivers = Arc::clone(&self.receivers).lock_owned().await;
        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            dispatcher.run_loop(receivers, cancel).await;
        });
        *self.loop_task.lock().await = Some(handle);
        info!("event dispatcher started");
    }

    /// Cancels and awaits the dispatch loop. Queued-but-undelivered events
    /// are accepted loss at shutdown.
    pub async fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        if let Some(handle) = self.loop_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("dispatch loop task failed to join: {e}");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("event dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Registers `handler` for every type in `event_types`. Subscriber lists
    /// stay sorted by descending priority, ties by registration order.
    pub fn subscribe(
        &self,
        event_types: &[&str],
        handler: Arc<dyn EventHandler>,
        owner_module: Option<&str>,
        priority: i32,
    ) -> Result<SubscriptionId, SubscribeError> {
        if event_types.is_empty() {
            return Err(SubscribeError::EmptyEventTypes);
        }

        let seq = self.subscription_seq.fetch_add(1, Ordering::Relaxed);
        let id = SubscriptionId(format!("{}_{}", owner_module.unwrap_or("anonymous"), seq));
        let subscription = Arc::new(Subscription {
            id: id.clone(),
            handler,
            event_types: event_types.iter().map(|t| (*t).to_string()).collect::<BTreeSet<_>>(),
            owner_module: owner_module.map(str::to_string),
            priority,
        });

        let mut table = self.subscriptions.write().unwrap();
        for event_type in event_types {
            let list = table.entry((*event_type).to_string()).or_default();
            list.push(Arc::clone(&subscription));
            // Stable sort keeps registration order within equal priorities
            list.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        debug!(
            owner = owner_module.unwrap_or("anonymous"),
            ?event_types,
            priority,
            "subscription registered"
        );
        Ok(id)
    }

    /// Removes every subscription owned by `owner_module`. Idempotent.
    pub fn unsubscribe_module(&self, owner_module: &str) {
        let mut table = self.subscriptions.write().unwrap();
        for list in table.values_mut() {
            list.retain(|sub| sub.owner_module.as_deref() != Some(owner_module));
        }
        table.retain(|_, list| !list.is_empty());
        debug!(owner = owner_module, "module subscriptions removed");
    }

    /// All filters must accept an event for it to be enqueued.
    pub fn add_filter(&self, filter: EventFilter) {
        self.filters.write().unwrap().push(filter);
        debug!("event filter added");
    }

    /// Publishes an event. Returns `false` when the event is rejected by a
    /// filter or the target queue is full; producers never block and errors
    /// never propagate to them.
    pub async fn emit(
        &self,
        event_type: &str,
        payload: Payload,
        source_module: Option<&str>,
        priority: EventPriority,
    ) -> bool {
        let event = Event::new(
            event_type,
            payload,
            source_module.map(str::to_string),
            priority,
        );

        if !self.passes_filters(&event) {
            debug!(event_type, "event rejected by filter");
            return false;
        }

        let sender = match priority {
            EventPriority::High => &self.high_tx,
            EventPriority::Normal => &self.normal_tx,
            EventPriority::Low => &self.low_tx,
        };

        match sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event_type, %priority, "priority queue full, dropping event");
                self.metrics.lock().unwrap().dropped_count += 1;
                return false;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(event_type, "priority queue closed, dropping event");
                self.metrics.lock().unwrap().error_count += 1;
                return false;
            }
        }

        self.push_history(event);
        self.metrics.lock().unwrap().event_count += 1;
        debug!(event_type, source = source_module.unwrap_or("-"), "event emitted");
        true
    }

    /// Invokes all current subscribers of `event_type` concurrently and
    /// waits up to `timeout` for their results. Subscribers that miss the
    /// deadline are cancelled and excluded; per-subscriber failures are
    /// returned as `Err` entries alongside successes.
    pub async fn emit_and_wait(
        &self,
        event_type: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Vec<Result<Value, String>> {
        let subscribers = self.subscribers_for(event_type);
        if subscribers.is_empty() {
            return Vec::new();
        }

        let event = Arc::new(Event::new(event_type, payload, None, EventPriority::High));
        let mut tasks: JoinSet<Result<Value, String>> = JoinSet::new();
        for subscription in subscribers {
            let event = Arc::clone(&event);
            let handler = Arc::clone(&subscription.handler);
            let owner = subscription
                .owner_module
                .clone()
                .unwrap_or_else(|| "anonymous".to_string());
            tasks.spawn(async move {
                handler
                    .handle_event(&event.event_type, &event.payload)
                    .await
                    .map_err(|e| format!("{owner}: {e:#}"))
            });
        }

        let deadline = Instant::now() + timeout;
        let mut results = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(event_type, "emit_and_wait deadline reached, cancelling stragglers");
                tasks.abort_all();
                break;
            }
            match tokio::time::timeout(remaining, tasks.join_next()).await {
                Ok(Some(Ok(result))) => results.push(result),
                Ok(Some(Err(join_err))) => {
                    if !join_err.is_cancelled() {
                        results.push(Err(format!("handler panicked: {join_err}")));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(event_type, "emit_and_wait deadline reached, cancelling stragglers");
                    tasks.abort_all();
                    break;
                }
            }
        }
        results
    }

    /// Recent events, oldest first, optionally filtered by type. `limit` of
    /// zero returns the whole retained history.
    pub fn get_event_history(&self, limit: usize, event_type: Option<&str>) -> Vec<Event> {
        let history = self.history.lock().unwrap();
        let events: Vec<Event> = history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect();
        if limit == 0 || events.len() <= limit {
            events
        } else {
            events[events.len() - limit..].to_vec()
        }
    }

    pub fn get_metrics(&self) -> DispatcherMetrics {
        let metrics = self.metrics.lock().unwrap();
        let avg_processing_ms = if metrics.processed_count > 0 {
            metrics.total_processing.as_secs_f64() * 1000.0 / metrics.processed_count as f64
        } else {
            0.0
        };
        DispatcherMetrics {
            event_count: metrics.event_count,
            processed_count: metrics.processed_count,
            error_count: metrics.error_count,
            dropped_count: metrics.dropped_count,
            slow_deliveries: metrics.slow_deliveries,
            avg_processing_ms,
            queue_depths: QueueDepths {
                high: self.queue_depth(&self.high_tx),
                normal: self.queue_depth(&self.normal_tx),
                low: self.queue_depth(&self.low_tx),
            },
            by_type: metrics.by_type.clone(),
            history_size: self.history.lock().unwrap().len(),
            is_running: self.is_running(),
        }
    }

    pub fn get_subscription_stats(&self) -> SubscriptionStats {
        let table = self.subscriptions.read().unwrap();
        let mut stats = SubscriptionStats::default();
        for (event_type, list) in table.iter() {
            stats.by_type.insert(event_type.clone(), list.len());
            stats.total += list.len();
            for subscription in list {
                if let Some(owner) = &subscription.owner_module {
                    *stats.by_module.entry(owner.clone()).or_default() += 1;
                }
            }
        }
        stats
    }

    /// Emits a probe event and reports round-trip acceptance plus loop state.
    pub async fn health_check(&self) -> DispatcherHealth {
        let started = Instant::now();
        let mut payload = Payload::new();
        payload.insert(
            "timestamp".to_string(),
            Value::from(
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
            ),
        );
        let emit_accepted = self
            .emit(
                event_types::DISPATCHER_HEALTH_CHECK,
                payload,
                None,
                EventPriority::Normal,
            )
            .await;
        let response_time = started.elapsed();
        let is_running = self.is_running();
        DispatcherHealth {
            healthy: is_running && emit_accepted && response_time < Duration::from_secs(1),
            is_running,
            emit_accepted,
            response_time,
        }
    }

    async fn run_loop(
        self: Arc<Self>,
        mut receivers: tokio::sync::OwnedMutexGuard<QueueReceivers>,
        cancel: CancellationToken,
    ) {
        info!("event dispatch loop running");
        let idle = Duration::from_millis(self.config.idle_poll_ms.max(1));
        let backoff = Duration::from_millis(self.config.error_backoff_ms.max(1));

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match receivers.next_event() {
                Some(event) => {
                    if let Err(e) = self.handle_event(event).await {
                        self.metrics.lock().unwrap().error_count += 1;
                        error!("dispatch loop error: {e:#}");
                        tokio::time::sleep(backoff).await;
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
            }
        }
        info!("event dispatch loop terminated");
    }

    /// Fans one event out to its subscribers. Distinct subscriber priorities
    /// run as descending waves; subscribers within one wave run concurrently.
    /// Every handler is isolated: an error or panic is logged and counted,
    /// siblings and the loop are unaffected.
    async fn handle_event(&self, event: Event) -> anyhow::Result<()> {
        let started = Instant::now();
        let subscribers = self.subscribers_for(&event.event_type);
        if subscribers.is_empty() {
            debug!(event_type = %event.event_type, "no subscribers for event");
            return Ok(());
        }

        let slow_threshold = Duration::from_millis(self.config.slow_handler_ms);
        let event = Arc::new(event);
        let mut handler_errors = 0u64;
        let mut slow = 0u64;

        let mut wave_start = 0;
        while wave_start < subscribers.len() {
            let wave_priority = subscribers[wave_start].priority;
            let wave_end = subscribers[wave_start..]
                .iter()
                .position(|s| s.priority != wave_priority)
                .map(|offset| wave_start + offset)
                .unwrap_or(subscribers.len());

            let mut tasks: JoinSet<(Option<String>, Duration, anyhow::Result<Value>)> =
                JoinSet::new();
            for subscription in &subscribers[wave_start..wave_end] {
                let event = Arc::clone(&event);
                let handler = Arc::clone(&subscription.handler);
                let owner = subscription.owner_module.clone();
                tasks.spawn(async move {
                    let handler_started = Instant::now();
                    let result = handler.handle_event(&event.event_type, &event.payload).await;
                    (owner, handler_started.elapsed(), result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((owner, elapsed, result)) => {
                        if elapsed > slow_threshold {
                            slow += 1;
                            warn!(
                                event_type = %event.event_type,
                                owner = owner.as_deref().unwrap_or("anonymous"),
                                elapsed_ms = elapsed.as_millis() as u64,
                                "slow event delivery"
                            );
                        }
                        if let Err(e) = result {
                            handler_errors += 1;
                            error!(
                                event_type = %event.event_type,
                                owner = owner.as_deref().unwrap_or("anonymous"),
                                "subscriber handler failed: {e:#}"
                            );
                        }
                    }
                    Err(join_err) => {
                        handler_errors += 1;
                        error!(
                            event_type = %event.event_type,
                            "subscriber task panicked: {join_err}"
                        );
                    }
                }
            }

            wave_start = wave_end;
        }

        if self.config.enable_metrics {
            self.record_delivery(&event.event_type, started.elapsed(), handler_errors, slow);
        }
        Ok(())
    }

    fn record_delivery(&self, event_type: &str, elapsed: Duration, errors: u64, slow: u64) {
        let mut metrics = self.metrics.lock().unwrap();
        metrics.processed_count += 1;
        metrics.total_processing += elapsed;
        metrics.error_count += errors;
        metrics.slow_deliveries += slow;
        let per_type = metrics.by_type.entry(event_type.to_string()).or_default();
        per_type.count += 1;
        per_type.total_time += elapsed;
        per_type.error_count += errors;
        per_type.last_event = Some(SystemTime::now());
    }

    fn subscribers_for(&self, event_type: &str) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .unwrap()
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    fn passes_filters(&self, event: &Event) -> bool {
        let filters = self.filters.read().unwrap();
        filters.iter().all(|filter| filter(event))
    }

    fn push_history(&self, event: Event) {
        if self.config.max_history == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap();
        while history.len() >= self.config.max_history {
            history.pop_front();
        }
        history.push_back(event);
    }

    fn queue_depth(&self, sender: &mpsc::Sender<Event>) -> usize {
        sender.max_capacity() - sender.capacity()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

#[async_trait]
impl EventBus for EventDispatcher {
    fn subscribe(
        &self,
        event_types: &[&str],
        handler: Arc<dyn EventHandler>,
        owner_module: Option<&str>,
        priority: i32,
    ) -> Result<SubscriptionId, SubscribeError> {
        EventDispatcher::subscribe(self, event_types, handler, owner_module, priority)
    }

    fn unsubscribe_module(&self, owner_module: &str) {
        EventDispatcher::unsubscribe_module(self, owner_module)
    }

    async fn emit(
        &self,
        event_type: &str,
        payload: Payload,
        source_module: Option<&str>,
        priority: EventPriority,
    ) -> bool {
        EventDispatcher::emit(self, event_type, payload, source_module, priority).await
    }
}
