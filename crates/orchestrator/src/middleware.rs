//! Handler wrappers and stock event filters.
//!
//! Wrappers compose around any [`EventHandler`] without the dispatcher
//! knowing about them; filters plug into
//! [`EventDispatcher::add_filter`](crate::EventDispatcher::add_filter).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use runtime_types::{Event, EventHandler, Payload};

use crate::dispatcher::EventFilter;

/// Logs a warning when the wrapped handler exceeds `threshold`.
pub struct Timed {
    inner: Arc<dyn EventHandler>,
    threshold: Duration,
    label: String,
}

impl Timed {
    pub fn new(inner: Arc<dyn EventHandler>, threshold: Duration, label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            threshold,
            label: label.into(),
        })
    }
}

#[async_trait]
impl EventHandler for Timed {
    async fn handle_event(&self, event_type: &str, payload: &Payload) -> anyhow::Result<Value> {
        let started = Instant::now();
        let result = self.inner.handle_event(event_type, payload).await;
        let elapsed = started.elapsed();
        if elapsed > self.threshold {
            warn!(
                handler = %self.label,
                event_type,
                elapsed_ms = elapsed.as_millis() as u64,
                "handler exceeded time threshold"
            );
        }
        result
    }
}

/// Caps how often the wrapped handler runs. Calls beyond `max_calls` within
/// any one-second window are skipped, not queued.
pub struct RateLimited {
    inner: Arc<dyn EventHandler>,
    max_calls: u32,
    state: Mutex<RateWindow>,
}

struct RateWindow {
    window_start: Instant,
    calls: u32,
}

impl RateLimited {
    pub fn new(inner: Arc<dyn EventHandler>, max_calls: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            max_calls,
            state: Mutex::new(RateWindow {
                window_start: Instant::now(),
                calls: 0,
            }),
        })
    }

    fn permit(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.window_start.elapsed() >= Duration::from_secs(1) {
            state.window_start = Instant::now();
            state.calls = 0;
        }
        if state.calls < self.max_calls {
            state.calls += 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl EventHandler for RateLimited {
    async fn handle_event(&self, event_type: &str, payload: &Payload) -> anyhow::Result<Value> {
        if !self.permit() {
            debug!(event_type, "rate limit exceeded, skipping handler call");
            return Ok(Value::Null);
        }
        self.inner.handle_event(event_type, payload).await
    }
}

/// Filter that caps the per-type emit rate. Events of a type that already hit
/// `max_per_second` within the current one-second window are rejected.
pub fn rate_limit_filter(max_per_second: u32) -> EventFilter {
    let windows: Mutex<HashMap<String, RateWindow>> = Mutex::new(HashMap::new());
    Arc::new(move |event: &Event| {
        let mut windows = windows.lock().unwrap();
        let window = windows
            .entry(event.event_type.clone())
            .or_insert_with(|| RateWindow {
                window_start: Instant::now(),
                calls: 0,
            });
        if window.window_start.elapsed() >= Duration::from_secs(1) {
            window.window_start = Instant::now();
            window.calls = 0;
        }
        if window.calls < max_per_second {
            window.calls += 1;
            true
        } else {
            debug!(event_type = %event.event_type, "event rate limit exceeded");
            false
        }
    })
}

/// Filter that rejects an event when the same type from the same source was
/// already seen within `window`.
pub fn duplicate_filter(window: Duration) -> EventFilter {
    let seen: Mutex<HashMap<String, Instant>> = Mutex::new(HashMap::new());
    Arc::new(move |event: &Event| {
        let key = format!(
            "{}:{}",
            event.event_type,
            event.source_module.as_deref().unwrap_or("-")
        );
        let mut seen = seen.lock().unwrap();
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < window);
        if seen.contains_key(&key) {
            debug!(event_type = %event.event_type, "duplicate event suppressed");
            false
        } else {
            seen.insert(key, now);
            true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_types::{handler_fn, EventPriority};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_handler(counter: Arc<AtomicU32>) -> Arc<dyn EventHandler> {
        handler_fn(move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    }

    #[tokio::test]
    async fn test_timed_passes_results_through() {
        let handler = Timed::new(
            handler_fn(|_, _| async { Ok(json!("done")) }),
            Duration::from_millis(100),
            "test",
        );
        let result = handler.handle_event("x", &Payload::new()).await.unwrap();
        assert_eq!(result, json!("done"));
    }

    #[tokio::test]
    async fn test_rate_limited_skips_excess_calls() {
        let counter = Arc::new(AtomicU32::new(0));
        let handler = RateLimited::new(counting_handler(Arc::clone(&counter)), 2);

        for _ in 0..5 {
            handler.handle_event("x", &Payload::new()).await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rate_limit_filter_caps_per_type() {
        let filter = rate_limit_filter(2);
        let tick = Event::new("tick", Payload::new(), None, EventPriority::Normal);
        let other = Event::new("other", Payload::new(), None, EventPriority::Normal);

        assert!(filter(&tick));
        assert!(filter(&tick));
        assert!(!filter(&tick));
        // Limits are tracked per event type
        assert!(filter(&other));
    }

    #[test]
    fn test_duplicate_filter_keys_on_type_and_source() {
        let filter = duplicate_filter(Duration::from_secs(60));
        let first = Event::new("x", Payload::new(), Some("a".into()), EventPriority::Normal);
        let repeat = Event::new("x", Payload::new(), Some("a".into()), EventPriority::Normal);
        let other_source = Event::new("x", Payload::new(), Some("b".into()), EventPriority::Normal);
        let other_type = Event::new("y", Payload::new(), Some("a".into()), EventPriority::Normal);

        assert!(filter(&first));
        assert!(!filter(&repeat));
        assert!(filter(&other_source));
        assert!(filter(&other_type));
    }
}
