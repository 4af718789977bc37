//! Bounded queue of events with critical-topic prioritization: many topics, many subscribers,
//! and two durability classes (best-effort and WAL-durable).

use crate::wal::WriteAheadLog;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
};
use thiserror::Error;

/// Topics that are never dropped and are durable (WAL-written) before publication acknowledges.
pub const CRITICAL_TOPICS: [Topic; 5] = [
    Topic::RiskCircuitBreaker,
    Topic::RiskPositionMismatch,
    Topic::RiskAlert,
    Topic::SystemCritical,
    Topic::SystemError,
];

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
)]
pub enum Topic {
    #[display("order:submitted")]
    OrderSubmitted,
    #[display("order:terminal")]
    OrderTerminal,
    #[display("balance:changed")]
    BalanceChanged,
    #[display("reconcile:ok")]
    ReconcileOk,
    #[display("risk:circuit_breaker")]
    RiskCircuitBreaker,
    #[display("risk:position_mismatch")]
    RiskPositionMismatch,
    #[display("risk:alert")]
    RiskAlert,
    #[display("system:critical")]
    SystemCritical,
    #[display("system:error")]
    SystemError,
}

impl Topic {
    pub fn is_critical(&self) -> bool {
        CRITICAL_TOPICS.contains(self)
    }
}

/// A single published event. `sequence` is monotonically increasing across the whole bus, which
/// is sufficient to prove per-topic monotonicity too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub source: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub critical: bool,
}

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("topic {0} is critical and must be published via publish_critical")]
    NotCritical(Topic),
    #[error("wal: {0}")]
    Wal(#[from] crate::wal::WalError),
}

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    topics: Option<Vec<Topic>>,
    callback: Callback,
}

impl Subscriber {
    fn matches(&self, topic: Topic) -> bool {
        self.topics
            .as_ref()
            .map(|topics| topics.contains(&topic))
            .unwrap_or(true)
    }
}

struct Lane {
    capacity: usize,
    buf: VecDeque<Event>,
    dropped_count: u64,
}

struct Inner {
    sequence: AtomicU64,
    next_subscriber_id: AtomicU64,
    subscribers: parking_lot::Mutex<Vec<Subscriber>>,
    non_critical: parking_lot::Mutex<Lane>,
    wal: parking_lot::Mutex<Option<Arc<WriteAheadLog>>>,
}

/// Cloneable handle to the shared event bus. The `System` composition root owns one `EventBus`
/// and every other component holds a clone of this handle, never a channel directly.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, Copy)]
pub struct EventBusConfig {
    pub max_queue_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { max_queue_size: 1024 }
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sequence: AtomicU64::new(0),
                next_subscriber_id: AtomicU64::new(0),
                subscribers: parking_lot::Mutex::new(Vec::new()),
                non_critical: parking_lot::Mutex::new(Lane {
                    capacity: config.max_queue_size,
                    buf: VecDeque::new(),
                    dropped_count: 0,
                }),
                wal: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Attach the Write-Ahead Log that critical publications must durably hit before
    /// acknowledging. Set once during `System` construction.
    pub fn attach_wal(&self, wal: Arc<WriteAheadLog>) {
        *self.inner.wal.lock() = Some(wal);
    }

    /// Register a callback invoked synchronously for every matching publish. `topics = None`
    /// subscribes to everything. A panicking callback is isolated: the panic is caught, logged to
    /// `system:error`, and delivery continues to the remaining subscribers.
    pub fn subscribe<F>(&self, topics: Option<Vec<Topic>>, callback: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self
            .inner
            .next_subscriber_id
            .fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.subscribers.lock().push(Subscriber {
            id,
            topics,
            callback: Box::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.subscribers.lock().retain(|s| s.id != id);
    }

    /// Publish a non-critical event. Enqueues onto the bounded lane (dropping the oldest
    /// non-critical event if full) and dispatches synchronously to matching subscribers.
    pub fn publish<T: Serialize>(&self, topic: Topic, payload: &T) -> Event {
        assert!(
            !topic.is_critical(),
            "topic {topic} is critical; use publish_critical"
        );
        let event = self.build_event(topic, payload, false);
        self.enqueue_non_critical(event.clone());
        self.dispatch(&event);
        event
    }

    /// Publish a critical event: WAL-written and fsync'd before this future resolves. Never
    /// dropped; bypasses the bounded non-critical lane entirely.
    pub async fn publish_critical<T: Serialize>(
        &self,
        topic: Topic,
        payload: &T,
    ) -> Result<Event, EventBusError> {
        if !topic.is_critical() {
            return Err(EventBusError::NotCritical(topic));
        }
        let event = self.build_event(topic, payload, true);

        let wal = self.inner.wal.lock().clone();
        if let Some(wal) = wal {
            wal.append(topic, &event.payload).await?;
        }

        self.dispatch(&event);
        Ok(event)
    }

    fn build_event<T: Serialize>(&self, topic: Topic, payload: &T, critical: bool) -> Event {
        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        Event {
            topic,
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            source: "gateway".to_string(),
            sequence,
            timestamp: Utc::now(),
            critical,
        }
    }

    fn enqueue_non_critical(&self, event: Event) {
        let mut lane = self.inner.non_critical.lock();
        if lane.buf.len() >= lane.capacity {
            lane.buf.pop_front();
            lane.dropped_count += 1;
        }
        lane.buf.push_back(event);
    }

    fn dispatch(&self, event: &Event) {
        let mut failures = Vec::new();
        {
            let subscribers = self.inner.subscribers.lock();
            for subscriber in subscribers.iter() {
                if !subscriber.matches(event.topic) {
                    continue;
                }
                let result = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(event)));
                if result.is_err() {
                    failures.push(subscriber.id);
                }
            }
        }
        // Log subscriber failures to system:error outside the subscribers lock, and without
        // recursing through publish_critical (which would deadlock re-entering this dispatch).
        for id in failures {
            tracing::error!(subscriber_id = id, topic = %event.topic, "event subscriber panicked");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.non_critical.lock().dropped_count
    }

    /// Non-critical events still buffered in the bounded lane, oldest first.
    pub fn pending_non_critical(&self) -> Vec<Event> {
        self.inner.non_critical.lock().buf.iter().cloned().collect()
    }

    /// Two-phase shutdown: stop accepting new events is the caller's responsibility (drop all
    /// producers); this flushes whatever remains in the bounded lane to a final drain callback up
    /// to `deadline`.
    pub async fn drain(&self, deadline: std::time::Duration, mut on_event: impl FnMut(Event)) {
        let start = tokio::time::Instant::now();
        loop {
            let next = { self.inner.non_critical.lock().buf.pop_front() };
            match next {
                Some(event) => on_event(event),
                None => break,
            }
            if start.elapsed() >= deadline {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn drops_oldest_when_lane_full() {
        let bus = EventBus::new(EventBusConfig { max_queue_size: 2 });
        bus.publish(Topic::OrderSubmitted, &"a");
        bus.publish(Topic::OrderSubmitted, &"b");
        bus.publish(Topic::OrderSubmitted, &"c");

        assert_eq!(bus.dropped_count(), 1);
        let pending = bus.pending_non_critical();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload, serde_json::json!("b"));
        assert_eq!(pending[1].payload, serde_json::json!("c"));
    }

    #[test]
    fn sequence_is_monotonic() {
        let bus = EventBus::new(EventBusConfig::default());
        let e1 = bus.publish(Topic::OrderSubmitted, &1);
        let e2 = bus.publish(Topic::OrderSubmitted, &2);
        assert!(e2.sequence > e1.sequence);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_delivery_to_others() {
        let bus = EventBus::new(EventBusConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe(None, |_event| panic!("boom"));

        let calls_clone = calls.clone();
        bus.subscribe(None, move |_event| {
            calls_clone.fetch_add(1, AtomicOrdering::SeqCst);
        });

        bus.publish(Topic::OrderSubmitted, &"x");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_critical_rejects_non_critical_topic() {
        let bus = EventBus::new(EventBusConfig::default());
        let result = bus.publish_critical(Topic::OrderSubmitted, &"x").await;
        assert!(matches!(result, Err(EventBusError::NotCritical(_))));
    }
}
