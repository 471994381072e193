//! Typed event bus for MCPProxy
//!
//! The supervisor, OAuth subsystem and storage layer publish
//! [`ProxyEvent`]s; in-process consumers and the SSE fan-out subscribe.
//! Subscriber buffers are bounded rings: when one fills, the oldest event
//! is dropped so publishers never block.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::trace;

/// Default per-subscriber buffer capacity
pub const DEFAULT_BUFFER: usize = 256;

/// Events published on the bus. Serialized names match the SSE `event:`
/// field the dashboard and tray subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProxyEvent {
    /// The set of servers, or any server's config/state, changed
    #[serde(rename = "servers.changed")]
    ServersChanged,

    /// The config file was reloaded from disk
    #[serde(rename = "config.reloaded")]
    ConfigReloaded,

    /// A server's tool list was re-discovered and committed to the index
    #[serde(rename = "tools.changed")]
    ToolsChanged { server: String, tool_count: usize },

    /// A server needs interactive authorization
    #[serde(rename = "oauth.required")]
    OAuthRequired { server: String },

    /// A token refresh succeeded
    #[serde(rename = "token.refreshed")]
    TokenRefreshed { server: String },

    /// A server's computed health changed
    #[serde(rename = "health.changed")]
    HealthChanged { server: String, level: String },

    /// An activity-log entry was appended
    #[serde(rename = "activity")]
    Activity { entry: Value },
}

impl ProxyEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            ProxyEvent::ServersChanged => "servers.changed",
            ProxyEvent::ConfigReloaded => "config.reloaded",
            ProxyEvent::ToolsChanged { .. } => "tools.changed",
            ProxyEvent::OAuthRequired { .. } => "oauth.required",
            ProxyEvent::TokenRefreshed { .. } => "token.refreshed",
            ProxyEvent::HealthChanged { .. } => "health.changed",
            ProxyEvent::Activity { .. } => "activity",
        }
    }
}

/// An event with its publication metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Monotonic sequence number, bus-wide
    pub seq: u64,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub event: ProxyEvent,
}

struct SubscriberInner {
    buffer: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Receiving half of a subscription
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    /// Receive the next event. Returns `None` only when the bus was shut
    /// down and the buffer drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.inner.buffer.lock().expect("bus poisoned").pop_front() {
                return Some(envelope);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Number of events this subscriber lost to buffer overflow
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// The bus itself. Clone freely; all clones share the subscriber set.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<SubscriberInner>>>>,
    seq: Arc<AtomicU64>,
    default_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER)
    }

    pub fn with_capacity(default_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            seq: Arc::new(AtomicU64::new(0)),
            default_capacity,
        }
    }

    /// Subscribe with the default buffer capacity
    pub fn subscribe(&self) -> Subscriber {
        self.subscribe_with_capacity(self.default_capacity)
    }

    /// Subscribe with an explicit buffer capacity
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscriber {
        let inner = Arc::new(SubscriberInner {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.subscribers
            .lock()
            .expect("bus poisoned")
            .push(inner.clone());
        Subscriber { inner }
    }

    /// Publish an event to every live subscriber. Never blocks: full
    /// buffers drop their oldest entry.
    pub fn publish(&self, event: ProxyEvent) {
        let envelope = Envelope {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event,
        };
        trace!(event = envelope.event.name(), seq = envelope.seq, "publish");

        let mut subscribers = self.subscribers.lock().expect("bus poisoned");
        subscribers.retain(|subscriber| {
            if subscriber.closed.load(Ordering::SeqCst) {
                return false;
            }
            {
                let mut buffer = subscriber.buffer.lock().expect("bus poisoned");
                if buffer.len() >= subscriber.capacity {
                    buffer.pop_front();
                    subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                }
                buffer.push_back(envelope.clone());
            }
            subscriber.notify.notify_one();
            true
        });
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("bus poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(ProxyEvent::ServersChanged);

        let envelope = sub.recv().await.unwrap();
        assert_eq!(envelope.event, ProxyEvent::ServersChanged);
        assert_eq!(envelope.seq, 0);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_oldest() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_with_capacity(2);

        bus.publish(ProxyEvent::ToolsChanged {
            server: "a".into(),
            tool_count: 1,
        });
        bus.publish(ProxyEvent::ToolsChanged {
            server: "b".into(),
            tool_count: 2,
        });
        bus.publish(ProxyEvent::ToolsChanged {
            server: "c".into(),
            tool_count: 3,
        });

        // the oldest ("a") was dropped
        let first = sub.recv().await.unwrap();
        assert_eq!(
            first.event,
            ProxyEvent::ToolsChanged {
                server: "b".into(),
                tool_count: 2
            }
        );
        assert_eq!(sub.dropped(), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.publish(ProxyEvent::ServersChanged);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_names_match_sse_contract() {
        assert_eq!(ProxyEvent::ServersChanged.name(), "servers.changed");
        assert_eq!(ProxyEvent::ConfigReloaded.name(), "config.reloaded");
        assert_eq!(
            ProxyEvent::TokenRefreshed { server: "s".into() }.name(),
            "token.refreshed"
        );
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = ProxyEvent::ToolsChanged {
            server: "gh".into(),
            tool_count: 4,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "tools.changed");
        assert_eq!(value["data"]["server"], "gh");
        assert_eq!(value["data"]["tool_count"], 4);
    }
}
