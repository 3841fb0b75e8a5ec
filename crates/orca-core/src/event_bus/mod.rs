//! Event Bus: in-process pub/sub used to notify local listeners (the
//! webhook-adjacent status endpoint, log tailers) of state changes without
//! coupling them to the scheduler's internals.
//!
//! Delivery is best-effort and non-blocking: a slow or dropped subscriber
//! never blocks the publisher, and publishing never returns an error for a
//! topic with no subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

/// Canonical topic names (§4.H). Not an enum: subscribers and publishers
/// both just pass `&str`, same as the wire-level topics they mirror.
pub mod topics {
    pub const TASK_UPDATED: &str = "task:updated";
    pub const INVOCATION_STARTED: &str = "invocation:started";
    pub const INVOCATION_COMPLETED: &str = "invocation:completed";
    pub const STATUS_UPDATED: &str = "status:updated";
}

#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: impl Serialize) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self { topic: topic.into(), payload }
    }
}

pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<String, Vec<(u64, Subscriber)>>,
}

/// A handle returned on subscribe; dropping it does not unsubscribe, call
/// [`EventBus::unsubscribe`] explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default, Clone)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `topic`. Returns an id for later
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, topic: impl Into<String>, handler: Subscriber) -> SubscriptionId {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.entry(topic.into()).or_default().push((id, handler));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = registry.subscribers.get_mut(topic) {
            subs.retain(|(sub_id, _)| *sub_id != id.0);
        }
    }

    /// Fan out `event` to every subscriber of `event.topic`. A handler that
    /// panics is caught and logged so it cannot take down the publisher or
    /// later subscribers in the same fan-out.
    pub fn publish(&self, event: Event) {
        let handlers: Vec<Subscriber> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            match registry.subscribers.get(&event.topic) {
                Some(subs) => subs.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };

        for handler in handlers {
            let event_ref = &event;
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event_ref))) {
                tracing::error!(topic = %event.topic, ?panic, "event bus subscriber panicked");
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.subscribers.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}
