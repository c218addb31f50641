//! Per-user event bus feeding the SSE streams
//!
//! Every open stream owns a bounded buffer. Publishing to a full buffer drops
//! its oldest event. Events are delivered best effort: nothing is kept for
//! users without an open stream and nothing survives a disconnect. A user
//! leaves the registry when their last stream closes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, trace};

use crate::metrics::Metrics;

/// Event pushed to the streams of one user
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// SSE event name
    pub kind: String,
    /// JSON-encoded payload
    pub data: String,
}

impl Event {
    /// Encode `body` as the payload of an event named `kind`
    pub fn json(kind: &str, body: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.to_owned(),
            data: serde_json::to_string(body)?,
        })
    }
}

type Registry = Mutex<HashMap<String, Vec<Weak<Subscription>>>>;

/// Receiving end of one SSE connection
pub struct Subscription {
    username: String,
    registry: Weak<Registry>,
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    metrics: Arc<Metrics>,
}

impl Subscription {
    /// Buffer `event`, dropping the oldest one when full
    fn offer(&self, event: Event) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.metrics.sse_dropped_events.inc();
            debug!(username = %self.username, "dropped SSE event from full buffer");
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    /// Wait for the next event, in publication order
    pub async fn next(&self) -> Event {
        loop {
            if let Some(event) = self.queue.lock().ok().and_then(|mut q| q.pop_front()) {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let Ok(mut subscriptions) = registry.lock() else {
            return;
        };
        if let Some(streams) = subscriptions.get_mut(&self.username) {
            streams.retain(|s| s.strong_count() > 0);
            if streams.is_empty() {
                subscriptions.remove(&self.username);
            }
        }
        trace!(username = %self.username, "closed event stream");
    }
}

/// Registry of open streams by username
pub struct EventBus {
    capacity: usize,
    subscriptions: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl EventBus {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            capacity: capacity.max(1),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    /// Open a stream for `username`; it closes when the returned value is dropped
    pub fn subscribe(&self, username: &str) -> Arc<Subscription> {
        let subscription = Arc::new(Subscription {
            username: username.to_owned(),
            registry: Arc::downgrade(&self.subscriptions),
            capacity: self.capacity,
            queue: Mutex::new(VecDeque::with_capacity(self.capacity)),
            notify: Notify::new(),
            metrics: Arc::clone(&self.metrics),
        });
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            let streams = subscriptions.entry(username.to_owned()).or_default();
            streams.retain(|s| s.strong_count() > 0);
            streams.push(Arc::downgrade(&subscription));
            trace!(username, streams = streams.len(), "opened event stream");
        }
        subscription
    }

    /// Deliver `event` to every open stream of `username`
    ///
    /// Returns the number of streams the event was buffered for.
    pub fn publish(&self, username: &str, event: Event) -> usize {
        let live: Vec<Arc<Subscription>> = {
            let Ok(mut subscriptions) = self.subscriptions.lock() else {
                return 0;
            };
            let Some(streams) = subscriptions.get_mut(username) else {
                trace!(username, kind = %event.kind, "no event stream open, dropping event");
                return 0;
            };
            let live: Vec<_> = streams.iter().filter_map(Weak::upgrade).collect();
            if live.is_empty() {
                subscriptions.remove(username);
            } else {
                streams.retain(|s| s.strong_count() > 0);
            }
            live
        };
        for subscription in &live {
            subscription.offer(event.clone());
        }
        live.len()
    }

    /// Serialize `body` and publish it as an event named `kind`
    pub fn push(&self, username: &str, kind: &str, body: &impl Serialize) {
        match Event::json(kind, body) {
            Ok(event) => {
                self.publish(username, event);
            }
            Err(e) => error!(username, kind, error = %e, "failed to serialize event body"),
        }
    }
}
