// ===============================
// src/stream/bus.rs
// ===============================
//
// In-process fan-out. Per key (symbol, exchange, mode) one broadcast
// channel, so any number of consumers share a single broker connection.
// Plus a firehose with every event and an account-level order-update feed.
//
use std::sync::Mutex;

use ahash::AHashMap as HashMap;
use tokio::sync::broadcast;

use crate::domain::{OrderUpdate, StreamEvent, SubscriptionKey};
use crate::metrics::STREAM_EVENTS;

pub struct EventBus {
    broker: String,
    capacity: usize,
    keyed: Mutex<HashMap<SubscriptionKey, broadcast::Sender<StreamEvent>>>,
    firehose: broadcast::Sender<StreamEvent>,
    order_updates: broadcast::Sender<OrderUpdate>,
}

impl EventBus {
    pub fn new(broker: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (firehose, _) = broadcast::channel(capacity);
        let (order_updates, _) = broadcast::channel(capacity);
        Self { broker: broker.to_string(), capacity, keyed: Mutex::new(HashMap::new()), firehose, order_updates }
    }

    fn keyed(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionKey, broadcast::Sender<StreamEvent>>> {
        self.keyed.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Receiver for one key. Valid before, during and after the broker
    /// subscription; it simply sees nothing while the key is not tracked.
    pub fn subscribe(&self, key: &SubscriptionKey) -> broadcast::Receiver<StreamEvent> {
        self.keyed()
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn firehose(&self) -> broadcast::Receiver<StreamEvent> {
        self.firehose.subscribe()
    }

    pub fn order_updates(&self) -> broadcast::Receiver<OrderUpdate> {
        self.order_updates.subscribe()
    }

    /// Drops the channel for `key` if nobody listens any more.
    pub fn prune(&self, key: &SubscriptionKey) {
        let mut keyed = self.keyed();
        if keyed.get(key).is_some_and(|tx| tx.receiver_count() == 0) {
            keyed.remove(key);
        }
    }

    pub fn publish(&self, event: StreamEvent) {
        let kind = match &event {
            StreamEvent::Ltp(_) => "ltp",
            StreamEvent::Quote(_) => "quote",
            StreamEvent::Depth(_) => "depth",
            StreamEvent::OrderUpdate(_) => "order_update",
        };
        STREAM_EVENTS.with_label_values(&[self.broker.as_str(), kind]).inc();

        match &event {
            StreamEvent::OrderUpdate(u) => {
                let _ = self.order_updates.send(u.clone());
            }
            other => {
                if let Some(key) = other.key() {
                    if let Some(tx) = self.keyed().get(&key) {
                        // no receivers is fine
                        let _ = tx.send(other.clone());
                    }
                }
            }
        }
        let _ = self.firehose.send(event);
    }
}
