//! Typed fan-out bus for daemon events.
//!
//! Subscribers get a bounded queue each. Publishing snapshots the subscriber
//! list under a short lock and enqueues without blocking; a subscriber whose
//! queue is full is evicted rather than allowed to stall the publisher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Per-subscriber queue depth before eviction.
const SUBSCRIBER_QUEUE: usize = 256;
/// Idle interval after which a heartbeat ping is broadcast.
const HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventKind {
    Connected {
        server_id: String,
        name: String,
        socks_port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Disconnected {
        server_id: String,
        reason: String,
    },
    Reconnecting {
        server_id: String,
        attempt: u32,
        next_retry_ms: u64,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
        message: String,
    },
    Stats {
        server_id: String,
        uptime: u64,
        bytes_in: u64,
        bytes_out: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
    },
    Ping {},
    ServerAdded {
        server_id: String,
        name: String,
    },
    ServerDeleted {
        server_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

struct BusInner {
    subscribers: Vec<Subscriber>,
    last_publish: Instant,
}

pub struct EventBus {
    inner: Mutex<BusInner>,
    next_id: AtomicU64,
}

/// Receiving half handed to a subscriber; drop (or let the WS task end) and
/// the next publish cleans the sender side up.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let bus = Arc::new(Self {
            inner: Mutex::new(BusInner {
                subscribers: Vec::new(),
                last_publish: Instant::now(),
            }),
            next_id: AtomicU64::new(1),
        });
        bus.clone().spawn_heartbeat();
        bus
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.push(Subscriber { id, tx });
        debug!("event subscriber {id} attached ({} total)", inner.subscribers.len());
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|s| s.id != id);
    }

    /// Deliver to every subscriber without ever blocking the publisher.
    pub fn publish(&self, kind: EventKind) {
        let event = Event::now(kind);

        let targets: Vec<(u64, mpsc::Sender<Event>)> = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_publish = Instant::now();
            inner
                .subscribers
                .iter()
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };

        let mut evicted = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("evicting slow consumer {id}: queue full");
                    evicted.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(id),
            }
        }

        if !evicted.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.retain(|s| !evicted.contains(&s.id));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    fn spawn_heartbeat(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let needs_ping = {
                    let inner = self.inner.lock().unwrap();
                    !inner.subscribers.is_empty()
                        && inner.last_publish.elapsed() >= HEARTBEAT
                };
                if needs_ping {
                    self.publish(EventKind::Ping {});
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        for i in 0..5u16 {
            bus.publish(EventKind::Connected {
                server_id: format!("s{i}"),
                name: "n".into(),
                socks_port: 1080 + i,
                source: None,
            });
        }

        for i in 0..5u16 {
            let ev = sub.rx.recv().await.unwrap();
            match ev.kind {
                EventKind::Connected { socks_port, .. } => assert_eq!(socks_port, 1080 + i),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_not_blocked() {
        let bus = EventBus::new();
        let _sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        // Never drained: overflow the bounded queue.
        for _ in 0..(SUBSCRIBER_QUEUE + 10) {
            bus.publish(EventKind::Ping {});
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_detaches() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_reaped_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        drop(sub.rx);
        bus.publish(EventKind::Ping {});
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_json_shape_matches_wire_format() {
        let ev = Event::now(EventKind::Disconnected {
            server_id: "s1".into(),
            reason: "remote_closed".into(),
        });
        let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        assert_eq!(v["event"], "disconnected");
        assert_eq!(v["serverId"], "s1");
        assert_eq!(v["reason"], "remote_closed");
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn reconnecting_event_carries_backoff_fields() {
        let ev = Event::now(EventKind::Reconnecting {
            server_id: "s1".into(),
            attempt: 1,
            next_retry_ms: 1000,
        });
        let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
        assert_eq!(v["event"], "reconnecting");
        assert_eq!(v["attempt"], 1);
        assert_eq!(v["nextRetryMs"], 1000);
    }
}
