// Event Bus
// In-memory pub/sub with a bounded ring of recent events for catch-up

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 2048;
const RECENT_CAPACITY: usize = 1000;
const CATCH_UP_COUNT: usize = 50;

/// Broadcast event kinds, named as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run:created")]
    RunCreated,
    #[serde(rename = "run:updated")]
    RunUpdated,
    #[serde(rename = "run:completed")]
    RunCompleted,
    #[serde(rename = "run:failed")]
    RunFailed,
    #[serde(rename = "task:updated")]
    TaskUpdated,
    #[serde(rename = "worker:created")]
    WorkerCreated,
    #[serde(rename = "worker:updated")]
    WorkerUpdated,
    #[serde(rename = "worker:log")]
    WorkerLog,
    #[serde(rename = "judgement:created")]
    JudgementCreated,
    #[serde(rename = "log")]
    Log,
}

/// A broadcast record
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Shared pub/sub handle. Cloning is cheap; all clones feed the same ring
/// and channel.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    tx: broadcast::Sender<Event>,
    recent: StdMutex<VecDeque<Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(EventBusInner {
                tx,
                recent: StdMutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            }),
        }
    }

    /// Append to the recent ring and fan out to every current subscriber.
    pub fn emit(&self, kind: EventKind, payload: Value) {
        let event = Event {
            kind,
            payload,
            timestamp: chrono::Utc::now(),
        };

        // The ring lock is held across the send so a concurrent subscribe
        // cannot observe the event in both its backlog and its receiver.
        match self.inner.recent.lock() {
            Ok(mut recent) => {
                if recent.len() == RECENT_CAPACITY {
                    recent.pop_front();
                }
                recent.push_back(event.clone());
                let _ = self.inner.tx.send(event);
            }
            Err(_) => {
                tracing::error!("Event ring lock poisoned; emitting without catch-up record");
                let _ = self.inner.tx.send(event);
            }
        }
    }

    /// Register a subscriber. The stream yields up to the last 50 events as
    /// a catch-up prelude, then every subsequent emission in publication
    /// order. Unsubscribing is dropping the stream.
    pub fn subscribe(&self) -> EventStream {
        match self.inner.recent.lock() {
            Ok(recent) => {
                let rx = self.inner.tx.subscribe();
                let skip = recent.len().saturating_sub(CATCH_UP_COUNT);
                let backlog = recent.iter().skip(skip).cloned().collect();
                EventStream { backlog, rx }
            }
            Err(_) => {
                tracing::error!("Event ring lock poisoned; subscribing without catch-up");
                EventStream {
                    backlog: VecDeque::new(),
                    rx: self.inner.tx.subscribe(),
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's view of the bus: catch-up backlog first, then live events.
pub struct EventStream {
    backlog: VecDeque<Event>,
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Next event in order. `None` once the bus has been dropped. A slow
    /// subscriber that falls behind the channel skips the overwritten
    /// events rather than blocking the bus.
    pub async fn next(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event subscriber lagged by {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `next`.
    pub fn try_next(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Event subscriber lagged by {} events", skipped);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_catch_up_prelude_is_bounded() {
        let bus = EventBus::new();
        for i in 0..60 {
            bus.emit(EventKind::Log, json!({ "seq": i }));
        }

        let mut stream = bus.subscribe();
        let mut seen = Vec::new();
        while let Some(event) = stream.try_next() {
            seen.push(event.payload["seq"].as_u64().unwrap());
        }

        assert_eq!(seen.len(), 50);
        assert_eq!(seen.first(), Some(&10));
        assert_eq!(seen.last(), Some(&59));
    }

    #[tokio::test]
    async fn test_live_events_arrive_in_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        bus.emit(EventKind::RunCreated, json!({ "seq": 0 }));
        bus.emit(EventKind::RunUpdated, json!({ "seq": 1 }));

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.kind, EventKind::RunCreated);
        assert_eq!(second.kind, EventKind::RunUpdated);
        assert_eq!(second.payload["seq"], 1);
    }

    #[tokio::test]
    async fn test_ring_evicts_oldest() {
        let bus = EventBus::new();
        for i in 0..1100u64 {
            bus.emit(EventKind::Log, json!({ "seq": i }));
        }

        let mut stream = bus.subscribe();
        let first = stream.try_next().unwrap();
        // ring holds the last 1000; catch-up is the last 50 of those
        assert_eq!(first.payload["seq"], 1050);
    }

    #[test]
    fn test_wire_names() {
        let kind = serde_json::to_string(&EventKind::JudgementCreated).unwrap();
        assert_eq!(kind, "\"judgement:created\"");
        let kind = serde_json::to_string(&EventKind::RunCompleted).unwrap();
        assert_eq!(kind, "\"run:completed\"");
    }
}
