use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// One record in a job's event log. `id` is strictly monotonic starting at 1.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: u64,
    pub name: &'static str,
    pub data: Value,
}

/// A subscription: the buffered backlog the caller missed, plus a live
/// channel for everything emitted after the snapshot was taken. Keeping the
/// snapshot-then-subscribe sequence atomic under one lock (see `subscribe`)
/// is what makes replay + live delivery gap-free.
pub struct Subscription {
    pub replay: Vec<Event>,
    pub live: broadcast::Receiver<Event>,
}

struct Inner {
    next_id: u64,
    ring: VecDeque<Event>,
    capacity: usize,
    closed: bool,
    // `None` once closed. Dropping the one and only `Sender` is what wakes
    // every live receiver with a closed-channel error, independent of
    // whatever ordering `close()` happens to run in relative to the last
    // emit — see `close()`.
    sender: Option<broadcast::Sender<Event>>,
}

/// Per-job append-only event log with a bounded ring buffer and
/// multi-subscriber fan-out. One instance per job; replaced (not reused) on
/// retry per spec §4.6 — reconnecting clients of a discarded bus only ever
/// see events from the bus that replaces it.
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl EventBus {
    pub fn new(ring_buffer_size: usize) -> Self {
        // Capacity chosen generously: broadcast only needs to hold events
        // between an emit and the slowest subscriber's next poll, not the
        // full backlog (that's the ring buffer's job).
        let (sender, _) = broadcast::channel(ring_buffer_size.max(16));
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ring: VecDeque::with_capacity(ring_buffer_size),
                capacity: ring_buffer_size.max(1),
                closed: false,
                sender: Some(sender),
            }),
        }
    }

    /// Assigns the next id, appends to the ring buffer (evicting the oldest
    /// on overflow), and broadcasts to live subscribers. Returns an error if
    /// the bus has already been closed. The broadcast send happens while
    /// still holding the lock so a concurrent `subscribe` can never land
    /// between the ring-buffer append and the fan-out — otherwise that
    /// subscriber could capture the event in its replay snapshot and then
    /// receive it again on the live channel.
    pub fn emit(&self, name: &'static str, data: Value) -> Result<u64, BusClosed> {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return Err(BusClosed);
        }
        let id = guard.next_id;
        guard.next_id += 1;
        let event = Event { id, name, data };
        if guard.ring.len() == guard.capacity {
            guard.ring.pop_front();
        }
        guard.ring.push_back(event.clone());
        // A broadcast send fails only when there are zero active receivers,
        // which is a normal and harmless state (no one is subscribed yet).
        // `sender` is always `Some` here since `closed` was just checked.
        let _ = guard.sender.as_ref().unwrap().send(event);
        Ok(id)
    }

    /// Atomically captures the buffered backlog after `after_id` (or the
    /// whole buffer if absent) and a receiver for everything emitted from
    /// this instant on. If `after_id` predates the oldest buffered event,
    /// replay starts from the oldest available record — the gap before it
    /// is unrecoverable and callers must tolerate it. If the bus is already
    /// closed, the returned receiver observes the closed signal immediately
    /// once polled, after the replay is exhausted.
    pub fn subscribe(&self, after_id: Option<u64>) -> Subscription {
        let guard = self.inner.lock().unwrap();
        let replay: Vec<Event> = match after_id {
            Some(after) => guard
                .ring
                .iter()
                .filter(|event| event.id > after)
                .cloned()
                .collect(),
            None => guard.ring.iter().cloned().collect(),
        };
        let live = match &guard.sender {
            Some(sender) => sender.subscribe(),
            None => closed_receiver(),
        };
        Subscription { replay, live }
    }

    /// Marks the bus terminated. Subsequent `emit` calls are rejected, and
    /// dropping the sender here (rather than only on `Drop` of the whole
    /// `EventBus`) is what signals every currently live receiver per §4.4 —
    /// a `broadcast::Receiver` observes its channel as closed as soon as
    /// the last `Sender` is gone, and this is the last one. Subsequent
    /// `subscribe` calls still replay the buffer but get a receiver that is
    /// already closed.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        guard.sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

/// A receiver bound to a channel whose only sender is already dropped, so
/// the first `recv()` on it resolves immediately with a closed-channel
/// error. Handed to subscribers that connect after `close()`.
fn closed_receiver() -> broadcast::Receiver<Event> {
    let (sender, receiver) = broadcast::channel(1);
    drop(sender);
    receiver
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("event bus is closed")]
pub struct BusClosed;

/// Process-wide singleton mapping job id -> its current `EventBus`. Retry
/// replaces a job's entry with a fresh bus rather than reusing the closed
/// one (spec §4.6): reconnecting clients after a retry only ever see events
/// from the bus that replaces it.
pub struct EventBusRegistry {
    buses: Mutex<HashMap<String, Arc<EventBus>>>,
    ring_buffer_size: usize,
}

impl EventBusRegistry {
    pub fn new(ring_buffer_size: usize) -> Self {
        Self {
            buses: Mutex::new(HashMap::new()),
            ring_buffer_size,
        }
    }

    /// Creates a fresh bus for `job_id`, replacing any existing one.
    pub fn open(&self, job_id: &str) -> Arc<EventBus> {
        let bus = Arc::new(EventBus::new(self.ring_buffer_size));
        self.buses
            .lock()
            .unwrap()
            .insert(job_id.to_string(), bus.clone());
        bus
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<EventBus>> {
        self.buses.lock().unwrap().get(job_id).cloned()
    }

    pub fn remove(&self, job_id: &str) {
        self.buses.lock().unwrap().remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emit_assigns_strictly_increasing_ids_starting_at_one() {
        let bus = EventBus::new(200);
        let id1 = bus.emit("job.started", json!({})).unwrap();
        let id2 = bus.emit("page.completed", json!({})).unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
    }

    #[test]
    fn subscribe_with_no_after_id_replays_everything_buffered() {
        let bus = EventBus::new(200);
        bus.emit("a", json!(1)).unwrap();
        bus.emit("b", json!(2)).unwrap();
        let sub = bus.subscribe(None);
        assert_eq!(sub.replay.len(), 2);
        assert_eq!(sub.replay[0].id, 1);
        assert_eq!(sub.replay[1].id, 2);
    }

    #[test]
    fn subscribe_after_id_returns_only_newer_events() {
        let bus = EventBus::new(200);
        bus.emit("a", json!(1)).unwrap();
        bus.emit("b", json!(2)).unwrap();
        bus.emit("c", json!(3)).unwrap();
        let sub = bus.subscribe(Some(1));
        let ids: Vec<u64> = sub.replay.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn ring_buffer_evicts_oldest_on_overflow() {
        let bus = EventBus::new(2);
        bus.emit("a", json!(1)).unwrap();
        bus.emit("b", json!(2)).unwrap();
        bus.emit("c", json!(3)).unwrap();
        let sub = bus.subscribe(None);
        let ids: Vec<u64> = sub.replay.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn subscribe_with_after_id_older_than_oldest_buffered_replays_from_oldest() {
        let bus = EventBus::new(2);
        bus.emit("a", json!(1)).unwrap();
        bus.emit("b", json!(2)).unwrap();
        bus.emit("c", json!(3)).unwrap();
        // event 1 has been evicted; after_id=1 should still yield 2,3 not error.
        let sub = bus.subscribe(Some(1));
        let ids: Vec<u64> = sub.replay.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn closed_bus_rejects_emit() {
        let bus = EventBus::new(200);
        bus.close();
        assert!(bus.emit("x", json!({})).is_err());
    }

    #[tokio::test]
    async fn live_subscriber_receives_events_emitted_after_subscribe() {
        let bus = EventBus::new(200);
        let mut sub = bus.subscribe(None);
        bus.emit("a", json!(1)).unwrap();
        let event = sub.live.recv().await.unwrap();
        assert_eq!(event.id, 1);
    }

    #[tokio::test]
    async fn close_signals_live_subscribers() {
        let bus = EventBus::new(200);
        let sub = bus.subscribe(None);
        bus.close();
        let mut live = sub.live;
        let result = live.recv().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn subscribe_after_close_yields_an_already_closed_receiver() {
        let bus = EventBus::new(200);
        bus.emit("a", json!(1)).unwrap();
        bus.close();
        let mut sub = bus.subscribe(None);
        assert_eq!(sub.replay.len(), 1);
        assert!(sub.live.recv().await.is_err());
    }

    #[tokio::test]
    async fn emit_and_subscribe_never_interleave_a_duplicate_delivery() {
        // A subscriber that snapshots mid-emit must not see the same event
        // in both its replay and its live channel (spec §8: "a subscriber
        // that never disconnects sees every emitted event exactly once").
        let bus = Arc::new(EventBus::new(200));
        let mut sub = bus.subscribe(None);
        bus.emit("a", json!(1)).unwrap();
        let live_event = sub.live.recv().await.unwrap();
        assert_eq!(live_event.id, 1);
        assert!(sub.replay.is_empty());
    }
}
