//! In-memory pub/sub room: at most one producer, many consumers, with
//! init-segment replay for late joiners (spec §4.5).
//!
//! Locking discipline: both `join()` and `broadcast()` take `inner`'s lock
//! for their whole critical section, which is entirely synchronous (no
//! `.await` while held). That guarantees a newly joined consumer's first
//! queued message is the cached init segment, and that no broadcast can be
//! interleaved between a consumer's registration and its init-segment send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

#[derive(Clone)]
struct ConsumerHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

struct RoomInner {
    consumers: Vec<ConsumerHandle>,
    init_segment: Option<Bytes>,
    bytes_sent: u64,
    last_data_time: Option<DateTime<Utc>>,
}

struct ProducerSlot {
    generation: u64,
    displace_tx: oneshot::Sender<()>,
}

/// Relay state for a single `stream_key`.
pub struct Room {
    inner: Mutex<RoomInner>,
    producer: Mutex<Option<ProducerSlot>>,
    next_consumer_id: AtomicU64,
    next_generation: AtomicU64,
}

impl Room {
    fn new() -> Self {
        Room {
            inner: Mutex::new(RoomInner {
                consumers: Vec::new(),
                init_segment: None,
                bytes_sent: 0,
                last_data_time: None,
            }),
            producer: Mutex::new(None),
            next_consumer_id: AtomicU64::new(0),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Register a new producer, displacing and closing any existing one.
    /// Returns this producer's generation and a receiver that fires when a
    /// later producer displaces it.
    pub fn register_producer(&self) -> (u64, oneshot::Receiver<()>) {
        let mut slot = self.producer.lock();
        if let Some(old) = slot.take() {
            let _ = old.displace_tx.send(());
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        *slot = Some(ProducerSlot {
            generation,
            displace_tx: tx,
        });
        (generation, rx)
    }

    /// Clear the producer slot, but only if `generation` is still current
    /// (a displaced producer must not clobber its successor's slot).
    pub fn clear_producer_if_current(&self, generation: u64) {
        let mut slot = self.producer.lock();
        if matches!(slot.as_ref(), Some(s) if s.generation == generation) {
            *slot = None;
        }
    }

    /// Join as a consumer. If an init segment is cached, it is guaranteed
    /// to be the first message available on the returned receiver.
    pub fn join(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if let Some(init) = inner.init_segment.clone() {
            let _ = tx.send(Message::Binary(init));
        }
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        inner.consumers.push(ConsumerHandle { id, tx });
        rx
    }

    /// Broadcast one payload to every consumer. If `is_init`, it also
    /// becomes (replaces) the cached init segment for future joiners.
    pub fn broadcast(&self, payload: Bytes, is_init: bool) {
        let snapshot = {
            let mut inner = self.inner.lock();
            if is_init {
                inner.init_segment = Some(payload.clone());
            }
            inner.bytes_sent += payload.len() as u64;
            inner.last_data_time = Some(Utc::now());
            inner.consumers.clone()
        };

        let mut dead = Vec::new();
        for consumer in &snapshot {
            if consumer.tx.send(Message::Binary(payload.clone())).is_err() {
                dead.push(consumer.id);
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.lock();
            inner.consumers.retain(|c| !dead.contains(&c.id));
        }
    }

    pub fn stats(&self) -> (u64, usize, Option<DateTime<Utc>>) {
        let inner = self.inner.lock();
        (inner.bytes_sent, inner.consumers.len(), inner.last_data_time)
    }
}

/// Global map of rooms, guarded by its own lock; each room then owns its
/// own internal locking for the consumer set and producer slot.
#[derive(Clone, Default)]
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, stream_key: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().get(stream_key) {
            return room.clone();
        }
        let mut rooms = self.rooms.write();
        rooms
            .entry(stream_key.to_string())
            .or_insert_with(|| Arc::new(Room::new()))
            .clone()
    }

    pub fn get(&self, stream_key: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(stream_key).cloned()
    }

    pub fn room_keys(&self) -> Vec<String> {
        self.rooms.read().keys().cloned().collect()
    }
}

pub(crate) fn log_consumer_drop(stream_key: &str, reason: &str) {
    warn!(stream_key, reason, "consumer removed after failed send");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_joiner_receives_init_before_live_frames() {
        let room = Room::new();
        room.broadcast(Bytes::from_static(b"INIT-BYTES"), true);
        for i in 0..50u8 {
            room.broadcast(Bytes::from(vec![i]), false);
        }

        let mut rx = room.join();

        for i in 50..100u8 {
            room.broadcast(Bytes::from(vec![i]), false);
        }

        let first = rx.recv().await.unwrap();
        match first {
            Message::Binary(b) => assert_eq!(&b[..], b"INIT-BYTES"),
            _ => panic!("expected binary init frame"),
        }

        let second = rx.recv().await.unwrap();
        match second {
            Message::Binary(b) => assert_eq!(b[0], 50),
            _ => panic!("expected binary data frame"),
        }
    }

    #[tokio::test]
    async fn new_producer_displaces_old_one() {
        let room = Room::new();
        let (_gen_a, mut displaced_a) = room.register_producer();
        let (_gen_b, _displaced_b) = room.register_producer();
        assert!(displaced_a.try_recv().is_ok());
    }

    #[tokio::test]
    async fn failed_consumer_send_removes_it_after_broadcast() {
        let room = Room::new();
        let rx = room.join();
        drop(rx);
        room.broadcast(Bytes::from_static(b"x"), false);
        let (_, count, _) = room.stats();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn join_without_init_segment_gets_live_frames_only() {
        let room = Room::new();
        let mut rx = room.join();
        room.broadcast(Bytes::from_static(b"first-live"), false);
        let msg = rx.recv().await.unwrap();
        match msg {
            Message::Binary(b) => assert_eq!(&b[..], b"first-live"),
            _ => panic!("expected binary frame"),
        }
    }
}
