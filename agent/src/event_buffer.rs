//! Bounded in-memory event queue with periodic and critical flush (§4.8).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use core_common::model::Event;

use crate::cloud::CloudClient;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_FLUSH_BATCH: usize = 50;
const MAX_BUFFER_CAP: usize = 5000;

#[derive(Default)]
struct BufferInner {
    events: Vec<Event>,
}

pub struct EventBuffer {
    inner: Mutex<BufferInner>,
    flush_signal: mpsc::UnboundedSender<()>,
}

impl EventBuffer {
    pub fn new(flush_signal: mpsc::UnboundedSender<()>) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            flush_signal,
        }
    }

    /// Appends one event, dropping the oldest if the buffer is at
    /// capacity, and triggers an immediate flush for critical events.
    pub fn push(&self, event: Event) {
        let is_critical = event.event_type.is_critical_for_flush();
        {
            let mut inner = self.inner.lock();
            if inner.events.len() >= MAX_BUFFER_CAP {
                inner.events.remove(0);
            }
            inner.events.push(event);
        }
        if is_critical {
            let _ = self.flush_signal.send(());
        }
    }

    fn take_batch(&self) -> Vec<Event> {
        let mut inner = self.inner.lock();
        let take_n = inner.events.len().min(MAX_FLUSH_BATCH);
        inner.events.drain(..take_n).collect()
    }

    /// Puts an unsent slice back at the front of the buffer, preserving
    /// order for the next flush attempt.
    fn requeue_front(&self, mut events: Vec<Event>) {
        let mut inner = self.inner.lock();
        events.extend(std::mem::take(&mut inner.events));
        inner.events = events;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }
}

/// Runs until `stop_rx` fires: flushes up to 50 events every 5 s, or
/// immediately whenever `flush_rx` is signalled by a critical push.
pub async fn run_flush_loop(
    buffer: Arc<EventBuffer>,
    cloud: Arc<CloudClient>,
    mut flush_rx: mpsc::UnboundedReceiver<()>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                flush_once(&buffer, &cloud).await;
                info!("event buffer flush loop stopping");
                return;
            }
            _ = ticker.tick() => {
                flush_once(&buffer, &cloud).await;
            }
            Some(()) = flush_rx.recv() => {
                flush_once(&buffer, &cloud).await;
            }
        }
    }
}

async fn flush_once(buffer: &Arc<EventBuffer>, cloud: &Arc<CloudClient>) {
    let batch = buffer.take_batch();
    if batch.is_empty() {
        return;
    }
    match cloud.upload_events(&batch).await {
        Ok(()) => {}
        Err(e) => {
            warn!(error = %e, count = batch.len(), "event upload failed, re-queueing");
            buffer.requeue_front(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use core_common::model::{EventType, Severity};
    use std::collections::BTreeMap;

    fn sample_event(event_type: EventType) -> Event {
        Event {
            event_type,
            topic: "topic".to_string(),
            source: "src".to_string(),
            payload: BTreeMap::new(),
            severity: event_type.severity(),
            camera_ip: "10.0.0.5".to_string(),
            camera_name: "cam".to_string(),
            camera_id: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn critical_event_signals_immediate_flush() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = EventBuffer::new(tx);
        buffer.push(sample_event(EventType::MotionDetection));
        assert!(rx.try_recv().is_err());
        buffer.push(sample_event(EventType::Tampering));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn take_batch_caps_at_fifty() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let buffer = EventBuffer::new(tx);
        for _ in 0..75 {
            buffer.push(sample_event(EventType::MotionDetection));
        }
        let batch = buffer.take_batch();
        assert_eq!(batch.len(), 50);
        assert_eq!(buffer.len(), 25);
    }

    #[test]
    fn requeue_preserves_order_in_front() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let buffer = EventBuffer::new(tx);
        buffer.push(sample_event(EventType::MotionDetection));
        let batch = buffer.take_batch();
        buffer.push(sample_event(EventType::Tampering));
        buffer.requeue_front(batch);
        assert_eq!(buffer.len(), 2);
    }
}
