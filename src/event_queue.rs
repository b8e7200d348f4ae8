//! Durable FIFO of outbound writes that failed and wait to be replayed.
use std::{
    collections::VecDeque,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use chrono::Utc;
use derive_more::From;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    campaign::Timestamp,
    events::{IdentifyPayload, TrackPayload},
    store::PersistentStore,
    sync::SingleFlight,
    transport::Transport,
    Result,
};

pub(crate) const QUEUE_KEY: &str = "event_queue";

/// A write to replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum OutboundEvent {
    Track(TrackPayload),
    Identify(IdentifyPayload),
}

impl OutboundEvent {
    /// Short name used in logs and notifications.
    pub fn action(&self) -> &str {
        match self {
            OutboundEvent::Track(payload) => &payload.action,
            OutboundEvent::Identify(_) => "identify",
        }
    }

    async fn send(&self, transport: &dyn Transport) -> Result<()> {
        match self {
            OutboundEvent::Track(payload) => transport.track(payload).await,
            OutboundEvent::Identify(payload) => transport.identify(payload).await,
        }
    }
}

/// An entry of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Position in enqueue order.
    pub seq: u64,
    #[allow(missing_docs)]
    pub event: OutboundEvent,
    #[allow(missing_docs)]
    pub enqueued_at: Timestamp,
}

/// Result of [`EventQueue::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Events delivered and removed from the queue.
    pub delivered: usize,
    /// Events that failed again and stay queued.
    pub failed: usize,
    /// Queue length after the flush.
    pub remaining: usize,
    /// Another flush was already running; nothing was attempted.
    pub skipped: bool,
}

/// Result of [`EventQueue::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The write reached the backend.
    Sent,
    /// The write failed and was queued for replay.
    Queued,
}

/// Configuration for [`EventQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventQueueConfig {
    /// Pause between two replay attempts.
    pub flush_delay: Duration,
    /// Maximum number of queued events. The oldest event is dropped to make room.
    pub max_events: usize,
}

impl EventQueueConfig {
    /// Default value for [`EventQueueConfig::flush_delay`].
    pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(150);
    /// Default value for [`EventQueueConfig::max_events`].
    pub const DEFAULT_MAX_EVENTS: usize = 1000;
}

impl Default for EventQueueConfig {
    fn default() -> EventQueueConfig {
        EventQueueConfig {
            flush_delay: EventQueueConfig::DEFAULT_FLUSH_DELAY,
            max_events: EventQueueConfig::DEFAULT_MAX_EVENTS,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<QueuedEvent>,
    next_seq: u64,
}

/// Durable queue of failed writes.
///
/// Replay preserves enqueue order. Each event is attempted independently: a failure does not stop
/// its successors, and failed events keep their relative position.
///
/// The queue holds at most [`EventQueueConfig::max_events`] events; when full, the oldest one is
/// dropped.
pub struct EventQueue {
    store: Arc<dyn PersistentStore>,
    transport: Arc<dyn Transport>,
    state: Mutex<QueueState>,
    flushing: AtomicBool,
    config: EventQueueConfig,
}

impl EventQueue {
    #[allow(missing_docs)]
    pub fn new(
        store: Arc<dyn PersistentStore>,
        transport: Arc<dyn Transport>,
        config: EventQueueConfig,
    ) -> EventQueue {
        EventQueue {
            store,
            transport,
            state: Mutex::new(QueueState::default()),
            flushing: AtomicBool::new(false),
            config,
        }
    }

    /// Load persisted events, replacing the in-memory queue. Returns the number of queued events.
    ///
    /// An undecodable queue is discarded. Events beyond the configured maximum are dropped, oldest
    /// first.
    pub async fn load(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut events: VecDeque<QueuedEvent> = match self.store.get(QUEUE_KEY).await? {
            None => VecDeque::new(),
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(events) => events,
                Err(err) => {
                    log::warn!(target: "nudge", "discarding corrupted event queue: {err}");
                    self.store.delete(QUEUE_KEY).await?;
                    VecDeque::new()
                }
            },
        };

        state.next_seq = events.back().map_or(0, |last| last.seq + 1);
        let excess = events.len().saturating_sub(self.config.max_events);
        if excess > 0 {
            log::warn!(target: "nudge", dropped = excess; "persisted event queue over capacity, dropping oldest events");
            events.drain(..excess);
        }
        state.events = events;
        if !state.events.is_empty() {
            log::debug!(target: "nudge", pending = state.events.len(); "loaded queued events");
        }
        Ok(state.events.len())
    }

    /// Append `event` and persist the queue.
    ///
    /// If the queue is full, the oldest events are dropped first. The event stays queued in memory
    /// even if persisting fails.
    pub async fn enqueue(&self, event: impl Into<OutboundEvent>) -> Result<()> {
        let event = event.into();
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        log::debug!(target: "nudge", seq, action = event.action(); "queueing failed write");
        while !state.events.is_empty() && state.events.len() >= self.config.max_events {
            if let Some(dropped) = state.events.pop_front() {
                log::warn!(target: "nudge",
                           seq = dropped.seq,
                           action = dropped.event.action();
                           "event queue full, dropping oldest event");
            }
        }
        state.events.push_back(QueuedEvent {
            seq,
            event,
            enqueued_at: Utc::now(),
        });
        self.persist(&state).await
    }

    /// Send `event` now, queueing it if the transport fails.
    pub async fn deliver(&self, event: impl Into<OutboundEvent>) -> Delivery {
        let event = event.into();
        match event.send(self.transport.as_ref()).await {
            Ok(()) => Delivery::Sent,
            Err(err) => {
                log::debug!(target: "nudge", action = event.action(); "write failed: {err}");
                if let Err(err) = self.enqueue(event).await {
                    log::warn!(target: "nudge", "failed to persist event queue: {err}");
                }
                Delivery::Queued
            }
        }
    }

    /// Replay queued events in order. Only one flush runs at a time.
    pub async fn flush(&self) -> FlushReport {
        let Some(_guard) = SingleFlight::acquire(&self.flushing) else {
            return FlushReport {
                skipped: true,
                ..FlushReport::default()
            };
        };

        let pending = self.snapshot().await;
        if pending.is_empty() {
            return FlushReport::default();
        }
        log::debug!(target: "nudge", pending = pending.len(); "flushing queued events");

        let mut report = FlushReport::default();
        for (i, queued) in pending.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.flush_delay).await;
            }

            match queued.event.send(self.transport.as_ref()).await {
                Ok(()) => {
                    report.delivered += 1;
                    if let Err(err) = self.remove(queued.seq).await {
                        log::warn!(target: "nudge", seq = queued.seq; "failed to persist event queue: {err}");
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    log::warn!(target: "nudge",
                               seq = queued.seq,
                               action = queued.event.action();
                               "replay failed, keeping event queued: {err}");
                }
            }
        }

        report.remaining = self.len().await;
        report
    }

    /// Number of queued events.
    pub async fn len(&self) -> usize {
        self.state.lock().await.events.len()
    }

    /// Check if empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copy of the queued events in replay order.
    pub async fn snapshot(&self) -> Vec<QueuedEvent> {
        self.state.lock().await.events.iter().cloned().collect()
    }

    async fn remove(&self, seq: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.events.retain(|queued| queued.seq != seq);
        self.persist(&state).await
    }

    async fn persist(&self, state: &QueueState) -> Result<()> {
        if state.events.is_empty() {
            self.store.delete(QUEUE_KEY).await?;
        } else {
            let bytes = serde_json::to_vec(&state.events)?;
            self.store.put(QUEUE_KEY, bytes).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::Properties, store::MemoryStore, testing::FakeTransport};

    fn track(action: &str) -> TrackPayload {
        TrackPayload::new(Some("u1".into()), action, Properties::new())
    }

    fn queue(store: Arc<MemoryStore>, transport: Arc<FakeTransport>) -> EventQueue {
        EventQueue::new(store, transport, EventQueueConfig::default())
    }

    fn capped_queue(store: Arc<MemoryStore>, max_events: usize) -> EventQueue {
        let config = EventQueueConfig {
            max_events,
            ..EventQueueConfig::default()
        };
        EventQueue::new(store, Arc::new(FakeTransport::new()), config)
    }

    async fn queued_actions(queue: &EventQueue) -> Vec<String> {
        queue
            .snapshot()
            .await
            .iter()
            .map(|queued| queued.event.action().to_owned())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn failed_event_stays_in_place() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(FakeTransport::new());
        let queue = queue(store, transport.clone());

        for action in ["A", "B", "C"] {
            queue.enqueue(track(action)).await.unwrap();
        }

        transport.fail_actions(&["B"]);
        let report = queue.flush().await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(queued_actions(&queue).await, vec!["B"]);
        assert_eq!(transport.tracked_actions(), vec!["A", "C"]);

        transport.fail_actions(&[]);
        let report = queue.flush().await;

        assert_eq!(report.delivered, 1);
        assert!(queue.is_empty().await);
        assert_eq!(transport.tracked_actions(), vec!["A", "C", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_keep_relative_order() {
        let transport = Arc::new(FakeTransport::new());
        let queue = queue(Arc::new(MemoryStore::new()), transport.clone());

        for action in ["A", "B", "C", "D"] {
            queue.enqueue(track(action)).await.unwrap();
        }
        transport.fail_actions(&["B", "D"]);
        queue.flush().await;

        assert_eq!(queued_actions(&queue).await, vec!["B", "D"]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_between_attempts() {
        let transport = Arc::new(FakeTransport::new());
        let queue = queue(Arc::new(MemoryStore::new()), transport);
        for action in ["A", "B", "C"] {
            queue.enqueue(track(action)).await.unwrap();
        }

        let start = tokio::time::Instant::now();
        queue.flush().await;

        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(FakeTransport::new());

        {
            let queue = queue(store.clone(), transport.clone());
            queue.enqueue(track("A")).await.unwrap();
            queue
                .enqueue(IdentifyPayload {
                    user_id: "u1".into(),
                    traits: Properties::new(),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }

        let restarted = queue(store.clone(), transport.clone());
        assert_eq!(restarted.load().await.unwrap(), 2);
        assert_eq!(queued_actions(&restarted).await, vec!["A", "identify"]);

        restarted.enqueue(track("B")).await.unwrap();
        let snapshot = restarted.snapshot().await;
        let seqs: Vec<u64> = snapshot.iter().map(|q| q.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        restarted.flush().await;
        assert!(store.is_empty());
        assert_eq!(transport.identified().len(), 1);
    }

    #[tokio::test]
    async fn corrupted_queue_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store.put(QUEUE_KEY, b"[{".to_vec()).await.unwrap();

        let queue = queue(store.clone(), Arc::new(FakeTransport::new()));

        assert_eq!(queue.load().await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn deliver_queues_only_on_failure() {
        let transport = Arc::new(FakeTransport::new());
        let queue = queue(Arc::new(MemoryStore::new()), transport.clone());
        transport.fail_actions(&["down"]);

        assert_eq!(queue.deliver(track("up")).await, Delivery::Sent);
        assert_eq!(queue.deliver(track("down")).await, Delivery::Queued);

        assert_eq!(transport.tracked_actions(), vec!["up"]);
        assert_eq!(queued_actions(&queue).await, vec!["down"]);
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_event() {
        let store = Arc::new(MemoryStore::new());
        let queue = capped_queue(store.clone(), 2);

        for action in ["A", "B", "C"] {
            queue.enqueue(track(action)).await.unwrap();
        }
        assert_eq!(queued_actions(&queue).await, vec!["B", "C"]);

        let restarted = capped_queue(store, 2);
        assert_eq!(restarted.load().await.unwrap(), 2);
        assert_eq!(queued_actions(&restarted).await, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn oversized_persisted_queue_is_trimmed_on_load() {
        let store = Arc::new(MemoryStore::new());
        let queue = capped_queue(store.clone(), 10);
        for action in ["A", "B", "C", "D"] {
            queue.enqueue(track(action)).await.unwrap();
        }

        let restarted = capped_queue(store, 3);
        assert_eq!(restarted.load().await.unwrap(), 3);
        assert_eq!(queued_actions(&restarted).await, vec!["B", "C", "D"]);

        restarted.enqueue(track("E")).await.unwrap();
        let snapshot = restarted.snapshot().await;
        assert_eq!(snapshot.last().map(|q| q.seq), Some(4));
    }

    #[tokio::test]
    async fn concurrent_flush_is_skipped() {
        let transport = Arc::new(FakeTransport::new());
        let queue = queue(Arc::new(MemoryStore::new()), transport);
        let _guard = SingleFlight::acquire(&queue.flushing).unwrap();

        assert!(queue.flush().await.skipped);
    }
}
