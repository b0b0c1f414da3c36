//! Event backlog: events received from the transport and not yet applied.
//!
//! The transport appends, the dispatch loop snapshots and settles. The backlog
//! is bounded; when it overflows the oldest entries are dropped, so it is a
//! best-effort queue and not a source of truth.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::event::Event;

pub const DEFAULT_MAX_BACKLOG: usize = 100;

/// One backlog entry.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Arrival number, increasing for the lifetime of the buffer.
    pub seq: u64,
    /// When the event first entered the backlog.
    pub queued_at: Instant,
    /// Dispatch passes that deferred this event so far.
    pub attempts: u32,
    pub event: Event,
}

#[derive(Default)]
struct Backlog {
    entries: VecDeque<QueuedEvent>,
    next_seq: u64,
}

impl Backlog {
    fn truncate(&mut self, max_len: usize) -> u64 {
        let mut dropped = 0;
        while self.entries.len() > max_len {
            self.entries.pop_front();
            dropped += 1;
        }
        dropped
    }
}

/// Bounded, ordered event backlog shared by one transport and one dispatch loop.
///
/// `clear` starts a new generation. A pass that checked out entries from an
/// older generation must not apply or requeue them.
pub struct EventBuffer {
    inner: Mutex<Backlog>,
    max_len: usize,
    arrivals: Notify,
    dropped: AtomicU64,
    generation: AtomicU64,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BACKLOG)
    }
}

impl EventBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(Backlog::default()),
            max_len: max_len.max(1),
            arrivals: Notify::new(),
            dropped: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Append to the tail, dropping from the head past the bound. Returns the event's seq.
    pub async fn append(&self, event: Event) -> u64 {
        let seq = {
            let mut g = self.inner.lock().await;
            let seq = g.next_seq;
            g.next_seq += 1;
            g.entries.push_back(QueuedEvent {
                seq,
                queued_at: Instant::now(),
                attempts: 0,
                event,
            });
            self.record_dropped(g.truncate(self.max_len));
            seq
        };
        self.arrivals.notify_one();
        seq
    }

    /// Copy of the backlog in arrival order.
    pub async fn snapshot(&self) -> Vec<QueuedEvent> {
        self.inner.lock().await.entries.iter().cloned().collect()
    }

    /// Current generation and a copy of the backlog, read under one lock.
    pub async fn checkout(&self) -> (u64, Vec<QueuedEvent>) {
        let g = self.inner.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);
        (generation, g.entries.iter().cloned().collect())
    }

    /// Bumped by every `clear`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Swap the whole backlog.
    pub async fn replace(&self, remaining: Vec<QueuedEvent>) {
        let mut g = self.inner.lock().await;
        g.entries = remaining.into();
        self.record_dropped(g.truncate(self.max_len));
    }

    /// Finish a dispatch pass: drop everything up to and including `through_seq`
    /// and put `deferred` back at the head, ahead of events that arrived during the pass.
    ///
    /// If the backlog was cleared since `generation` was checked out, the pass
    /// is stale: the backlog is left as is and `deferred` is discarded.
    pub async fn settle(&self, generation: u64, through_seq: u64, deferred: Vec<QueuedEvent>) {
        let mut g = self.inner.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            log::debug!(
                "backlog cleared during dispatch pass, discarding {} deferred event(s)",
                deferred.len()
            );
            return;
        }
        g.entries.retain(|e| e.seq > through_seq);
        for entry in deferred.into_iter().rev() {
            g.entries.push_front(entry);
        }
        self.record_dropped(g.truncate(self.max_len));
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Empty the backlog and start a new generation.
    pub async fn clear(&self) {
        let mut g = self.inner.lock().await;
        g.entries.clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Entries no pass has deferred yet.
    pub async fn fresh_len(&self) -> usize {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| e.attempts == 0)
            .count()
    }

    /// Total events lost to the backlog bound.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resolves after the next append (or `wake`). A notification that arrived
    /// while nobody was waiting is kept, so arrivals are not missed.
    pub async fn changed(&self) {
        self.arrivals.notified().await;
    }

    /// Trigger the dispatch loop without a new event, e.g. after seeding a collection.
    pub fn wake(&self) {
        self.arrivals.notify_one();
    }

    fn record_dropped(&self, n: u64) {
        if n > 0 {
            let total = self.dropped.fetch_add(n, Ordering::Relaxed) + n;
            log::debug!(
                "event backlog over {} entries, dropped {} oldest ({} total)",
                self.max_len,
                n,
                total
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn idle(id: &str) -> Event {
        Event::SessionIdle {
            session_id: id.into(),
        }
    }

    fn session_ids(entries: &[QueuedEvent]) -> Vec<String> {
        entries
            .iter()
            .filter_map(|e| e.event.session_id().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn append_keeps_order_and_numbers_events() {
        let buffer = EventBuffer::new(10);
        assert_eq!(buffer.append(idle("a")).await, 0);
        assert_eq!(buffer.append(idle("b")).await, 1);
        let snap = buffer.snapshot().await;
        assert_eq!(session_ids(&snap), ["a", "b"]);
        assert!(snap.iter().all(|e| e.attempts == 0));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let buffer = EventBuffer::new(3);
        for id in ["a", "b", "c", "d", "e"] {
            buffer.append(idle(id)).await;
        }
        assert_eq!(buffer.len().await, 3);
        assert_eq!(session_ids(&buffer.snapshot().await), ["c", "d", "e"]);
        assert_eq!(buffer.dropped(), 2);
    }

    #[tokio::test]
    async fn settle_keeps_deferred_ahead_of_new_arrivals() {
        let buffer = EventBuffer::new(10);
        buffer.append(idle("a")).await;
        buffer.append(idle("b")).await;
        let (generation, batch) = buffer.checkout().await;
        let last = batch.last().unwrap().seq;

        // arrives while the pass is running
        buffer.append(idle("c")).await;

        let deferred: Vec<QueuedEvent> = batch
            .into_iter()
            .filter(|e| e.event.session_id() == Some("b"))
            .collect();
        buffer.settle(generation, last, deferred).await;
        assert_eq!(session_ids(&buffer.snapshot().await), ["b", "c"]);
        assert_eq!(buffer.fresh_len().await, 2);
    }

    #[tokio::test]
    async fn settle_after_clear_does_not_requeue_old_events() {
        let buffer = EventBuffer::new(10);
        buffer.append(idle("old")).await;
        let (generation, batch) = buffer.checkout().await;
        let last = batch.last().unwrap().seq;

        buffer.clear().await;
        assert_ne!(buffer.generation(), generation);
        buffer.append(idle("new")).await;

        buffer.settle(generation, last, batch).await;
        assert_eq!(session_ids(&buffer.snapshot().await), ["new"]);
    }

    #[tokio::test]
    async fn fresh_len_skips_deferred_entries() {
        let buffer = EventBuffer::new(10);
        buffer.append(idle("a")).await;
        let (generation, mut batch) = buffer.checkout().await;
        batch[0].attempts = 1;
        buffer.settle(generation, batch[0].seq, batch).await;
        buffer.append(idle("b")).await;

        assert_eq!(buffer.len().await, 2);
        assert_eq!(buffer.fresh_len().await, 1);
    }

    #[tokio::test]
    async fn replace_swaps_contents() {
        let buffer = EventBuffer::new(10);
        buffer.append(idle("a")).await;
        buffer.replace(Vec::new()).await;
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn append_wakes_a_waiter_even_if_it_starts_waiting_later() {
        let buffer = EventBuffer::new(10);
        buffer.append(idle("a")).await;
        tokio::time::timeout(Duration::from_millis(100), buffer.changed())
            .await
            .expect("stored notification");
    }
}
