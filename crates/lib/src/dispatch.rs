//! Dispatch loop: drains the backlog into the cache.
//!
//! A pass snapshots the backlog, applies each event in arrival order through
//! the reconciler, and settles the backlog so that only deferred events stay,
//! still ahead of anything that arrived during the pass.
//!
//! Routing:
//! - `session.created` / `session.updated` → session list
//! - `message.updated` → the session's message list; assistant messages also mark the session `updating`
//! - `message.part.updated` → the session's message list
//! - `session.idle` / `session.error` → status projection only
//! - anything else is skipped

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{DispatchStrategy, SyncConfig};
use crate::event::{Event, Role};
use crate::reconcile::{self, Reconciled, SessionChange};
use crate::store::{EventBuffer, QueryCache, QueuedEvent, SessionStatus, StatusProjection};

/// When passes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One pass per backlog change.
    Immediate,
    /// A pass once the backlog holds `batch_size` events, or after `debounce`
    /// without new arrivals, whichever comes first.
    Batched { batch_size: usize, debounce: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    pub mode: DispatchMode,
    /// Deferred events older than this are dropped.
    pub deferred_ttl: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for DispatchOptions {
    fn from(config: &SyncConfig) -> Self {
        let mode = match config.mode {
            DispatchStrategy::Immediate => DispatchMode::Immediate,
            DispatchStrategy::Batched => DispatchMode::Batched {
                batch_size: config.batch_size.max(1),
                debounce: Duration::from_millis(config.debounce_ms),
            },
        };
        Self {
            mode,
            deferred_ttl: Duration::from_millis(config.deferred_ttl_ms),
        }
    }
}

/// Counts from one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub applied: usize,
    pub unchanged: usize,
    pub deferred: usize,
    /// Deferred events dropped for exceeding the retry bound.
    pub expired: usize,
    /// Status-only and unrouted events.
    pub skipped: usize,
    /// Events abandoned because the backlog was cleared mid-pass.
    pub stale: usize,
}

enum Outcome {
    Applied,
    Unchanged,
    Deferred,
    Skipped,
}

impl<T> From<Reconciled<T>> for Outcome {
    fn from(r: Reconciled<T>) -> Self {
        match r {
            Reconciled::Applied(_) => Outcome::Applied,
            Reconciled::Unchanged => Outcome::Unchanged,
            Reconciled::Deferred => Outcome::Deferred,
        }
    }
}

/// The single consumer of one backlog.
pub struct Dispatcher {
    cache: Arc<QueryCache>,
    status: Arc<StatusProjection>,
    buffer: Arc<EventBuffer>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<QueryCache>,
        status: Arc<StatusProjection>,
        buffer: Arc<EventBuffer>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            cache,
            status,
            buffer,
            options,
        }
    }

    /// Run one pass over the current backlog.
    ///
    /// If the backlog is cleared while the pass runs, the rest of the pass is
    /// abandoned: no further event from the old generation reaches the cache
    /// or the status projection, and nothing is requeued.
    pub async fn dispatch_pending(&self) -> PassReport {
        let mut report = PassReport::default();
        let (generation, batch) = self.buffer.checkout().await;
        let Some(through_seq) = batch.last().map(|q| q.seq) else {
            return report;
        };

        let now = Instant::now();
        let mut deferred = Vec::new();
        for mut queued in batch {
            if !self.is_current(generation) {
                report.stale += 1;
                continue;
            }
            match self.apply(generation, &queued).await {
                Outcome::Applied => report.applied += 1,
                Outcome::Unchanged => report.unchanged += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Deferred => {
                    if now.duration_since(queued.queued_at) >= self.options.deferred_ttl {
                        log::warn!(
                            "dropping {} for session {} after {} deferred passes: target never appeared",
                            queued.event.kind(),
                            queued.event.session_id().unwrap_or("-"),
                            queued.attempts,
                        );
                        report.expired += 1;
                    } else {
                        queued.attempts += 1;
                        report.deferred += 1;
                        deferred.push(queued);
                    }
                }
            }
        }

        self.buffer.settle(generation, through_seq, deferred).await;
        log::trace!("dispatch pass: {:?}", report);
        report
    }

    fn is_current(&self, generation: u64) -> bool {
        self.buffer.generation() == generation
    }

    /// Run `merge` only if the backlog generation is still `generation`. Runs
    /// under the cache write lock, immediately before the write it guards.
    fn merge_current<T>(
        &self,
        generation: u64,
        merge: impl FnOnce() -> Reconciled<T>,
    ) -> Reconciled<T> {
        if self.is_current(generation) {
            merge()
        } else {
            Reconciled::Unchanged
        }
    }

    async fn set_status_current(&self, generation: u64, session_id: &str, status: SessionStatus) {
        if self.is_current(generation) {
            self.status.set_status(session_id, status).await;
        }
    }

    async fn apply(&self, generation: u64, queued: &QueuedEvent) -> Outcome {
        // Status side effects fire when an event is first seen, not again on retries.
        let first_attempt = queued.attempts == 0;
        match &queued.event {
            Event::SessionCreated { info } => self
                .cache
                .update_sessions(|s| {
                    self.merge_current(generation, || {
                        reconcile::upsert_session(s, SessionChange::Created, info)
                    })
                })
                .await
                .into(),
            Event::SessionUpdated { info } => self
                .cache
                .update_sessions(|s| {
                    self.merge_current(generation, || {
                        reconcile::upsert_session(s, SessionChange::Updated, info)
                    })
                })
                .await
                .into(),
            Event::MessageUpdated { info } => {
                if first_attempt && info.role == Role::Assistant {
                    self.set_status_current(generation, &info.session_id, SessionStatus::Updating)
                        .await;
                }
                self.cache
                    .update_messages(&info.session_id, |m| {
                        self.merge_current(generation, || reconcile::upsert_message(m, info))
                    })
                    .await
                    .into()
            }
            Event::MessagePartUpdated { part } => self
                .cache
                .update_messages(&part.session_id, |m| {
                    self.merge_current(generation, || reconcile::upsert_message_part(m, part))
                })
                .await
                .into(),
            Event::SessionIdle { session_id } => {
                self.set_status_current(generation, session_id, SessionStatus::Idle)
                    .await;
                Outcome::Skipped
            }
            Event::SessionError { session_id, error } => {
                match session_id {
                    Some(id) => {
                        log::debug!("session {} reported error: {:?}", id, error);
                        self.set_status_current(generation, id, SessionStatus::Error)
                            .await;
                    }
                    None => log::debug!("session.error without session id: {:?}", error),
                }
                Outcome::Skipped
            }
            Event::Other { kind, .. } => {
                log::trace!("skipping unrouted event {}", kind);
                Outcome::Skipped
            }
        }
    }

    /// Run passes as the backlog changes until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        log::debug!("dispatch loop started ({:?})", self.options.mode);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = self.buffer.changed() => {}
            }

            if let DispatchMode::Batched {
                batch_size,
                debounce,
            } = self.options.mode
            {
                if !self.wait_for_batch(batch_size, debounce, &mut shutdown).await {
                    break;
                }
            }
            self.dispatch_pending().await;
        }
        log::debug!("dispatch loop stopped");
    }

    /// Hold a batched pass until the threshold or a quiet `debounce`. Every
    /// arrival restarts the timer. Only events no pass has deferred yet count
    /// toward the threshold. Returns false on shutdown.
    async fn wait_for_batch(
        &self,
        batch_size: usize,
        debounce: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            if self.buffer.fresh_len().await >= batch_size {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(debounce) => return true,
                _ = self.buffer.changed() => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}
