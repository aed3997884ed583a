//! Debounced, retried persistence of document content.
//!
//! Each document gets one scheduling task, spawned on its first `record`
//! and fed through an unbounded command channel. A task with nothing pending
//! exits after an idle period; the next `record` spawns a new one.
//!
//! The task holds at most one candidate: a newer `Record` replaces it and
//! restarts the quiet window.
//! When the window settles the candidate is written once; failures back off
//! per `RetryPolicy` while still absorbing newer candidates, so a retry
//! always carries the latest content.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::DocumentId;
use crate::retry::RetryPolicy;
use crate::storage::DocumentStore;

/// Capacity of the persistence event channel
const EVENT_CAPACITY: usize = 256;

/// How long a scheduler with nothing pending waits before exiting
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome notifications for observers
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceEvent {
    /// Candidate `seq` is durable
    Saved {
        document_id: DocumentId,
        attempts: u32,
        seq: u64,
    },
    /// Retries exhausted; content stays unsaved until the next record
    Failed {
        document_id: DocumentId,
        attempts: u32,
        error: String,
    },
    /// A pending write was discarded
    Cancelled { document_id: DocumentId },
}

/// Content waiting to be written
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Monotonic across the coordinator; later records have larger values
    pub seq: u64,
    pub payload: Value,
    pub arrived_at: DateTime<Utc>,
}

enum Command {
    Record(Candidate),
    Flush(oneshot::Sender<()>),
    Cancel,
}

/// Per-document debouncing writer
pub struct PersistenceCoordinator {
    store: Arc<dyn DocumentStore>,
    debounce: Duration,
    retry: RetryPolicy,
    idle_timeout: Duration,
    schedulers: Arc<DashMap<DocumentId, mpsc::UnboundedSender<Command>>>,
    latest: Arc<DashMap<DocumentId, Candidate>>,
    events: broadcast::Sender<PersistenceEvent>,
    seq: AtomicU64,
}

impl PersistenceCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, debounce: Duration, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            debounce,
            retry,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            schedulers: Arc::new(DashMap::new()),
            latest: Arc::new(DashMap::new()),
            events,
            seq: AtomicU64::new(0),
        }
    }

    /// Set how long an idle document's scheduler lingers
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Make `payload` the document's pending content.
    ///
    /// Never blocks; safe to call under a room lock. Must run inside a
    /// tokio runtime. Returns the candidate's sequence number.
    pub fn record(&self, document_id: &str, payload: Value, arrived_at: DateTime<Utc>) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let candidate = Candidate {
            seq,
            payload,
            arrived_at,
        };

        self.latest
            .insert(document_id.to_string(), candidate.clone());
        self.dispatch(document_id, Command::Record(candidate));
        seq
    }

    /// Newest content not yet known to be durable
    pub fn latest(&self, document_id: &str) -> Option<Candidate> {
        self.latest.get(document_id).map(|c| c.clone())
    }

    /// Write the pending candidate now instead of waiting for the window.
    ///
    /// Resolves once the write (including retries) has finished.
    pub async fn flush(&self, document_id: &str) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = self
            .schedulers
            .get(document_id)
            .is_some_and(|tx| tx.send(Command::Flush(ack_tx)).is_ok());
        if sent {
            let _ = ack_rx.await;
        }
    }

    /// Flush every document; used on shutdown
    pub async fn flush_all(&self) {
        let documents: Vec<DocumentId> = self.schedulers.iter().map(|s| s.key().clone()).collect();
        info!("Flushing {} documents", documents.len());
        join_all(documents.iter().map(|document_id| self.flush(document_id))).await;
    }

    /// Discard the pending write for a document
    pub fn cancel(&self, document_id: &str) {
        if let Some(tx) = self.schedulers.get(document_id) {
            let _ = tx.send(Command::Cancel);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.events.subscribe()
    }

    /// Documents with content not yet durable
    pub fn pending_count(&self) -> usize {
        self.latest.len()
    }

    /// Documents with a live scheduling task
    pub fn scheduler_count(&self) -> usize {
        self.schedulers.len()
    }

    /// Send under the map entry's lock. A scheduler only retires while
    /// holding the same lock, so a command is never sent to one that is
    /// about to exit.
    fn dispatch(&self, document_id: &str, command: Command) {
        let mut tx = self
            .schedulers
            .entry(document_id.to_string())
            .or_insert_with(|| self.spawn_scheduler(document_id));

        if tx.is_closed() {
            warn!("Scheduler for document {} is gone, restarting", document_id);
            *tx = self.spawn_scheduler(document_id);
        }
        let _ = tx.send(command);
    }

    fn spawn_scheduler(&self, document_id: &str) -> mpsc::UnboundedSender<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            document_id: document_id.to_string(),
            store: self.store.clone(),
            debounce: self.debounce,
            retry: self.retry.clone(),
            idle_timeout: self.idle_timeout,
            latest: self.latest.clone(),
            schedulers: self.schedulers.clone(),
            own: tx.downgrade(),
            events: self.events.clone(),
            rx,
            closed: false,
        };
        debug!("Starting save scheduler for document {}", document_id);
        tokio::spawn(scheduler.run());
        tx
    }
}

/// The task owning one document's pending write
struct Scheduler {
    document_id: DocumentId,
    store: Arc<dyn DocumentStore>,
    debounce: Duration,
    retry: RetryPolicy,
    idle_timeout: Duration,
    latest: Arc<DashMap<DocumentId, Candidate>>,
    schedulers: Arc<DashMap<DocumentId, mpsc::UnboundedSender<Command>>>,
    /// Identifies this task's entry in `schedulers`
    own: mpsc::WeakUnboundedSender<Command>,
    events: broadcast::Sender<PersistenceEvent>,
    rx: mpsc::UnboundedReceiver<Command>,
    closed: bool,
}

impl Scheduler {
    async fn run(mut self) {
        loop {
            let command = tokio::select! {
                command = self.rx.recv() => command,
                _ = sleep(self.idle_timeout) => {
                    if self.retire() {
                        break;
                    }
                    continue;
                }
            };
            let Some(command) = command else {
                break;
            };

            let mut acks = Vec::new();
            let mut candidate = match command {
                Command::Record(candidate) => Some(candidate),
                Command::Flush(ack) => {
                    let _ = ack.send(());
                    continue;
                }
                Command::Cancel => continue,
            };

            // Quiet window; every newer record restarts it.
            while let Some(current) = candidate.as_ref() {
                tokio::select! {
                    command = self.rx.recv() => match command {
                        Some(Command::Record(newer)) => {
                            debug!(
                                "Document {}: candidate {} superseded by {}",
                                self.document_id, current.seq, newer.seq
                            );
                            candidate = Some(newer);
                        }
                        Some(Command::Flush(ack)) => {
                            acks.push(ack);
                            break;
                        }
                        Some(Command::Cancel) => {
                            self.discard(current.seq);
                            candidate = None;
                        }
                        None => {
                            self.closed = true;
                            break;
                        }
                    },
                    _ = sleep(self.debounce) => break,
                }
            }

            if let Some(candidate) = candidate {
                self.write_with_retry(candidate, &mut acks).await;
            }
            for ack in acks {
                let _ = ack.send(());
            }
            if self.closed {
                break;
            }
        }

        debug!("Save scheduler for document {} stopped", self.document_id);
    }

    async fn write_with_retry(&mut self, mut candidate: Candidate, acks: &mut Vec<oneshot::Sender<()>>) {
        let mut attempt: u32 = 1;

        loop {
            let result = self
                .store
                .write_content(&self.document_id, &candidate.payload, candidate.arrived_at)
                .await;

            let err = match result {
                Ok(()) => {
                    let seq = candidate.seq;
                    self.latest
                        .remove_if(&self.document_id, |_, latest| latest.seq == seq);
                    info!(
                        "Saved document {} (seq {}, attempt {})",
                        self.document_id, seq, attempt
                    );
                    let _ = self.events.send(PersistenceEvent::Saved {
                        document_id: self.document_id.clone(),
                        attempts: attempt,
                        seq,
                    });
                    return;
                }
                Err(e) => e,
            };

            let Some(delay) = self.retry.delay_for(attempt) else {
                error!(
                    "Giving up on document {} after {} attempts: {}",
                    self.document_id, attempt, err
                );
                let _ = self.events.send(PersistenceEvent::Failed {
                    document_id: self.document_id.clone(),
                    attempts: attempt,
                    error: err.to_string(),
                });
                return;
            };

            warn!(
                "Saving document {} failed (attempt {}), retrying in {:?}: {}",
                self.document_id, attempt, delay, err
            );

            // Back off, but keep taking newer candidates.
            let deadline = sleep_until(Instant::now() + delay);
            tokio::pin!(deadline);
            loop {
                if self.closed {
                    (&mut deadline).await;
                    break;
                }
                tokio::select! {
                    _ = &mut deadline => break,
                    command = self.rx.recv() => match command {
                        Some(Command::Record(newer)) => candidate = newer,
                        Some(Command::Flush(ack)) => acks.push(ack),
                        Some(Command::Cancel) => {
                            self.discard(candidate.seq);
                            return;
                        }
                        None => self.closed = true,
                    },
                }
            }

            attempt += 1;
        }
    }

    /// Drop this task's map entry if nothing is queued for it.
    ///
    /// Returns true when the task should exit.
    fn retire(&self) -> bool {
        let Some(own) = self.own.upgrade() else {
            return true;
        };
        let removed = self
            .schedulers
            .remove_if(&self.document_id, |_, tx| {
                tx.same_channel(&own) && self.rx.is_empty()
            })
            .is_some();
        if removed {
            debug!("Save scheduler for document {} idle, exiting", self.document_id);
        }
        removed
    }

    fn discard(&self, seq: u64) {
        self.latest
            .remove_if(&self.document_id, |_, latest| latest.seq == seq);
        info!("Pending save of document {} cancelled", self.document_id);
        let _ = self.events.send(PersistenceEvent::Cancelled {
            document_id: self.document_id.clone(),
        });
    }
}
