//! Replication of the local change log into the relational mirror.
//!
//! The mirror is eventually consistent. The lease holder reads every
//! acknowledged change from the local store's change log, writes it with its
//! ordering token, and advances a replication cursor kept in the local store
//! only once the write lands or is refused. Retryable failures are retried
//! with backoff; a change still pending when the holder goes away is picked
//! up by the next holder. Token guards on the mirror side make replays and
//! reordering harmless.

mod client;
pub mod error;
mod local;

pub use client::{MirrorClient, SYNC_TOKEN_HEADER};
pub use error::MirrorError;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use crmsync_core::{ChangeRecord, Collection, Document, LeaseState, LocalStore, OrderingToken};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;

/// Attempts between escalated log lines for a stuck change.
const ESCALATE_EVERY: u32 = 10;

/// Replication cursor name in the local store.
const CURSOR: &str = "mirror";

const BATCH_SIZE: i64 = 256;

/// Destination for replicated changes.
#[async_trait]
pub trait MirrorSink: Send + Sync {
    /// Upsert `document` as row `id`. With a token, stale writes are ignored.
    async fn upsert(
        &self, collection: Collection, id: &str, document: &Document, token: Option<OrderingToken>,
    ) -> Result<(), MirrorError>;

    /// Tombstone row `id`. With a token, stale deletes are ignored.
    async fn delete(&self, collection: Collection, id: &str, token: Option<OrderingToken>) -> Result<(), MirrorError>;
}

/// Outcome of [`MirrorWriter::apply_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The mirror accepted the change.
    Written,
    /// The mirror refused the change with a non-retryable error.
    Dropped,
    /// Stopped while waiting to retry; the change was not written.
    Interrupted,
}

/// Applies change records to a [`MirrorSink`].
#[derive(Clone)]
pub struct MirrorWriter {
    sink: Arc<dyn MirrorSink>,
    backoff: Backoff,
}

impl fmt::Debug for MirrorWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorWriter").field("backoff", &self.backoff).finish_non_exhaustive()
    }
}

impl MirrorWriter {
    pub fn new(sink: Arc<dyn MirrorSink>) -> Self {
        Self { sink, backoff: Backoff::default() }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Write one record, once.
    pub async fn apply(&self, record: &ChangeRecord) -> Result<(), MirrorError> {
        match &record.document {
            Some(document) => self.sink.upsert(record.collection, &record.id, document, Some(record.token)).await,
            None => self.sink.delete(record.collection, &record.id, Some(record.token)).await,
        }
    }

    /// Write one record, retrying retryable failures until it lands or
    /// `stop` flips to `true`.
    pub async fn apply_with_retry(&self, record: &ChangeRecord, stop: &mut watch::Receiver<bool>) -> Delivery {
        let mut backoff = self.backoff.clone();
        loop {
            let e = match self.apply(record).await {
                Ok(()) => {
                    debug!(collection = %record.collection, id = %record.id, token = %record.token, "mirrored change");
                    return Delivery::Written;
                }
                Err(e) => e,
            };

            if !e.is_retryable() {
                error!(
                    collection = %record.collection,
                    id = %record.id,
                    token = %record.token,
                    error = %e,
                    "mirror refused change; dropping it"
                );
                return Delivery::Dropped;
            }

            let delay = backoff.next_delay();
            if backoff.attempt() % ESCALATE_EVERY == 0 {
                error!(attempt = backoff.attempt(), id = %record.id, error = %e, "mirror still unavailable");
            } else {
                warn!(attempt = backoff.attempt(), id = %record.id, error = %e, "mirror write failed, retrying");
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!(id = %record.id, token = %record.token, "stopping with change left for the next holder");
                        return Delivery::Interrupted;
                    }
                }
            }
        }
    }

    /// Mirror every acknowledged change logged after the replication cursor.
    ///
    /// The cursor is shared by every tab on the store and only moves past a
    /// change once it is written or refused. When compaction has dropped
    /// changes the cursor never reached, the mirror is rebuilt from the
    /// entries table first. Returns the number of records handled.
    pub async fn replicate(&self, store: &LocalStore, stop: &mut watch::Receiver<bool>) -> Result<usize, MirrorError> {
        let mut cursor = store.load_replication_cursor(CURSOR).await?;
        let mut handled = 0;
        loop {
            let batch = store.replication_batch(cursor, BATCH_SIZE).await?;
            if !batch.complete {
                warn!(cursor, head = batch.head, "change log compacted past the mirror cursor, reconciling");
                for collection in Collection::ALL {
                    handled += self.reconcile(store, collection).await?;
                }
                store.save_replication_cursor(CURSOR, batch.head).await?;
                cursor = batch.head;
                continue;
            }
            if batch.records.is_empty() {
                if batch.head > cursor {
                    store.save_replication_cursor(CURSOR, batch.head).await?;
                }
                return Ok(handled);
            }

            for (seq, record) in batch.records {
                if self.apply_with_retry(&record, stop).await == Delivery::Interrupted {
                    return Ok(handled);
                }
                store.save_replication_cursor(CURSOR, seq).await?;
                cursor = seq;
                handled += 1;
            }
        }
    }

    /// Keep the mirror caught up with `store` while `lease` reads `Holder`.
    ///
    /// Wakes on local commits, and every poll interval for commits made by
    /// other tabs. Returns when `shutdown` flips to `true` or either watch
    /// sender is dropped; anything not yet mirrored stays in the change log.
    pub async fn run(
        self, store: LocalStore, mut lease: watch::Receiver<LeaseState>, mut shutdown: watch::Receiver<bool>,
    ) {
        let mut wake = store.watch_changes();
        let mut stop = shutdown.clone();
        let poll = store.options().poll_interval;
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }

            if *lease.borrow_and_update() == LeaseState::Holder {
                tokio::select! {
                    result = self.replicate(&store, &mut stop) => match result {
                        Ok(0) => {}
                        Ok(handled) => debug!(handled, "mirror caught up"),
                        Err(e) => warn!(error = %e, "mirror replication interrupted"),
                    },
                    changed = lease.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = wake.recv() => {}
                _ = tokio::time::sleep(poll) => {}
                changed = lease.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Replay every acknowledged local entry of `collection` into the mirror.
    ///
    /// Heals rows the change log no longer holds. Returns the number of
    /// records written.
    pub async fn reconcile(&self, store: &LocalStore, collection: Collection) -> Result<usize, MirrorError> {
        let entries = store.authoritative_entries(collection).await?;
        let mut written = 0;
        for entry in entries {
            let record = ChangeRecord { collection, id: entry.id, document: entry.document, token: entry.token };
            self.apply(&record).await?;
            written += 1;
        }
        debug!(%collection, written, "mirror reconciled");
        Ok(written)
    }
}
