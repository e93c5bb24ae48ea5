//! Remote change subscription and its lease-gated driver.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use crmsync_core::{ChangeRecord, Collection, LeaseState, OrderingToken};
use futures_util::stream::{BoxStream, SelectAll};
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{SyncClient, SyncError};
use crate::backoff::Backoff;
use crate::remote::ChangeFilter;

/// Subscription state for one collection.
struct CollectionFeed {
    sync: SyncClient,
    collection: Collection,
    filter: ChangeFilter,
    cursor: Option<OrderingToken>,
    pending: VecDeque<ChangeRecord>,
    backoff: Backoff,
}

impl CollectionFeed {
    async fn cursor(&mut self) -> Result<OrderingToken, SyncError> {
        if let Some(cursor) = self.cursor {
            return Ok(cursor);
        }
        let cursor = self.sync.store().load_cursor(self.collection).await?;
        debug!(collection = %self.collection, %cursor, "resuming remote subscription");
        self.cursor = Some(cursor);
        Ok(cursor)
    }

    /// Apply a record locally, then persist the cursor past it.
    async fn apply(&mut self, record: &ChangeRecord) -> Result<(), SyncError> {
        match self.sync.apply_record(record).await {
            Err(e) if e.is_cache_full() => self.apply_under_pressure(record).await?,
            result => {
                result?;
            }
        }
        self.sync.store().save_cursor(self.collection, record.token).await?;
        self.cursor = Some(record.token);
        Ok(())
    }

    /// Evict to make room for `record`, retrying once. A record that still
    /// does not fit is logged without being cached so the feed moves on.
    async fn apply_under_pressure(&self, record: &ChangeRecord) -> Result<(), SyncError> {
        let store = self.sync.store();
        let tombstones = store.evict_tombstones().await?;
        let live = store.usage().await?.live_entries;
        let evicted = store.evict_oldest(usize::try_from(live / 2).unwrap_or(usize::MAX)).await?;
        warn!(collection = %self.collection, id = %record.id, tombstones, evicted, "local cache full, evicted entries");

        match self.sync.apply_record(record).await {
            Err(e) if e.is_cache_full() => {
                error!(
                    collection = %self.collection,
                    id = %record.id,
                    token = %record.token,
                    error = %e,
                    "change does not fit the local cache; recorded without caching"
                );
                store.record_uncached(record).await?;
                Ok(())
            }
            result => result.map(|_| ()),
        }
    }

    async fn next(&mut self) -> Result<ChangeRecord, SyncError> {
        loop {
            let cursor = match self.cursor().await {
                Ok(cursor) => cursor,
                Err(e) => return Err(self.backoff_with(e).await),
            };

            while let Some(record) = self.pending.pop_front() {
                if record.token <= cursor.max(self.cursor.unwrap_or_default()) {
                    debug!(collection = %self.collection, token = %record.token, "dropping redelivered change");
                    continue;
                }
                if let Err(e) = self.apply(&record).await {
                    self.pending.push_front(record);
                    return Err(self.backoff_with(e).await);
                }
                self.backoff.reset();
                return Ok(record);
            }

            let wait = self.sync.long_poll;
            match self.sync.remote().changes_since(self.collection, cursor, &self.filter, wait).await {
                Ok(mut batch) => {
                    self.backoff.reset();
                    batch.sort_by_key(|record| record.token);
                    self.pending.extend(batch);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        collection = %self.collection,
                        error = %e,
                        attempt = self.backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "remote subscription interrupted, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn backoff_with(&mut self, error: SyncError) -> SyncError {
        let delay = self.backoff.next_delay();
        warn!(collection = %self.collection, error = %error, delay_ms = delay.as_millis() as u64, "change not applied");
        tokio::time::sleep(delay).await;
        error
    }

    fn into_stream(self) -> BoxStream<'static, Result<ChangeRecord, SyncError>> {
        futures_util::stream::unfold(self, |mut feed| async move {
            let item = feed.next().await;
            Some((item, feed))
        })
        .boxed()
    }
}

/// Merged, unbounded feed of remote changes across collections.
///
/// Within a collection records arrive in token order with no gaps. Records
/// are already applied to the local store when yielded. Errors are local
/// store failures; the failed record is retried on the next poll.
pub struct ChangeFeed {
    inner: SelectAll<BoxStream<'static, Result<ChangeRecord, SyncError>>>,
    collections: Vec<Collection>,
}

impl ChangeFeed {
    pub(super) fn new(sync: &SyncClient, collections: &[Collection], filter: &ChangeFilter) -> Self {
        let streams = collections.iter().map(|&collection| {
            CollectionFeed {
                sync: sync.clone(),
                collection,
                filter: filter.clone(),
                cursor: None,
                pending: VecDeque::new(),
                backoff: sync.backoff.clone(),
            }
            .into_stream()
        });
        Self { inner: futures_util::stream::select_all(streams), collections: collections.to_vec() }
    }
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeed").field("collections", &self.collections).finish_non_exhaustive()
    }
}

impl Stream for ChangeFeed {
    type Item = Result<ChangeRecord, SyncError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl SyncClient {
    /// Keep the remote subscription open exactly while `lease` reads `Holder`.
    ///
    /// Records land in the local store and its change log, where other tabs
    /// and the mirror writer pick them up. Returns when `shutdown` flips to
    /// `true` or either watch sender is dropped.
    pub async fn run_while_holder(
        &self, collections: &[Collection], filter: &ChangeFilter, mut lease: watch::Receiver<LeaseState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            loop {
                if *shutdown.borrow_and_update() {
                    return;
                }
                if *lease.borrow_and_update() == LeaseState::Holder {
                    break;
                }
                tokio::select! {
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

            info!(?collections, "lease held, opening remote subscription");
            let mut feed = self.subscribe_all(collections, filter);

            loop {
                tokio::select! {
                    item = feed.next() => match item {
                        Some(Ok(record)) => debug!(
                            collection = %record.collection,
                            id = %record.id,
                            token = %record.token,
                            "remote change applied"
                        ),
                        Some(Err(e)) => warn!(error = %e, "remote change not applied locally"),
                        None => break,
                    },
                    changed = lease.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *lease.borrow_and_update() != LeaseState::Holder {
                            info!("lease lost, closing remote subscription");
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
