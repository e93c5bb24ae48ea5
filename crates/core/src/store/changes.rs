//! Change log reads and restartable subscriptions.
//!
//! A subscription tracks a change log sequence number. Writes from this
//! handle wake it through the in-process notifier; writes from other tabs
//! (other handles on the same file) are picked up by polling at
//! `StoreOptions::poll_interval`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::broadcast;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

use super::LocalStore;
use crate::Error;
use crate::model::{ChangeRecord, Collection, Document, OrderingToken};

const PAGE_SIZE: i64 = 256;

type Predicate = Arc<dyn Fn(&ChangeRecord) -> bool + Send + Sync>;

/// Authoritative changes read for a downstream replica.
#[derive(Debug, Clone, Default)]
pub struct ReplicationBatch {
    /// Changes after the requested sequence, oldest first.
    pub records: Vec<(i64, ChangeRecord)>,
    /// Highest sequence in the log when the batch was read. With no records,
    /// everything up to `head` is provisional or already read.
    pub head: i64,
    /// `false` when compaction dropped changes the replica never read; the
    /// replica must be rebuilt from the entries table before continuing.
    pub complete: bool,
}

impl LocalStore {
    /// Highest change log sequence number, or 0 for an empty log.
    pub async fn latest_change_seq(&self) -> Result<i64, Error> {
        self.conn
            .call(|conn| -> Result<i64, Error> {
                let seq = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM change_log", [], |row| row.get(0))?;
                Ok(seq)
            })
            .await
            .map_err(Error::from)
    }

    /// Changes to `collection` after sequence `after`, oldest first.
    pub async fn changes_after(
        &self, collection: Collection, after: i64, limit: i64,
    ) -> Result<Vec<(i64, ChangeRecord)>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<(i64, ChangeRecord)>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT seq, id, document_json, token FROM change_log
                     WHERE collection = ?1 AND seq > ?2
                     ORDER BY seq ASC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![collection.as_str(), after, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<(i64, String, Option<String>, i64)>, rusqlite::Error>>()?;

                rows.into_iter()
                    .map(|(seq, id, json, token)| {
                        let document = json.map(|json| serde_json::from_str::<Document>(&json)).transpose()?;
                        Ok((seq, ChangeRecord { collection, id, document, token: OrderingToken::from_sql(token) }))
                    })
                    .collect()
            })
            .await
            .map_err(Error::from)
    }

    /// Authoritative changes across every collection after sequence `after`.
    ///
    /// Provisional writes and reverted new entries (token zero) are skipped.
    pub async fn replication_batch(&self, after: i64, limit: i64) -> Result<ReplicationBatch, Error> {
        self.conn
            .call(move |conn| -> Result<ReplicationBatch, Error> {
                let tx = conn.transaction()?;
                let (oldest, head): (Option<i64>, i64) =
                    tx.query_row("SELECT MIN(seq), COALESCE(MAX(seq), 0) FROM change_log", [], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?;
                let rows = {
                    let mut stmt = tx.prepare(
                        "SELECT seq, collection, id, document_json, token FROM change_log
                         WHERE seq > ?1 AND provisional = 0 AND token > 0
                         ORDER BY seq ASC LIMIT ?2",
                    )?;
                    stmt.query_map(params![after, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<Result<Vec<(i64, String, String, Option<String>, i64)>, rusqlite::Error>>()?
                };
                tx.commit()?;

                let records = rows
                    .into_iter()
                    .map(|(seq, collection, id, json, token)| {
                        let collection: Collection = collection.parse()?;
                        let document = json.map(|json| serde_json::from_str::<Document>(&json)).transpose()?;
                        Ok((seq, ChangeRecord { collection, id, document, token: OrderingToken::from_sql(token) }))
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                let complete = oldest.is_none_or(|oldest| oldest <= after + 1);
                Ok(ReplicationBatch { records, head, complete })
            })
            .await
            .map_err(Error::from)
    }

    /// Number of rows currently in the change log.
    pub async fn change_log_len(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM change_log", [], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Wake-ups for changes committed through this handle.
    ///
    /// Carries the change log sequence number; writes from other handles are
    /// only visible by polling.
    pub fn watch_changes(&self) -> broadcast::Receiver<i64> {
        self.notifier.subscribe()
    }

    /// Drop change log rows, keeping the newest `keep_last` (at least one).
    ///
    /// Subscriptions whose cursor falls behind the compacted range skip the
    /// dropped changes; the entries table still holds the current state.
    pub async fn compact_change_log(&self, keep_last: u64) -> Result<u64, Error> {
        let keep = i64::try_from(keep_last.max(1)).unwrap_or(i64::MAX);
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute(
                    "DELETE FROM change_log WHERE seq <= (SELECT COALESCE(MAX(seq), 0) FROM change_log) - ?1",
                    params![keep],
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Subscribe to changes in `collection` made after this call.
    ///
    /// Only records matching `predicate` are yielded; the cursor advances
    /// past the rest.
    pub async fn subscribe<F>(&self, collection: Collection, predicate: F) -> Result<Subscription, Error>
    where
        F: Fn(&ChangeRecord) -> bool + Send + Sync + 'static,
    {
        let head = self.latest_change_seq().await?;
        Ok(self.subscribe_from(collection, head, predicate))
    }

    /// Subscribe starting after change log sequence `cursor`.
    ///
    /// Pass a previous [`Subscription::cursor`] to resume without gaps.
    pub fn subscribe_from<F>(&self, collection: Collection, cursor: i64, predicate: F) -> Subscription
    where
        F: Fn(&ChangeRecord) -> bool + Send + Sync + 'static,
    {
        Subscription {
            store: self.clone(),
            collection,
            predicate: Arc::new(predicate),
            cursor,
            pending: VecDeque::new(),
            wake: self.notifier.subscribe(),
        }
    }
}

/// An unbounded, ordered feed of change records for one collection.
pub struct Subscription {
    store: LocalStore,
    collection: Collection,
    predicate: Predicate,
    cursor: i64,
    pending: VecDeque<(i64, ChangeRecord)>,
    wake: broadcast::Receiver<i64>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("collection", &self.collection)
            .field("cursor", &self.cursor)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Sequence number of the last record handed out or skipped.
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Wait for the next matching record.
    ///
    /// # Errors
    ///
    /// Returns the storage error if reading the change log fails; the
    /// subscription stays usable and retries from the same cursor.
    pub async fn next(&mut self) -> Result<ChangeRecord, Error> {
        loop {
            while let Some((seq, record)) = self.pending.pop_front() {
                self.cursor = seq;
                if (self.predicate)(&record) {
                    return Ok(record);
                }
            }

            let page = self.store.changes_after(self.collection, self.cursor, PAGE_SIZE).await?;
            if !page.is_empty() {
                self.pending.extend(page);
                continue;
            }

            tokio::select! {
                woke = self.wake.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = woke {
                        tokio::time::sleep(self.store.options.poll_interval).await;
                    }
                }
                _ = tokio::time::sleep(self.store.options.poll_interval) => {}
            }
        }
    }

    /// Turn the subscription into a `Stream`. The stream never ends on its own.
    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeRecord, Error>> + Send {
        futures_util::stream::unfold(self, |mut subscription| async move {
            let item = subscription.next().await;
            Some((item, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn doc(value: serde_json::Value) -> Document {
        crate::model::document_from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_subscription_sees_later_writes_only() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.put(Collection::Clients, "before", doc(json!({"n": 1})), OrderingToken(1)).await.unwrap();

        let mut sub = store.subscribe(Collection::Clients, |_| true).await.unwrap();
        store.put(Collection::Clients, "after", doc(json!({"n": 2})), OrderingToken(2)).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap();
        assert_eq!(record.id, "after");
        assert_eq!(record.token, OrderingToken(2));
    }

    #[tokio::test]
    async fn test_subscription_filters_by_collection_and_predicate() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut sub = store
            .subscribe(Collection::Cases, |record| record.document.as_ref().is_some_and(|d| d["ownerId"] == "u1"))
            .await
            .unwrap();

        store.put(Collection::Clients, "c1", doc(json!({"ownerId": "u1"})), OrderingToken(1)).await.unwrap();
        store.put(Collection::Cases, "k1", doc(json!({"ownerId": "u2"})), OrderingToken(2)).await.unwrap();
        store.put(Collection::Cases, "k2", doc(json!({"ownerId": "u1"})), OrderingToken(3)).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap();
        assert_eq!(record.id, "k2");
    }

    #[tokio::test]
    async fn test_subscription_resumes_from_cursor() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut sub = store.subscribe(Collection::Users, |_| true).await.unwrap();
        store.put(Collection::Users, "u1", doc(json!({})), OrderingToken(1)).await.unwrap();
        sub.next().await.unwrap();
        let cursor = sub.cursor();
        drop(sub);

        store.put(Collection::Users, "u2", doc(json!({})), OrderingToken(2)).await.unwrap();
        store.delete(Collection::Users, "u1", OrderingToken(3)).await.unwrap();

        let ids: Vec<(String, bool)> = store
            .subscribe_from(Collection::Users, cursor, |_| true)
            .into_stream()
            .take(2)
            .map(|r| r.map(|record| (record.id.clone(), record.is_delete())).unwrap())
            .collect()
            .await;
        assert_eq!(ids, vec![("u2".to_string(), false), ("u1".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_other_handle_writes_are_polled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.sqlite");
        let options = StoreOptions { poll_interval: Duration::from_millis(10), ..StoreOptions::default() };

        let tab_a = LocalStore::open(&path, options).await.unwrap();
        let tab_b = LocalStore::open(&path, options).await.unwrap();

        let mut sub = tab_b.subscribe(Collection::Clients, |_| true).await.unwrap();
        tab_a.put(Collection::Clients, "c1", doc(json!({"name": "Alice"})), OrderingToken(7)).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap();
        assert_eq!(record.id, "c1");
        assert_eq!(record.token, OrderingToken(7));
    }

    #[tokio::test]
    async fn test_compact_change_log() {
        let store = LocalStore::open_in_memory().await.unwrap();
        for i in 1..=5 {
            store.put(Collection::Clients, &format!("c{i}"), doc(json!({})), OrderingToken(i)).await.unwrap();
        }
        assert_eq!(store.compact_change_log(2).await.unwrap(), 3);
        assert_eq!(store.changes_after(Collection::Clients, 0, 100).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_compaction_keeps_newest_row() {
        let store = LocalStore::open_in_memory().await.unwrap();
        for i in 1..=3 {
            store.put(Collection::Cases, &format!("k{i}"), doc(json!({})), OrderingToken(i)).await.unwrap();
        }
        assert_eq!(store.compact_change_log(0).await.unwrap(), 2);
        assert_eq!(store.change_log_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replication_batch_skips_provisional_changes() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.put(Collection::Clients, "c1", doc(json!({"name": "Alice"})), OrderingToken(1)).await.unwrap();
        let pending = store.put_provisional(Collection::Cases, "k1", doc(json!({"amount": 5}))).await.unwrap();
        store.revert_provisional(&pending).await.unwrap();
        store.delete(Collection::Clients, "c1", OrderingToken(2)).await.unwrap();

        let batch = store.replication_batch(0, 100).await.unwrap();
        assert!(batch.complete);
        let records: Vec<(Collection, String, bool)> =
            batch.records.iter().map(|(_, r)| (r.collection, r.id.clone(), r.is_delete())).collect();
        assert_eq!(
            records,
            vec![(Collection::Clients, "c1".to_string(), false), (Collection::Clients, "c1".to_string(), true)]
        );

        let last = batch.records[1].0;
        assert_eq!(batch.head, last);
        assert!(store.replication_batch(last, 100).await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_replication_batch_reports_compaction_gap() {
        let store = LocalStore::open_in_memory().await.unwrap();
        for i in 1..=4 {
            store.put(Collection::Users, &format!("u{i}"), doc(json!({})), OrderingToken(i)).await.unwrap();
        }
        store.compact_change_log(1).await.unwrap();

        let batch = store.replication_batch(0, 100).await.unwrap();
        assert!(!batch.complete);
        assert_eq!(batch.records.len(), 1);
        assert!(store.replication_batch(3, 100).await.unwrap().complete);
    }
}
