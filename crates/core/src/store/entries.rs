//! Keyed document storage with ordering-token guards.
//!
//! Every accepted write updates `entries` and appends to `change_log` in the
//! same transaction, so a subscriber never observes a change that was not
//! committed, and a committed change is never missing from the log.

use serde_json::Value;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, Connection, OptionalExtension, TransactionBehavior};

use super::{LocalStore, now_timestamp};
use crate::Error;
use crate::model::{CREATED_AT_FIELD, ChangeRecord, Collection, Document, OrderingToken, validate_id};

/// A stored entry, live or tombstoned.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub collection: Collection,
    pub id: String,
    /// `None` for a tombstone.
    pub document: Option<Document>,
    /// Highest authoritative token applied to this key.
    pub token: OrderingToken,
    /// Whether the current contents are an unacknowledged optimistic write.
    pub provisional: bool,
    pub updated_at: String,
}

impl CacheEntry {
    pub fn is_tombstone(&self) -> bool {
        self.document.is_none()
    }
}

/// Undo record for an optimistic write.
///
/// Holds the entry as it was before [`LocalStore::put_provisional`] or
/// [`LocalStore::delete_provisional`] so the write can be reverted if the
/// remote store refuses it.
#[derive(Debug, Clone, PartialEq)]
pub struct Provisional {
    pub collection: Collection,
    pub id: String,
    pub(crate) previous: Option<CacheEntry>,
    pub(crate) base_token: OrderingToken,
}

impl Provisional {
    /// Token the optimistic write was based on.
    pub fn base_token(&self) -> OrderingToken {
        self.base_token
    }
}

/// Byte and row accounting for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreUsage {
    pub live_entries: u64,
    pub tombstones: u64,
    pub bytes: u64,
    pub quota_bytes: u64,
}

struct EntryWrite {
    collection: Collection,
    id: String,
    document_json: Option<String>,
    created_at: Option<String>,
    token: OrderingToken,
    provisional: bool,
}

impl EntryWrite {
    fn new(
        collection: Collection, id: String, document: Option<&Document>, token: OrderingToken, provisional: bool,
    ) -> Result<Self, Error> {
        let document_json = document.map(serde_json::to_string).transpose()?;
        let created_at = document.and_then(created_at_of);
        Ok(Self { collection, id, document_json, created_at, token, provisional })
    }

    fn size(&self) -> u64 {
        self.document_json.as_ref().map_or(0, |json| json.len() as u64)
    }
}

fn created_at_of(document: &Document) -> Option<String> {
    match document.get(CREATED_AT_FIELD)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_document(json: Option<String>) -> Result<Option<Document>, Error> {
    json.map(|json| serde_json::from_str::<Document>(&json)).transpose().map_err(Error::from)
}

type EntryRow = (String, Option<String>, i64, i64, String);

fn read_entry(conn: &Connection, collection: Collection, id: &str) -> Result<Option<CacheEntry>, Error> {
    let row: Option<EntryRow> = conn
        .query_row(
            "SELECT id, document_json, token, provisional, updated_at
             FROM entries WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;

    row.map(|row| entry_from_row(collection, row)).transpose()
}

fn entry_from_row(collection: Collection, row: EntryRow) -> Result<CacheEntry, Error> {
    let (id, document_json, token, provisional, updated_at) = row;
    Ok(CacheEntry {
        collection,
        id,
        document: parse_document(document_json)?,
        token: OrderingToken::from_sql(token),
        provisional: provisional == 1,
        updated_at,
    })
}

/// Refuse a write that would push live bytes past the quota.
fn check_quota(conn: &Connection, write: &EntryWrite, quota: u64) -> Result<(), Error> {
    let total: i64 = conn.query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM entries", [], |row| row.get(0))?;
    let existing: i64 = conn
        .query_row(
            "SELECT size_bytes FROM entries WHERE collection = ?1 AND id = ?2",
            params![write.collection.as_str(), &write.id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    let others = u64::try_from(total - existing).unwrap_or(0);
    let needed = write.size();
    if others + needed > quota {
        return Err(Error::CacheFull { needed, available: quota.saturating_sub(others) });
    }
    Ok(())
}

/// Store the entry and append the matching change log row. Returns the log sequence.
fn write_entry(conn: &Connection, write: &EntryWrite) -> Result<i64, Error> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO entries (collection, id, document_json, token, provisional, size_bytes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(collection, id) DO UPDATE SET
            document_json = excluded.document_json,
            token = excluded.token,
            provisional = excluded.provisional,
            size_bytes = excluded.size_bytes,
            created_at = COALESCE(entries.created_at, excluded.created_at),
            updated_at = excluded.updated_at",
        params![
            write.collection.as_str(),
            &write.id,
            &write.document_json,
            write.token.to_sql(),
            write.provisional as i32,
            write.size() as i64,
            &write.created_at,
            &now,
        ],
    )?;
    append_change(conn, write.collection, &write.id, write.document_json.as_deref(), write.token, write.provisional)
}

pub(crate) fn append_change(
    conn: &Connection, collection: Collection, id: &str, document_json: Option<&str>, token: OrderingToken,
    provisional: bool,
) -> Result<i64, Error> {
    conn.execute(
        "INSERT INTO change_log (collection, id, document_json, token, provisional, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![collection.as_str(), id, document_json, token.to_sql(), provisional as i32, now_timestamp()],
    )?;
    Ok(conn.last_insert_rowid())
}

impl LocalStore {
    /// Apply an authoritative upsert.
    ///
    /// A no-op returning `false` when the stored token is greater than or
    /// equal to `token`, so stale and duplicate deliveries never regress an
    /// entry. A provisional entry is replaced, reconciling it.
    ///
    /// # Errors
    ///
    /// Returns `Error::CacheFull` if storing the document would exceed the quota.
    pub async fn put(
        &self, collection: Collection, id: &str, document: Document, token: OrderingToken,
    ) -> Result<bool, Error> {
        validate_id(id)?;
        let write = EntryWrite::new(collection, id.to_string(), Some(&document), token, false)?;
        self.apply_authoritative(write).await
    }

    /// Apply an authoritative delete, leaving a tombstone that carries `token`.
    ///
    /// Same guard as [`LocalStore::put`]: a later, lower-token update cannot
    /// resurrect the entry.
    pub async fn delete(&self, collection: Collection, id: &str, token: OrderingToken) -> Result<bool, Error> {
        validate_id(id)?;
        let write = EntryWrite::new(collection, id.to_string(), None, token, false)?;
        self.apply_authoritative(write).await
    }

    async fn apply_authoritative(&self, write: EntryWrite) -> Result<bool, Error> {
        let quota = self.options.quota_bytes;
        let seq = self
            .conn
            .call(move |conn| -> Result<Option<i64>, Error> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current = read_entry(&tx, write.collection, &write.id)?;
                if current.as_ref().is_some_and(|entry| write.token <= entry.token) {
                    return Ok(None);
                }
                check_quota(&tx, &write, quota)?;
                let seq = write_entry(&tx, &write)?;
                tx.commit()?;
                Ok(Some(seq))
            })
            .await
            .map_err(Error::from)?;

        match seq {
            Some(seq) => {
                self.notify(seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply an optimistic upsert ahead of remote acknowledgement.
    ///
    /// The stored token is left at its current value and the entry is marked
    /// provisional; the acknowledged write (a strictly higher token) replaces it.
    pub async fn put_provisional(
        &self, collection: Collection, id: &str, document: Document,
    ) -> Result<Provisional, Error> {
        validate_id(id)?;
        let write = EntryWrite::new(collection, id.to_string(), Some(&document), OrderingToken::ZERO, true)?;
        self.apply_provisional(write).await
    }

    /// Apply an optimistic delete ahead of remote acknowledgement.
    pub async fn delete_provisional(&self, collection: Collection, id: &str) -> Result<Provisional, Error> {
        validate_id(id)?;
        let write = EntryWrite::new(collection, id.to_string(), None, OrderingToken::ZERO, true)?;
        self.apply_provisional(write).await
    }

    async fn apply_provisional(&self, mut write: EntryWrite) -> Result<Provisional, Error> {
        let quota = self.options.quota_bytes;
        let (seq, provisional) = self
            .conn
            .call(move |conn| -> Result<(i64, Provisional), Error> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let previous = read_entry(&tx, write.collection, &write.id)?;
                let base_token = previous.as_ref().map_or(OrderingToken::ZERO, |entry| entry.token);
                write.token = base_token;
                check_quota(&tx, &write, quota)?;
                let seq = write_entry(&tx, &write)?;
                tx.commit()?;
                Ok((seq, Provisional { collection: write.collection, id: write.id, previous, base_token }))
            })
            .await
            .map_err(Error::from)?;

        self.notify(seq);
        Ok(provisional)
    }

    /// Undo an optimistic write the remote store refused.
    ///
    /// Returns `false` without touching the entry if it has since been
    /// reconciled or overwritten by an authoritative change.
    pub async fn revert_provisional(&self, provisional: &Provisional) -> Result<bool, Error> {
        let owned = provisional.clone();
        let seq = self
            .conn
            .call(move |conn| -> Result<Option<i64>, Error> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current = read_entry(&tx, owned.collection, &owned.id)?;
                let still_ours =
                    current.as_ref().is_some_and(|entry| entry.provisional && entry.token == owned.base_token);
                if !still_ours {
                    return Ok(None);
                }

                let seq = match &owned.previous {
                    Some(previous) => {
                        let write = EntryWrite::new(
                            previous.collection,
                            previous.id.clone(),
                            previous.document.as_ref(),
                            previous.token,
                            previous.provisional,
                        )?;
                        write_entry(&tx, &write)?
                    }
                    None => {
                        tx.execute(
                            "DELETE FROM entries WHERE collection = ?1 AND id = ?2",
                            params![owned.collection.as_str(), &owned.id],
                        )?;
                        append_change(&tx, owned.collection, &owned.id, None, owned.base_token, false)?
                    }
                };
                tx.commit()?;
                Ok(Some(seq))
            })
            .await
            .map_err(Error::from)?;

        match seq {
            Some(seq) => {
                tracing::debug!(
                    collection = %provisional.collection,
                    id = %provisional.id,
                    "reverted optimistic write"
                );
                self.notify(seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Get a live document. Tombstones read as `None`.
    pub async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, Error> {
        Ok(self.get_entry(collection, id).await?.and_then(|entry| entry.document))
    }

    /// Get the stored entry including tombstones and provisional state.
    pub async fn get_entry(&self, collection: Collection, id: &str) -> Result<Option<CacheEntry>, Error> {
        let id = id.to_string();
        self.conn
            .call(move |conn| -> Result<Option<CacheEntry>, Error> { read_entry(conn, collection, &id) })
            .await
            .map_err(Error::from)
    }

    /// List live documents in a collection, newest `createdAt` first.
    pub async fn list(&self, collection: Collection) -> Result<Vec<(String, Document)>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<(String, Document)>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT id, document_json FROM entries
                     WHERE collection = ?1 AND document_json IS NOT NULL
                     ORDER BY created_at DESC, id ASC",
                )?;
                let rows = stmt
                    .query_map(params![collection.as_str()], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<(String, String)>, rusqlite::Error>>()?;

                rows.into_iter()
                    .map(|(id, json)| Ok((id, serde_json::from_str::<Document>(&json)?)))
                    .collect()
            })
            .await
            .map_err(Error::from)
    }

    /// Every acknowledged entry in a collection, tombstones included.
    ///
    /// Provisional entries are skipped; they carry no authoritative token.
    pub async fn authoritative_entries(&self, collection: Collection) -> Result<Vec<CacheEntry>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<CacheEntry>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT id, document_json, token, provisional, updated_at FROM entries
                     WHERE collection = ?1 AND provisional = 0
                     ORDER BY token ASC",
                )?;
                let rows = stmt
                    .query_map(params![collection.as_str()], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<Result<Vec<EntryRow>, rusqlite::Error>>()?;

                rows.into_iter().map(|row| entry_from_row(collection, row)).collect()
            })
            .await
            .map_err(Error::from)
    }

    pub async fn usage(&self) -> Result<StoreUsage, Error> {
        let quota_bytes = self.options.quota_bytes;
        self.conn
            .call(move |conn| -> Result<StoreUsage, Error> {
                let (live, tombstones, bytes): (i64, i64, i64) = conn.query_row(
                    "SELECT
                        COALESCE(SUM(document_json IS NOT NULL), 0),
                        COALESCE(SUM(document_json IS NULL), 0),
                        COALESCE(SUM(size_bytes), 0)
                     FROM entries",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                Ok(StoreUsage {
                    live_entries: live as u64,
                    tombstones: tombstones as u64,
                    bytes: bytes as u64,
                    quota_bytes,
                })
            })
            .await
            .map_err(Error::from)
    }

    /// Delete acknowledged tombstones.
    ///
    /// Once a tombstone is gone a stale update for that key can be applied
    /// again, so only call this when the subscription cursor is past every
    /// token that could still be in flight.
    ///
    /// Returns the number of deleted entries.
    pub async fn evict_tombstones(&self) -> Result<u64, Error> {
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count =
                    conn.execute("DELETE FROM entries WHERE document_json IS NULL AND provisional = 0", [])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Evict least recently written acknowledged documents until at most
    /// `max_entries` live documents remain. Provisional entries are kept.
    ///
    /// Returns the number of deleted entries.
    pub async fn evict_oldest(&self, max_entries: usize) -> Result<u64, Error> {
        let max = max_entries as i64;
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM entries WHERE document_json IS NOT NULL", [], |row| {
                        row.get(0)
                    })?;
                if count <= max {
                    return Ok(0);
                }

                let to_delete = count - max;
                let deleted = conn.execute(
                    "DELETE FROM entries WHERE rowid IN (
                        SELECT rowid FROM entries
                        WHERE document_json IS NOT NULL AND provisional = 0
                        ORDER BY updated_at ASC, token ASC LIMIT ?1
                    )",
                    params![to_delete],
                )?;
                Ok(deleted as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Log an authoritative change without caching its document.
    ///
    /// For changes that do not fit the quota: subscribers and replicas still
    /// see the change, and an older acknowledged entry for the key is dropped
    /// so reads fall back to the remote store instead of serving it. A
    /// pending optimistic write for the key is left alone.
    ///
    /// Returns `false` if the cached entry already carries `token` or newer.
    pub async fn record_uncached(&self, record: &ChangeRecord) -> Result<bool, Error> {
        let document_json = record.document.as_ref().map(serde_json::to_string).transpose()?;
        let record = record.clone();
        let seq = self
            .conn
            .call(move |conn| -> Result<Option<i64>, Error> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current = read_entry(&tx, record.collection, &record.id)?;
                if current.as_ref().is_some_and(|entry| record.token <= entry.token) {
                    return Ok(None);
                }
                if current.as_ref().is_some_and(|entry| !entry.provisional) {
                    tx.execute(
                        "DELETE FROM entries WHERE collection = ?1 AND id = ?2",
                        params![record.collection.as_str(), &record.id],
                    )?;
                }
                let seq =
                    append_change(&tx, record.collection, &record.id, document_json.as_deref(), record.token, false)?;
                tx.commit()?;
                Ok(Some(seq))
            })
            .await
            .map_err(Error::from)?;

        match seq {
            Some(seq) => {
                self.notify(seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        crate::model::document_from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let applied = store
            .put(Collection::Clients, "c1", doc(json!({"name": "Alice"})), OrderingToken(7))
            .await
            .unwrap();
        assert!(applied);

        let entry = store.get_entry(Collection::Clients, "c1").await.unwrap().unwrap();
        assert_eq!(entry.token, OrderingToken(7));
        assert!(!entry.provisional);
        assert_eq!(entry.document.unwrap()["name"], "Alice");
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = LocalStore::open_in_memory().await.unwrap();
        assert!(store.get(Collection::Cases, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_puts_are_noops() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.put(Collection::Clients, "c1", doc(json!({"name": "v2"})), OrderingToken(5)).await.unwrap();

        assert!(!store.put(Collection::Clients, "c1", doc(json!({"name": "v1"})), OrderingToken(4)).await.unwrap());
        assert!(!store.put(Collection::Clients, "c1", doc(json!({"name": "dup"})), OrderingToken(5)).await.unwrap());

        let current = store.get(Collection::Clients, "c1").await.unwrap().unwrap();
        assert_eq!(current["name"], "v2");
    }

    #[tokio::test]
    async fn test_delete_blocks_late_lower_token_update() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.put(Collection::Clients, "c1", doc(json!({"name": "Alice"})), OrderingToken(7)).await.unwrap();
        assert!(store.delete(Collection::Clients, "c1", OrderingToken(8)).await.unwrap());

        let late = store.put(Collection::Clients, "c1", doc(json!({"name": "Alice v0"})), OrderingToken(6)).await;
        assert!(!late.unwrap());
        assert!(store.get(Collection::Clients, "c1").await.unwrap().is_none());

        let entry = store.get_entry(Collection::Clients, "c1").await.unwrap().unwrap();
        assert!(entry.is_tombstone());
        assert_eq!(entry.token, OrderingToken(8));
    }

    #[tokio::test]
    async fn test_delete_unknown_key_records_tombstone() {
        let store = LocalStore::open_in_memory().await.unwrap();
        assert!(store.delete(Collection::Cases, "k1", OrderingToken(3)).await.unwrap());
        assert!(!store.put(Collection::Cases, "k1", doc(json!({"status": "open"})), OrderingToken(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_provisional_then_reconcile() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let provisional =
            store.put_provisional(Collection::Clients, "c1", doc(json!({"name": "Alice"}))).await.unwrap();
        assert_eq!(provisional.base_token(), OrderingToken::ZERO);

        let entry = store.get_entry(Collection::Clients, "c1").await.unwrap().unwrap();
        assert!(entry.provisional);
        assert_eq!(entry.document.unwrap()["name"], "Alice");

        assert!(store.put(Collection::Clients, "c1", doc(json!({"name": "Alice"})), OrderingToken(7)).await.unwrap());
        let entry = store.get_entry(Collection::Clients, "c1").await.unwrap().unwrap();
        assert!(!entry.provisional);
        assert_eq!(entry.token, OrderingToken(7));

        assert!(!store.revert_provisional(&provisional).await.unwrap());
    }

    #[tokio::test]
    async fn test_revert_restores_previous_document() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.put(Collection::Cases, "k1", doc(json!({"status": "open"})), OrderingToken(3)).await.unwrap();

        let provisional =
            store.put_provisional(Collection::Cases, "k1", doc(json!({"status": "closed"}))).await.unwrap();
        assert!(store.revert_provisional(&provisional).await.unwrap());

        let entry = store.get_entry(Collection::Cases, "k1").await.unwrap().unwrap();
        assert_eq!(entry.document.unwrap()["status"], "open");
        assert_eq!(entry.token, OrderingToken(3));
        assert!(!entry.provisional);
    }

    #[tokio::test]
    async fn test_revert_of_new_entry_removes_it() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let provisional = store.put_provisional(Collection::Users, "u1", doc(json!({"role": "admin"}))).await.unwrap();
        assert!(store.revert_provisional(&provisional).await.unwrap());
        assert!(store.get_entry(Collection::Users, "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_provisional_delete_revert() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.put(Collection::Clients, "c1", doc(json!({"name": "Alice"})), OrderingToken(2)).await.unwrap();

        let provisional = store.delete_provisional(Collection::Clients, "c1").await.unwrap();
        assert!(store.get(Collection::Clients, "c1").await.unwrap().is_none());

        store.revert_provisional(&provisional).await.unwrap();
        assert!(store.get(Collection::Clients, "c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_quota_refuses_write() {
        let options = StoreOptions { quota_bytes: 64, ..StoreOptions::default() };
        let store = LocalStore::open_in_memory_with(options).await.unwrap();
        store.put(Collection::Clients, "small", doc(json!({"n": "x"})), OrderingToken(1)).await.unwrap();

        let big = doc(json!({"notes": "y".repeat(200)}));
        let result = store.put(Collection::Clients, "big", big, OrderingToken(2)).await;
        assert!(matches!(result, Err(Error::CacheFull { .. })));
        assert!(store.get(Collection::Clients, "big").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uncached_change_drops_stale_entry() {
        let options = StoreOptions { quota_bytes: 64, ..StoreOptions::default() };
        let store = LocalStore::open_in_memory_with(options).await.unwrap();
        store.put(Collection::Clients, "c1", doc(json!({"n": "x"})), OrderingToken(5)).await.unwrap();

        let notes = doc(json!({"notes": "y".repeat(200)}));
        let stale = ChangeRecord::upsert(Collection::Clients, "c1", notes.clone(), OrderingToken(3));
        assert!(!store.record_uncached(&stale).await.unwrap());

        let big = ChangeRecord::upsert(Collection::Clients, "c1", notes, OrderingToken(6));
        assert!(store.record_uncached(&big).await.unwrap());
        assert!(store.get_entry(Collection::Clients, "c1").await.unwrap().is_none());

        let logged = store.changes_after(Collection::Clients, 0, 10).await.unwrap();
        assert_eq!(logged.last().map(|(_, record)| record), Some(&big));
    }

    #[tokio::test]
    async fn test_list_orders_by_created_at_desc() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .put(Collection::Cases, "old", doc(json!({"createdAt": "2024-01-01T00:00:00Z"})), OrderingToken(1))
            .await
            .unwrap();
        store
            .put(Collection::Cases, "new", doc(json!({"createdAt": "2024-06-01T00:00:00Z"})), OrderingToken(2))
            .await
            .unwrap();
        store.delete(Collection::Cases, "gone", OrderingToken(3)).await.unwrap();

        let ids: Vec<String> = store.list(Collection::Cases).await.unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    }

    #[tokio::test]
    async fn test_evictions() {
        let store = LocalStore::open_in_memory().await.unwrap();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            store.put(Collection::Clients, id, doc(json!({"i": i})), OrderingToken(i as u64 + 1)).await.unwrap();
        }
        store.delete(Collection::Clients, "d", OrderingToken(9)).await.unwrap();

        assert_eq!(store.evict_tombstones().await.unwrap(), 1);
        assert_eq!(store.evict_oldest(2).await.unwrap(), 1);
        assert!(store.get(Collection::Clients, "a").await.unwrap().is_none());

        let usage = store.usage().await.unwrap();
        assert_eq!(usage.live_entries, 2);
        assert_eq!(usage.tombstones, 0);
    }

    #[tokio::test]
    async fn test_empty_id_rejected() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let result = store.put(Collection::Clients, " ", Document::new(), OrderingToken(1)).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
