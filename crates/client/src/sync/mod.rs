//! Remote sync client.
//!
//! Writes go to the local store optimistically, then to the remote store
//! with retries; the acknowledged token reconciles the local entry and a
//! refusal reverts it. Reads are served from the local store, which the
//! lease holder keeps current through [`SyncClient::subscribe_all`].

pub mod error;
mod feed;

pub use error::SyncError;
pub use feed::ChangeFeed;

use std::sync::Arc;
use std::time::Duration;

use crmsync_core::model::{CREATED_AT_FIELD, OWNER_ID_FIELD};
use crmsync_core::store::{Provisional, generate_id};
use crmsync_core::{AppConfig, ChangeRecord, Collection, Document, LocalStore, OrderingToken};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::remote::{ChangeFilter, RemoteStore};

type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Write and subscription front end over the local and remote stores.
#[derive(Clone)]
pub struct SyncClient {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    owner_id: Option<String>,
    write_attempts: u32,
    backoff: Backoff,
    long_poll: Duration,
    id_generator: IdGenerator,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("owner_id", &self.owner_id)
            .field("write_attempts", &self.write_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            remote,
            owner_id: None,
            write_attempts: 3,
            backoff: Backoff::default(),
            long_poll: Duration::from_secs(25),
            id_generator: Arc::new(generate_id),
        }
    }

    pub fn from_config(store: LocalStore, remote: Arc<dyn RemoteStore>, config: &AppConfig) -> Self {
        Self {
            owner_id: config.owner_id.clone(),
            write_attempts: config.write_attempts.max(1),
            backoff: Backoff::from_config(config),
            ..Self::new(store, remote)
        }
    }

    /// Stamp documents without an owner with `owner_id`.
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Backoff) -> Self {
        self.write_attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// How long one subscription poll may wait on the remote store.
    pub fn with_long_poll(mut self, wait: Duration) -> Self {
        self.long_poll = wait;
        self
    }

    pub fn with_id_generator(mut self, generator: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.id_generator = Arc::new(generator);
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Write a document, generating an id when `id` is `None`.
    ///
    /// The local store reflects the write before this returns, even while the
    /// remote call is outstanding. `createdAt` is set on first write and kept
    /// afterwards; `ownerId` is filled in when missing.
    ///
    /// # Errors
    ///
    /// Returns the remote error once retries are exhausted or the write is
    /// refused; the optimistic local write is reverted first. Returns
    /// `CACHE_FULL` if the local store cannot hold the document. Once the
    /// remote store has acknowledged the write this returns `Ok`; a failure
    /// to record the acknowledgement locally is logged and healed by the
    /// subscription.
    pub async fn write(
        &self, collection: Collection, id: Option<&str>, document: Document,
    ) -> Result<String, SyncError> {
        let id = match id {
            Some(id) => id.to_string(),
            None => (self.id_generator)(),
        };

        let document = self.stamp(collection, &id, document).await?;
        let provisional = self.store.put_provisional(collection, &id, document.clone()).await?;

        match self.with_retries(|| self.remote.write(collection, &id, &document)).await {
            Ok(token) => {
                match self.store.put(collection, &id, document, token).await {
                    Ok(_) => debug!(%collection, %id, %token, "write acknowledged"),
                    Err(e) => {
                        warn!(%collection, %id, %token, error = %e, "write acknowledged but not recorded locally")
                    }
                }
                Ok(id)
            }
            Err(e) => {
                self.revert(&provisional).await;
                Err(e)
            }
        }
    }

    /// Delete a document. Same optimistic and revert behavior as [`SyncClient::write`].
    pub async fn delete(&self, collection: Collection, id: &str) -> Result<(), SyncError> {
        let provisional = self.store.delete_provisional(collection, id).await?;

        match self.with_retries(|| self.remote.delete(collection, id)).await {
            Ok(token) => {
                match self.store.delete(collection, id, token).await {
                    Ok(_) => debug!(%collection, %id, %token, "delete acknowledged"),
                    Err(e) => {
                        warn!(%collection, %id, %token, error = %e, "delete acknowledged but not recorded locally")
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.revert(&provisional).await;
                Err(e)
            }
        }
    }

    /// Apply an observed remote change to the local store.
    ///
    /// Returns `false` when the store already holds an equal or newer token.
    pub async fn apply_record(&self, record: &ChangeRecord) -> Result<bool, SyncError> {
        let applied = match &record.document {
            Some(document) => self.store.put(record.collection, &record.id, document.clone(), record.token).await?,
            None => self.store.delete(record.collection, &record.id, record.token).await?,
        };
        Ok(applied)
    }

    /// Merged remote feed for `collections`, resuming from each stored cursor.
    ///
    /// Each record is applied to the local store and the cursor advanced
    /// before it is yielded.
    pub fn subscribe_all(&self, collections: &[Collection], filter: &ChangeFilter) -> ChangeFeed {
        ChangeFeed::new(self, collections, filter)
    }

    async fn stamp(&self, collection: Collection, id: &str, mut document: Document) -> Result<Document, SyncError> {
        let existing = self.store.get(collection, id).await?;
        let created_at = existing
            .as_ref()
            .and_then(|doc| doc.get(CREATED_AT_FIELD))
            .filter(|value| !value.is_null())
            .cloned()
            .or_else(|| document.get(CREATED_AT_FIELD).filter(|value| !value.is_null()).cloned())
            .unwrap_or_else(|| Value::String(chrono::Utc::now().to_rfc3339()));
        document.insert(CREATED_AT_FIELD.into(), created_at);

        if let Some(owner) = &self.owner_id
            && document.get(OWNER_ID_FIELD).is_none_or(Value::is_null)
        {
            document.insert(OWNER_ID_FIELD.into(), Value::String(owner.clone()));
        }
        Ok(document)
    }

    async fn with_retries<F, Fut>(&self, mut call: F) -> Result<OrderingToken, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<OrderingToken, SyncError>>,
    {
        let mut backoff = self.backoff.clone();
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(token) => return Ok(token),
                Err(e) if e.is_transient() && attempt < self.write_attempts => {
                    let delay = backoff.next_delay();
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "remote write failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn revert(&self, provisional: &Provisional) {
        match self.store.revert_provisional(provisional).await {
            Ok(true) => debug!(collection = %provisional.collection, id = %provisional.id, "optimistic write reverted"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to revert optimistic write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InjectedFailure, MemoryRemoteStore};
    use serde_json::json;

    fn doc(value: Value) -> Document {
        crmsync_core::model::document_from_value(value).unwrap()
    }

    async fn client(remote: Arc<MemoryRemoteStore>) -> SyncClient {
        let store = LocalStore::open_in_memory().await.unwrap();
        SyncClient::new(store, remote)
            .with_owner("u1")
            .with_retry(3, Backoff::new(Duration::from_millis(1), Duration::from_millis(5)))
    }

    #[tokio::test]
    async fn test_write_is_acknowledged_with_remote_token() {
        let remote = Arc::new(MemoryRemoteStore::with_start_token(6));
        let sync = client(remote.clone()).await.with_id_generator(|| "c1".to_string());

        let id = sync.write(Collection::Clients, None, doc(json!({"name": "Alice"}))).await.unwrap();
        assert_eq!(id, "c1");

        let entry = sync.store().get_entry(Collection::Clients, "c1").await.unwrap().unwrap();
        assert_eq!(entry.token, OrderingToken(7));
        assert!(!entry.provisional);
        let stored = entry.document.unwrap();
        assert_eq!(stored["ownerId"], "u1");
        assert!(stored["createdAt"].is_string());
    }

    #[tokio::test]
    async fn test_created_at_is_kept_on_update() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let sync = client(remote).await;

        let id = sync.write(Collection::Cases, None, doc(json!({"status": "open"}))).await.unwrap();
        let created = sync.store().get(Collection::Cases, &id).await.unwrap().unwrap()["createdAt"].clone();

        let update = doc(json!({"status": "closed", "createdAt": "1999-01-01T00:00:00Z"}));
        sync.write(Collection::Cases, Some(&id), update).await.unwrap();
        let stored = sync.store().get(Collection::Cases, &id).await.unwrap().unwrap();
        assert_eq!(stored["status"], "closed");
        assert_eq!(stored["createdAt"], created);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.fail_writes([InjectedFailure::Unavailable, InjectedFailure::Timeout]);
        let sync = client(remote.clone()).await;

        let id = sync.write(Collection::Clients, None, doc(json!({"name": "Bob"}))).await.unwrap();
        assert!(sync.store().get(Collection::Clients, &id).await.unwrap().is_some());
        assert_eq!(remote.log().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_write_reverts_and_surfaces() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.fail_writes([InjectedFailure::PermissionDenied]);
        let sync = client(remote).await;

        let result = sync.write(Collection::Clients, Some("c9"), doc(json!({"name": "Eve"}))).await;
        assert!(matches!(result, Err(SyncError::PermissionDenied(_))));
        assert!(sync.store().get_entry(Collection::Clients, "c9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_retries_revert_update() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let sync = client(remote.clone()).await;
        sync.write(Collection::Cases, Some("k1"), doc(json!({"status": "open"}))).await.unwrap();

        remote.fail_writes(std::iter::repeat_n(InjectedFailure::Unavailable, 3));
        let result = sync.write(Collection::Cases, Some("k1"), doc(json!({"status": "closed"}))).await;
        assert!(result.unwrap_err().is_transient());

        let stored = sync.store().get(Collection::Cases, "k1").await.unwrap().unwrap();
        assert_eq!(stored["status"], "open");
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let sync = client(remote).await;
        let id = sync.write(Collection::Users, None, doc(json!({"role": "staff"}))).await.unwrap();

        sync.delete(Collection::Users, &id).await.unwrap();
        let entry = sync.store().get_entry(Collection::Users, &id).await.unwrap().unwrap();
        assert!(entry.is_tombstone());
        assert_eq!(entry.token, OrderingToken(2));
    }

    /// Acknowledges writes, then makes the local store refuse to record them.
    struct BreaksLocalOnAck {
        inner: MemoryRemoteStore,
        local_path: std::path::PathBuf,
    }

    impl BreaksLocalOnAck {
        fn refuse_local_acks(&self) {
            let conn = tokio_rusqlite::rusqlite::Connection::open(&self.local_path).unwrap();
            conn.execute_batch(
                "CREATE TRIGGER IF NOT EXISTS refuse_ack BEFORE UPDATE ON entries WHEN NEW.provisional = 0
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();
        }
    }

    #[async_trait::async_trait]
    impl RemoteStore for BreaksLocalOnAck {
        async fn write(
            &self, collection: Collection, id: &str, document: &Document,
        ) -> Result<OrderingToken, SyncError> {
            let token = self.inner.write(collection, id, document).await?;
            self.refuse_local_acks();
            Ok(token)
        }

        async fn delete(&self, collection: Collection, id: &str) -> Result<OrderingToken, SyncError> {
            let token = self.inner.delete(collection, id).await?;
            self.refuse_local_acks();
            Ok(token)
        }

        async fn changes_since(
            &self, collection: Collection, since: OrderingToken, filter: &ChangeFilter, wait: Duration,
        ) -> Result<Vec<ChangeRecord>, SyncError> {
            self.inner.changes_since(collection, since, filter, wait).await
        }
    }

    #[tokio::test]
    async fn test_acknowledged_write_succeeds_when_local_record_fails() {
        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("local.sqlite");
        let store = LocalStore::open(&local_path, crmsync_core::StoreOptions::default()).await.unwrap();
        let remote = Arc::new(BreaksLocalOnAck { inner: MemoryRemoteStore::new(), local_path });
        let sync = SyncClient::new(store, remote.clone()).with_id_generator(|| "c1".to_string());

        let id = sync.write(Collection::Clients, None, doc(json!({"name": "Alice"}))).await.unwrap();
        assert_eq!(id, "c1");
        assert_eq!(remote.inner.log().len(), 1);

        let entry = sync.store().get_entry(Collection::Clients, "c1").await.unwrap().unwrap();
        assert!(entry.provisional);
        assert_eq!(entry.document.unwrap()["name"], "Alice");

        sync.delete(Collection::Clients, "c1").await.unwrap();
        assert_eq!(remote.inner.log().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_record_ignores_stale() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let sync = client(remote).await;

        let tombstone = ChangeRecord::tombstone(Collection::Clients, "c1", OrderingToken(8));
        let late = ChangeRecord::upsert(Collection::Clients, "c1", doc(json!({"name": "Alice"})), OrderingToken(7));
        assert!(sync.apply_record(&tombstone).await.unwrap());
        assert!(!sync.apply_record(&late).await.unwrap());
        assert!(sync.store().get(Collection::Clients, "c1").await.unwrap().is_none());
    }
}
