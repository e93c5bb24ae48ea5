//! Local store connection management with pragma configuration.
//!
//! Opens the SQLite file shared by every tab, applies the pragmas needed
//! for concurrent access (WAL, busy timeout), and runs the local migrations.

use std::path::Path;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::{Error, migrations};

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA foreign_keys=ON;
     PRAGMA busy_timeout=5000;";

/// Tuning for a [`LocalStore`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Byte quota for live documents. Writes beyond it fail with `CACHE_FULL`.
    pub quota_bytes: u64,
    /// How often subscriptions re-read the change log for writes made by
    /// other tabs, which do not reach this handle's in-process notifier.
    pub poll_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { quota_bytes: 50 * 1024 * 1024, poll_interval: Duration::from_millis(250) }
    }
}

impl StoreOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self { quota_bytes: config.cache_quota_bytes, poll_interval: config.poll_interval() }
    }
}

/// Local cache store handle.
///
/// Wraps a tokio-rusqlite Connection that runs database operations on a
/// background thread. Clones share the connection and the change notifier;
/// separate handles opened on the same file (one per tab) share the data and
/// observe each other's changes through the change log.
#[derive(Clone, Debug)]
pub struct LocalStore {
    pub(crate) conn: Connection,
    pub(crate) notifier: broadcast::Sender<i64>,
    pub(crate) options: StoreOptions,
}

impl LocalStore {
    /// Open the store at the specified path.
    ///
    /// Creates the file if it doesn't exist, applies pragmas, and runs any
    /// pending migrations.
    pub async fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, Error> {
        let conn = Connection::open(path).await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn, options).await
    }

    /// Open the store described by `config.db_path`.
    pub async fn open_with_config(config: &AppConfig) -> Result<Self, Error> {
        Self::open(&config.db_path, StoreOptions::from_config(config)).await
    }

    /// Open an in-memory store for testing.
    pub async fn open_in_memory() -> Result<Self, Error> {
        Self::open_in_memory_with(StoreOptions::default()).await
    }

    pub async fn open_in_memory_with(options: StoreOptions) -> Result<Self, Error> {
        let conn = Connection::open_in_memory().await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn, options).await
    }

    async fn init(conn: Connection, options: StoreOptions) -> Result<Self, Error> {
        conn.call(|conn| conn.execute_batch(PRAGMAS)).await.map_err(Error::Database)?;

        migrations::run(&conn, migrations::LOCAL).await?;

        let (notifier, _) = broadcast::channel(256);
        Ok(Self { conn, notifier, options })
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Wake in-process subscribers after a committed change.
    pub(crate) fn notify(&self, seq: i64) {
        let _ = self.notifier.send(seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let version = store
            .conn
            .call(|conn| conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0)))
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn test_open_file_twice_shares_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.sqlite");

        let first = LocalStore::open(&path, StoreOptions::default()).await.unwrap();
        let second = LocalStore::open(&path, StoreOptions::default()).await.unwrap();

        let mode: String = second
            .conn
            .call(|conn| conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        drop(first);
    }

    #[test]
    fn test_options_from_config() {
        let config = AppConfig { cache_quota_bytes: 1024, poll_interval_ms: 10, ..Default::default() };
        let options = StoreOptions::from_config(&config);
        assert_eq!(options.quota_bytes, 1024);
        assert_eq!(options.poll_interval, Duration::from_millis(10));
    }
}
