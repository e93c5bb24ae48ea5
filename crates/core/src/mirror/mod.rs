//! Relational mirror of the CRM collections.
//!
//! A separate SQLite database with one table per collection. Rows carry the
//! ordering token of the change that produced them, and deletes leave a
//! tombstone, so replayed or reordered changes cannot regress a row.

mod rows;
pub mod schema;

use std::path::Path;

use tokio_rusqlite::Connection;

use crate::{Error, migrations};

/// Mirror database handle.
#[derive(Clone, Debug)]
pub struct MirrorDb {
    pub(crate) conn: Connection,
}

impl MirrorDb {
    /// Open the mirror database at the specified path, running migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path).await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    /// Open an in-memory mirror for testing.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, Error> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;",
            )
        })
        .await
        .map_err(Error::Database)?;

        migrations::run(&conn, migrations::MIRROR).await?;

        Ok(Self { conn })
    }
}
