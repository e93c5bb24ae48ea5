//! Resume cursors for the remote subscription and for downstream replicas.

use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::OptionalExtension;

use super::{LocalStore, now_timestamp};
use crate::Error;
use crate::model::{Collection, OrderingToken};

impl LocalStore {
    /// Last remote token fully applied for `collection`, or zero.
    pub async fn load_cursor(&self, collection: Collection) -> Result<OrderingToken, Error> {
        self.conn
            .call(move |conn| -> Result<OrderingToken, Error> {
                let token: Option<i64> = conn
                    .query_row(
                        "SELECT token FROM sync_cursors WHERE collection = ?1",
                        params![collection.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(token.map_or(OrderingToken::ZERO, OrderingToken::from_sql))
            })
            .await
            .map_err(Error::from)
    }

    /// Record that every change up to `token` has been applied.
    ///
    /// The cursor never moves backwards; a lower token is ignored.
    pub async fn save_cursor(&self, collection: Collection, token: OrderingToken) -> Result<(), Error> {
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO sync_cursors (collection, token, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(collection) DO UPDATE SET
                        token = MAX(sync_cursors.token, excluded.token),
                        updated_at = excluded.updated_at",
                    params![collection.as_str(), token.to_sql(), now_timestamp()],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Change log sequence number replica `name` has applied, or zero.
    pub async fn load_replication_cursor(&self, name: &str) -> Result<i64, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<i64, Error> {
                let seq: Option<i64> = conn
                    .query_row("SELECT seq FROM replication_cursors WHERE name = ?1", params![name], |row| row.get(0))
                    .optional()?;
                Ok(seq.unwrap_or(0))
            })
            .await
            .map_err(Error::from)
    }

    /// Record that replica `name` has applied the change log up to `seq`.
    ///
    /// Shared by every tab; the cursor never moves backwards.
    pub async fn save_replication_cursor(&self, name: &str, seq: i64) -> Result<(), Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO replication_cursors (name, seq, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(name) DO UPDATE SET
                        seq = MAX(replication_cursors.seq, excluded.seq),
                        updated_at = excluded.updated_at",
                    params![name, seq, now_timestamp()],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cursor_defaults_to_zero() {
        let store = LocalStore::open_in_memory().await.unwrap();
        assert_eq!(store.load_cursor(Collection::Clients).await.unwrap(), OrderingToken::ZERO);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.save_cursor(Collection::Cases, OrderingToken(12)).await.unwrap();
        store.save_cursor(Collection::Cases, OrderingToken(9)).await.unwrap();
        assert_eq!(store.load_cursor(Collection::Cases).await.unwrap(), OrderingToken(12));
        assert_eq!(store.load_cursor(Collection::Clients).await.unwrap(), OrderingToken::ZERO);
    }

    #[tokio::test]
    async fn test_replication_cursor_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.sqlite");
        let tab_a = LocalStore::open(&path, crate::store::StoreOptions::default()).await.unwrap();
        let tab_b = LocalStore::open(&path, crate::store::StoreOptions::default()).await.unwrap();

        assert_eq!(tab_b.load_replication_cursor("mirror").await.unwrap(), 0);
        tab_a.save_replication_cursor("mirror", 5).await.unwrap();
        tab_a.save_replication_cursor("mirror", 3).await.unwrap();
        assert_eq!(tab_b.load_replication_cursor("mirror").await.unwrap(), 5);
        assert_eq!(tab_b.load_replication_cursor("other").await.unwrap(), 0);
    }
}
