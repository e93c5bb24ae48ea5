//! Database schema migrations.
//!
//! Uses a simple version table approach to track applied migrations.
//! The local store and the relational mirror live in separate files and
//! carry separate migration lists.

use std::num::ParseIntError;

use crate::Error;
use tokio_rusqlite::{Connection, params};

/// Local cache store migrations: (version, SQL).
///
/// Applied in order. All statements use CREATE IF NOT EXISTS.
pub const LOCAL: &[(&str, &str)] = &[
    ("1", include_str!("../migrations/local/001_entries.sql")),
    ("2", include_str!("../migrations/local/002_lease.sql")),
    ("3", include_str!("../migrations/local/003_assets.sql")),
    ("4", include_str!("../migrations/local/004_replication.sql")),
];

/// Relational mirror migrations: (version, SQL).
pub const MIRROR: &[(&str, &str)] = &[("1", include_str!("../migrations/mirror/001_mirror_tables.sql"))];

/// Run any pending migrations from `migrations`.
///
/// Creates the `_migrations` table if it doesn't exist, checks the current
/// version, and applies each pending migration in its own transaction.
///
/// # Errors
///
/// Returns an error if a migration SQL fails to execute.
pub async fn run(conn: &Connection, migrations: &'static [(&'static str, &'static str)]) -> Result<(), Error> {
    conn.call(move |conn| -> Result<(), Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(Error::from)?;

        let current: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))
            .map_err(Error::from)?;

        for (version, sql) in migrations {
            let version_num: i64 =
                version.parse().map_err(|e: ParseIntError| Error::MigrationFailed(e.to_string()))?;
            if version_num > current {
                let tx = conn.transaction()?;
                tx.execute_batch(sql).map_err(|e| Error::MigrationFailed(format!("version {version_num}: {e}")))?;
                tx.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version_num, chrono::Utc::now().to_rfc3339()],
                )?;
                tx.commit()?;
                tracing::debug!(version = version_num, "applied migration");
            }
        }

        Ok(())
    })
    .await
    .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_exists(conn: &Connection, name: &'static str) -> bool {
        conn.call(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
                params![name],
                |row| row.get(0),
            )
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().await.unwrap();
        run(&conn, LOCAL).await.unwrap();
        run(&conn, LOCAL).await.unwrap();

        assert!(table_exists(&conn, "entries").await);
        assert!(table_exists(&conn, "change_log").await);
        assert!(table_exists(&conn, "lease").await);
        assert!(table_exists(&conn, "assets").await);
    }

    #[tokio::test]
    async fn test_migrations_version_tracking() {
        let conn = Connection::open_in_memory().await.unwrap();
        run(&conn, LOCAL).await.unwrap();

        let count: i64 = conn
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0)))
            .await
            .unwrap();

        assert_eq!(count, LOCAL.len() as i64);
    }

    #[tokio::test]
    async fn test_mirror_migrations_are_separate() {
        let conn = Connection::open_in_memory().await.unwrap();
        run(&conn, MIRROR).await.unwrap();

        assert!(table_exists(&conn, "clients").await);
        assert!(table_exists(&conn, "cases").await);
        assert!(!table_exists(&conn, "entries").await);
    }
}
