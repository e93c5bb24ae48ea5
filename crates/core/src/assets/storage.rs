//! Asset version storage in the local store.

use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};

use super::hash::{compute_asset_key, content_digest};
use crate::Error;
use crate::store::{LocalStore, now_timestamp};

/// One cached asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub content_hash: String,
    pub fetched_at: String,
}

impl CachedAsset {
    pub fn new(url: impl Into<String>, content_type: Option<String>, body: Vec<u8>) -> Self {
        let content_hash = content_digest(&body);
        Self { url: url.into(), content_type, body, content_hash, fetched_at: now_timestamp() }
    }
}

/// An installed cache version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetVersion {
    pub version: String,
    pub installed_at: String,
    pub active: bool,
    pub asset_count: u64,
}

impl LocalStore {
    /// Stage every asset of `version` in one transaction.
    ///
    /// Reinstalling a version replaces its assets; its active flag is kept.
    pub async fn install_asset_version(&self, version: &str, assets: Vec<CachedAsset>) -> Result<(), Error> {
        if version.trim().is_empty() {
            return Err(Error::InvalidInput("asset version cannot be empty".into()));
        }
        let version = version.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO asset_versions (version, installed_at, active) VALUES (?1, ?2, 0)
                     ON CONFLICT(version) DO UPDATE SET installed_at = excluded.installed_at",
                    params![&version, now_timestamp()],
                )?;
                tx.execute("DELETE FROM assets WHERE version = ?1", params![&version])?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR REPLACE INTO assets
                            (cache_key, version, url, content_type, body, content_hash, fetched_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )?;
                    for asset in &assets {
                        stmt.execute(params![
                            compute_asset_key(&version, &asset.url),
                            &version,
                            &asset.url,
                            &asset.content_type,
                            &asset.body,
                            &asset.content_hash,
                            &asset.fetched_at,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Make `version` the one lookups read and delete all others.
    ///
    /// Returns the number of versions deleted.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if `version` was never installed.
    pub async fn activate_asset_version(&self, version: &str) -> Result<u64, Error> {
        let version = version.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let tx = conn.transaction()?;
                let known: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM asset_versions WHERE version = ?1)",
                    params![&version],
                    |row| row.get(0),
                )?;
                if !known {
                    return Err(Error::InvalidInput(format!("asset version {version} is not installed")));
                }
                tx.execute("UPDATE asset_versions SET active = (version = ?1)", params![&version])?;
                tx.execute("DELETE FROM assets WHERE version != ?1", params![&version])?;
                let deleted = tx.execute("DELETE FROM asset_versions WHERE version != ?1", params![&version])?;
                tx.commit()?;
                Ok(deleted as u64)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn active_asset_version(&self) -> Result<Option<String>, Error> {
        self.conn
            .call(|conn| -> Result<Option<String>, Error> {
                let version = conn
                    .query_row("SELECT version FROM asset_versions WHERE active = 1", [], |row| row.get(0))
                    .optional()?;
                Ok(version)
            })
            .await
            .map_err(Error::from)
    }

    /// Look `url` up in the active version.
    pub async fn cached_asset(&self, url: &str) -> Result<Option<CachedAsset>, Error> {
        let url = url.to_string();
        self.conn
            .call(move |conn| -> Result<Option<CachedAsset>, Error> {
                let asset = conn
                    .query_row(
                        "SELECT a.url, a.content_type, a.body, a.content_hash, a.fetched_at
                         FROM assets a JOIN asset_versions v ON v.version = a.version
                         WHERE v.active = 1 AND a.url = ?1",
                        params![&url],
                        |row| {
                            Ok(CachedAsset {
                                url: row.get(0)?,
                                content_type: row.get(1)?,
                                body: row.get(2)?,
                                content_hash: row.get(3)?,
                                fetched_at: row.get(4)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(asset)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn asset_versions(&self) -> Result<Vec<AssetVersion>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<AssetVersion>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT v.version, v.installed_at, v.active, COUNT(a.cache_key)
                     FROM asset_versions v LEFT JOIN assets a ON a.version = v.version
                     GROUP BY v.version ORDER BY v.installed_at ASC",
                )?;
                let versions = stmt
                    .query_map([], |row| {
                        Ok(AssetVersion {
                            version: row.get(0)?,
                            installed_at: row.get(1)?,
                            active: row.get::<_, i64>(2)? == 1,
                            asset_count: row.get::<_, i64>(3)? as u64,
                        })
                    })?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(versions)
            })
            .await
            .map_err(Error::from)
    }
}
