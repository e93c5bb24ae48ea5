//! Cross-tab lease over the shared local store.
//!
//! One row per lease name holds `(holder, renewed_at_ms, epoch)`. Every
//! change to the holder bumps the epoch and is a compare-and-swap on the
//! epoch read in the same immediate transaction, so two tabs can never both
//! take over the same expired lease.
//!
//! Acquisition is two-phase. A tab that observes the lease free or expired
//! records a claim carrying a random token. Once its claim has aged by the
//! settle window it may swap in, but only if it holds the lowest live claim
//! token for the current epoch. Tabs racing for the same window therefore
//! agree on the winner without talking to each other.

mod coordinator;

pub use coordinator::{LeaseSettings, LeaseState, TabCoordinator};

use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::Error;
use crate::store::LocalStore;

/// Name of the lease that elects the tab owning the remote subscription.
pub const SYNC_LEASE: &str = "remote-sync";

/// Current lease row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub holder_token: Option<u64>,
    pub renewed_at_ms: i64,
    pub epoch: i64,
}

impl LeaseRecord {
    /// Whether a holder exists and renewed within `timeout_ms` of `now_ms`.
    pub fn is_live(&self, now_ms: i64, timeout_ms: i64) -> bool {
        self.holder.is_some() && now_ms - self.renewed_at_ms < timeout_ms
    }
}

/// A successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub epoch: i64,
    pub renewed_at_ms: i64,
}

/// One acquisition attempt by a candidate tab.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub name: String,
    pub tab_id: String,
    pub claim_token: u64,
    pub now_ms: i64,
    pub timeout_ms: i64,
    /// Minimum claim age before the swap is attempted.
    pub settle_ms: i64,
}

fn ensure_row(conn: &Connection, name: &str) -> Result<LeaseRecord, Error> {
    conn.execute("INSERT OR IGNORE INTO lease (name) VALUES (?1)", params![name])?;
    let record = conn.query_row(
        "SELECT holder, holder_token, renewed_at_ms, epoch FROM lease WHERE name = ?1",
        params![name],
        |row| {
            Ok(LeaseRecord {
                holder: row.get(0)?,
                holder_token: row.get::<_, Option<i64>>(1)?.map(|t| t as u64),
                renewed_at_ms: row.get(2)?,
                epoch: row.get(3)?,
            })
        },
    )?;
    Ok(record)
}

impl LocalStore {
    /// Read the lease row, creating an empty one if needed.
    pub async fn read_lease(&self, name: &str) -> Result<LeaseRecord, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<LeaseRecord, Error> { ensure_row(conn, &name) })
            .await
            .map_err(Error::from)
    }

    /// Attempt to become (or confirm being) the holder.
    ///
    /// # Errors
    ///
    /// Returns `Error::LeaseConflict` when the lease is held by a live tab,
    /// when this tab's claim has not settled yet, when a lower claim token
    /// exists, or when another tab swapped the epoch first.
    pub async fn try_acquire_lease(&self, request: AcquireRequest) -> Result<LeaseGrant, Error> {
        self.conn
            .call(move |conn| -> Result<LeaseGrant, Error> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let record = ensure_row(&tx, &request.name)?;

                if record.is_live(request.now_ms, request.timeout_ms) {
                    if record.holder.as_deref() == Some(request.tab_id.as_str()) {
                        return Ok(LeaseGrant { epoch: record.epoch, renewed_at_ms: record.renewed_at_ms });
                    }
                    return Err(Error::LeaseConflict(format!(
                        "held by {}",
                        record.holder.as_deref().unwrap_or_default()
                    )));
                }

                let stale_before = request.now_ms - request.timeout_ms;
                tx.execute(
                    "INSERT INTO lease_claims (name, epoch, tab_id, claim_token, claimed_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(name, epoch, tab_id) DO UPDATE SET
                        claim_token = excluded.claim_token,
                        claimed_at_ms = CASE WHEN lease_claims.claimed_at_ms <= ?6
                                             THEN excluded.claimed_at_ms
                                             ELSE lease_claims.claimed_at_ms END",
                    params![
                        &request.name,
                        record.epoch,
                        &request.tab_id,
                        request.claim_token as i64,
                        request.now_ms,
                        stale_before
                    ],
                )?;

                let claimed_at_ms: i64 = tx.query_row(
                    "SELECT claimed_at_ms FROM lease_claims WHERE name = ?1 AND epoch = ?2 AND tab_id = ?3",
                    params![&request.name, record.epoch, &request.tab_id],
                    |row| row.get(0),
                )?;
                let lowest: Option<String> = tx
                    .query_row(
                        "SELECT tab_id FROM lease_claims
                         WHERE name = ?1 AND epoch = ?2 AND claimed_at_ms > ?3
                         ORDER BY claim_token ASC, tab_id ASC LIMIT 1",
                        params![&request.name, record.epoch, stale_before],
                        |row| row.get(0),
                    )
                    .optional()?;

                if lowest.as_deref() != Some(request.tab_id.as_str()) {
                    tx.commit()?;
                    return Err(Error::LeaseConflict(format!(
                        "lower claim by {}",
                        lowest.as_deref().unwrap_or_default()
                    )));
                }
                if request.now_ms - claimed_at_ms < request.settle_ms {
                    tx.commit()?;
                    return Err(Error::LeaseConflict("claim settling".into()));
                }

                let swapped = tx.execute(
                    "UPDATE lease SET holder = ?1, holder_token = ?2, renewed_at_ms = ?3, epoch = epoch + 1
                     WHERE name = ?4 AND epoch = ?5",
                    params![&request.tab_id, request.claim_token as i64, request.now_ms, &request.name, record.epoch],
                )?;
                if swapped != 1 {
                    return Err(Error::LeaseConflict("epoch moved".into()));
                }
                tx.execute(
                    "DELETE FROM lease_claims WHERE name = ?1 AND epoch <= ?2",
                    params![&request.name, record.epoch],
                )?;
                tx.commit()?;

                Ok(LeaseGrant { epoch: record.epoch + 1, renewed_at_ms: request.now_ms })
            })
            .await
            .map_err(Error::from)
    }

    /// Extend the lease held at `epoch`.
    ///
    /// # Errors
    ///
    /// Returns `Error::LeaseConflict` if the epoch or holder changed.
    pub async fn renew_lease(&self, name: &str, tab_id: &str, epoch: i64, now_ms: i64) -> Result<(), Error> {
        let (name, tab_id) = (name.to_string(), tab_id.to_string());
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let renewed = conn.execute(
                    "UPDATE lease SET renewed_at_ms = ?1 WHERE name = ?2 AND holder = ?3 AND epoch = ?4",
                    params![now_ms, &name, &tab_id, epoch],
                )?;
                if renewed != 1 {
                    return Err(Error::LeaseConflict(format!("epoch {epoch} no longer held by {tab_id}")));
                }
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Give the lease up so a candidate can take over without waiting out the timeout.
    ///
    /// Returns `false` if this tab no longer held `epoch`.
    pub async fn release_lease(&self, name: &str, tab_id: &str, epoch: i64) -> Result<bool, Error> {
        let (name, tab_id) = (name.to_string(), tab_id.to_string());
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let released = conn.execute(
                    "UPDATE lease SET holder = NULL, holder_token = NULL, renewed_at_ms = 0, epoch = epoch + 1
                     WHERE name = ?1 AND holder = ?2 AND epoch = ?3",
                    params![&name, &tab_id, epoch],
                )?;
                Ok(released == 1)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tab: &str, claim_token: u64, now_ms: i64) -> AcquireRequest {
        AcquireRequest {
            name: SYNC_LEASE.into(),
            tab_id: tab.into(),
            claim_token,
            now_ms,
            timeout_ms: 3_000,
            settle_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_claim_settles_then_acquires() {
        let store = LocalStore::open_in_memory().await.unwrap();

        let first = store.try_acquire_lease(request("tab-a", 5, 0)).await;
        assert!(matches!(first, Err(Error::LeaseConflict(_))));

        let grant = store.try_acquire_lease(request("tab-a", 5, 1_000)).await.unwrap();
        assert_eq!(grant.epoch, 1);

        let record = store.read_lease(SYNC_LEASE).await.unwrap();
        assert_eq!(record.holder.as_deref(), Some("tab-a"));
        assert!(record.is_live(1_500, 3_000));
    }

    #[tokio::test]
    async fn test_lowest_claim_token_wins() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let _ = store.try_acquire_lease(request("tab-a", 90, 0)).await;
        let _ = store.try_acquire_lease(request("tab-b", 10, 100)).await;

        let a = store.try_acquire_lease(request("tab-a", 90, 1_200)).await;
        assert!(matches!(a, Err(Error::LeaseConflict(_))));

        let b = store.try_acquire_lease(request("tab-b", 10, 1_200)).await.unwrap();
        assert_eq!(b.epoch, 1);
    }

    #[tokio::test]
    async fn test_live_holder_blocks_takeover_until_timeout() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let _ = store.try_acquire_lease(request("tab-a", 1, 0)).await;
        let grant = store.try_acquire_lease(request("tab-a", 1, 1_000)).await.unwrap();

        assert!(store.try_acquire_lease(request("tab-b", 0, 3_999)).await.is_err());

        let _ = store.try_acquire_lease(request("tab-b", 0, 4_000)).await;
        let takeover = store.try_acquire_lease(request("tab-b", 0, 5_000)).await.unwrap();
        assert_eq!(takeover.epoch, grant.epoch + 1);

        let stale_renew = store.renew_lease(SYNC_LEASE, "tab-a", grant.epoch, 5_001).await;
        assert!(matches!(stale_renew, Err(Error::LeaseConflict(_))));
    }

    #[tokio::test]
    async fn test_release_allows_immediate_claim() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let _ = store.try_acquire_lease(request("tab-a", 1, 0)).await;
        let grant = store.try_acquire_lease(request("tab-a", 1, 1_000)).await.unwrap();

        assert!(store.release_lease(SYNC_LEASE, "tab-a", grant.epoch).await.unwrap());
        assert!(!store.release_lease(SYNC_LEASE, "tab-a", grant.epoch).await.unwrap());

        let record = store.read_lease(SYNC_LEASE).await.unwrap();
        assert!(record.holder.is_none());
        assert!(!record.is_live(1_001, 3_000));
    }
}
