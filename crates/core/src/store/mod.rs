//! Local cache store shared by every tab of one browser profile.
//!
//! SQLite-backed, accessed through tokio-rusqlite. It provides:
//!
//! - Keyed documents per collection with ordering-token guards
//! - Optimistic (provisional) writes with revert
//! - A durable change log and restartable subscriptions over it
//! - Replication batches and cursors for downstream replicas
//! - Per-collection resume cursors for the remote subscription
//! - Quota enforcement and eviction

pub mod changes;
pub mod connection;
pub mod cursors;
pub mod entries;
pub mod ids;

pub use changes::{ReplicationBatch, Subscription};
pub use connection::{LocalStore, StoreOptions};
pub use entries::{CacheEntry, Provisional, StoreUsage};
pub use ids::generate_id;

/// Fixed-width UTC timestamp so text ordering matches time ordering.
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
