//! Client side of the CRM sync core.
//!
//! This crate provides the remote sync client, the mirror writer, the
//! offline asset pipeline and the per-tab runtime that ties them to the
//! local store in `crmsync-core`.

pub mod assets;
pub mod backoff;
pub mod mirror;
pub mod remote;
pub mod sync;
pub mod tab;

pub use assets::{AssetCache, AssetError, AssetFetcher, AssetResponse, AssetSource, HttpAssetFetcher};
pub use backoff::Backoff;
pub use mirror::{Delivery, MirrorClient, MirrorError, MirrorSink, MirrorWriter};
pub use remote::{ChangeFilter, HttpRemoteStore, MemoryRemoteStore, RemoteStore};
pub use sync::{ChangeFeed, SyncClient, SyncError};
pub use tab::{Tab, TabError, TabOptions};
