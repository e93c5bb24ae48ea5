//! Core types and storage for the CRM sync runtime.
//!
//! This crate provides:
//! - The local cache store shared by every tab (SQLite backend)
//! - The cross-tab lease and per-tab coordinator
//! - The relational mirror database
//! - Versioned static asset storage
//! - Unified error types and configuration

pub mod assets;
pub mod config;
pub mod error;
pub mod lease;
pub mod migrations;
pub mod mirror;
pub mod model;
pub mod store;

pub use assets::{AssetManifest, CachedAsset};
pub use config::{AppConfig, ConfigError};
pub use error::Error;
pub use lease::{LeaseSettings, LeaseState, TabCoordinator};
pub use mirror::MirrorDb;
pub use model::{ChangeRecord, Collection, Document, OrderingToken};
pub use store::{LocalStore, StoreOptions, Subscription};
