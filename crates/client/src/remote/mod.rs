//! Authoritative remote document store.
//!
//! The remote store assigns every accepted write a monotonically increasing
//! ordering token and serves changes after a token per collection. Delivery
//! is at-least-once; consumers drop records at or below their cursor.

mod http;
mod memory;

pub use http::HttpRemoteStore;
pub use memory::{InjectedFailure, MemoryRemoteStore};

use std::time::Duration;

use async_trait::async_trait;
use crmsync_core::model::OWNER_ID_FIELD;
use crmsync_core::{ChangeRecord, Collection, Document, OrderingToken};
use serde::{Deserialize, Serialize};

use crate::sync::SyncError;

/// Server-side filter applied to a change subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    /// Only documents whose `ownerId` equals this value. Tombstones always pass.
    pub owner_id: Option<String>,
}

impl ChangeFilter {
    pub fn owned_by(owner_id: impl Into<String>) -> Self {
        Self { owner_id: Some(owner_id.into()) }
    }

    pub fn matches(&self, record: &ChangeRecord) -> bool {
        match (&self.owner_id, &record.document) {
            (Some(owner), Some(document)) => document.get(OWNER_ID_FIELD).and_then(|v| v.as_str()) == Some(owner),
            _ => true,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Write a document; returns the token the store assigned.
    async fn write(&self, collection: Collection, id: &str, document: &Document) -> Result<OrderingToken, SyncError>;

    /// Delete a document; returns the token the store assigned.
    async fn delete(&self, collection: Collection, id: &str) -> Result<OrderingToken, SyncError>;

    /// Changes to `collection` with a token greater than `since`, in token order.
    ///
    /// Waits up to `wait` for a change when none is pending and may return
    /// an empty batch once it elapses.
    async fn changes_since(
        &self, collection: Collection, since: OrderingToken, filter: &ChangeFilter, wait: Duration,
    ) -> Result<Vec<ChangeRecord>, SyncError>;
}
