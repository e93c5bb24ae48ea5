//! In-process remote store.
//!
//! Assigns tokens from a single counter, keeps the full change log, and can
//! inject failures and redeliveries so sync behavior can be exercised
//! without a network.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use crmsync_core::{ChangeRecord, Collection, Document, OrderingToken};
use tokio::sync::Notify;

use super::{ChangeFilter, RemoteStore};
use crate::sync::SyncError;

/// A failure returned by the next matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    Unavailable,
    Timeout,
    Rejected,
    PermissionDenied,
}

impl InjectedFailure {
    fn into_error(self) -> SyncError {
        match self {
            InjectedFailure::Unavailable => SyncError::Unavailable("injected".into()),
            InjectedFailure::Timeout => SyncError::Timeout,
            InjectedFailure::Rejected => SyncError::Rejected("injected".into()),
            InjectedFailure::PermissionDenied => SyncError::PermissionDenied("injected".into()),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    last_token: u64,
    log: Vec<ChangeRecord>,
    write_failures: VecDeque<InjectedFailure>,
    read_failures: VecDeque<InjectedFailure>,
    redeliver: usize,
    max_batch: Option<usize>,
    reads: u64,
}

#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start token assignment after `last_token`.
    pub fn with_start_token(last_token: u64) -> Self {
        let store = Self::default();
        store.lock().last_token = last_token;
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fail the next writes/deletes, in order.
    pub fn fail_writes(&self, failures: impl IntoIterator<Item = InjectedFailure>) {
        self.lock().write_failures.extend(failures);
    }

    /// Fail the next `changes_since` calls, in order.
    pub fn fail_reads(&self, failures: impl IntoIterator<Item = InjectedFailure>) {
        self.lock().read_failures.extend(failures);
    }

    /// Prepend up to `count` already-delivered records to every batch.
    pub fn redeliver(&self, count: usize) {
        self.lock().redeliver = count;
    }

    /// Cap the number of new records per batch.
    pub fn max_batch(&self, max: usize) {
        self.lock().max_batch = Some(max);
    }

    /// Append a record authored elsewhere, keeping its token.
    pub fn inject(&self, record: ChangeRecord) {
        {
            let mut state = self.lock();
            state.last_token = state.last_token.max(record.token.0);
            state.log.push(record);
            state.log.sort_by_key(|r| r.token);
        }
        self.notify.notify_waiters();
    }

    /// Number of `changes_since` calls served so far.
    pub fn reads(&self) -> u64 {
        self.lock().reads
    }

    /// Every record in token order.
    pub fn log(&self) -> Vec<ChangeRecord> {
        self.lock().log.clone()
    }

    fn append(&self, collection: Collection, id: &str, document: Option<Document>) -> Result<OrderingToken, SyncError> {
        let token = {
            let mut state = self.lock();
            if let Some(failure) = state.write_failures.pop_front() {
                return Err(failure.into_error());
            }
            state.last_token += 1;
            let token = OrderingToken(state.last_token);
            state.log.push(ChangeRecord { collection, id: id.to_string(), document, token });
            token
        };
        self.notify.notify_waiters();
        Ok(token)
    }

    fn collect(
        &self, collection: Collection, since: OrderingToken, filter: &ChangeFilter,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        let mut state = self.lock();
        state.reads += 1;
        if let Some(failure) = state.read_failures.pop_front() {
            return Err(failure.into_error());
        }

        let matching = state.log.iter().filter(|r| r.collection == collection && filter.matches(r));
        let mut fresh: Vec<ChangeRecord> = matching.clone().filter(|r| r.token > since).cloned().collect();
        if fresh.is_empty() {
            return Ok(fresh);
        }
        if let Some(max) = state.max_batch {
            fresh.truncate(max);
        }

        let delivered: Vec<&ChangeRecord> = matching.filter(|r| r.token <= since).collect();
        let mut batch: Vec<ChangeRecord> =
            delivered.iter().rev().take(state.redeliver).rev().map(|r| (*r).clone()).collect();
        batch.extend(fresh);
        Ok(batch)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn write(&self, collection: Collection, id: &str, document: &Document) -> Result<OrderingToken, SyncError> {
        self.append(collection, id, Some(document.clone()))
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<OrderingToken, SyncError> {
        self.append(collection, id, None)
    }

    async fn changes_since(
        &self, collection: Collection, since: OrderingToken, filter: &ChangeFilter, wait: Duration,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch = self.collect(collection, since, filter)?;
        if !batch.is_empty() || wait.is_zero() {
            return Ok(batch);
        }

        let _ = tokio::time::timeout(wait, notified).await;
        self.collect(collection, since, filter)
    }
}
