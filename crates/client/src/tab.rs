//! Per-tab runtime: lease coordinator, remote subscription, mirror writer
//! and change log compaction.
//!
//! Every tab of a profile opens the same local store file and runs one
//! [`Tab`]. All tabs write through their own [`SyncClient`]; only the lease
//! holder keeps the remote subscription open, feeds the mirror and compacts
//! the change log.

use std::sync::Arc;
use std::time::Duration;

use crmsync_core::store::generate_id;
use crmsync_core::{AppConfig, Collection, LeaseSettings, LeaseState, LocalStore, TabCoordinator};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::mirror::{MirrorClient, MirrorError, MirrorWriter};
use crate::remote::{ChangeFilter, HttpRemoteStore};
use crate::sync::{SyncClient, SyncError};

/// Errors starting a tab from configuration.
#[derive(Debug, thiserror::Error)]
pub enum TabError {
    #[error(transparent)]
    Store(#[from] crmsync_core::Error),

    #[error(transparent)]
    Remote(#[from] SyncError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

/// What a tab runs and how.
#[derive(Debug, Clone)]
pub struct TabOptions {
    pub tab_id: String,
    pub lease: LeaseSettings,
    pub collections: Vec<Collection>,
    pub filter: ChangeFilter,
    /// Change log rows kept when the holder compacts.
    pub change_log_retention: u64,
    pub compact_every: Duration,
}

impl TabOptions {
    pub fn new(tab_id: impl Into<String>, lease: LeaseSettings) -> Self {
        Self {
            tab_id: tab_id.into(),
            lease,
            collections: Collection::ALL.to_vec(),
            filter: ChangeFilter::default(),
            change_log_retention: 10_000,
            compact_every: Duration::from_secs(60),
        }
    }

    /// Tab id from config, or a fresh one; subscription filtered to the configured owner.
    pub fn from_config(config: &AppConfig) -> Self {
        let tab_id = config.tab_id.clone().unwrap_or_else(generate_id);
        let mut options = Self::new(tab_id, LeaseSettings::from_config(config));
        options.change_log_retention = config.change_log_retention;
        if let Some(owner) = &config.owner_id {
            options.filter = ChangeFilter::owned_by(owner.clone());
        }
        options
    }
}

/// A running tab.
#[derive(Debug)]
pub struct Tab {
    tab_id: String,
    sync: SyncClient,
    lease: watch::Receiver<LeaseState>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Tab {
    /// Open the local store, remote transport and mirror client from `config` and start.
    ///
    /// The mirror writer only runs when `mirror_url` is configured.
    pub async fn open(config: &AppConfig) -> Result<Self, TabError> {
        let store = LocalStore::open_with_config(config).await?;
        let remote = Arc::new(HttpRemoteStore::from_config(config)?);
        let sync = SyncClient::from_config(store, remote, config);

        let mirror = config
            .mirror_url
            .as_ref()
            .map(|_| MirrorClient::from_config(config))
            .transpose()?
            .map(|client| MirrorWriter::new(Arc::new(client)).with_backoff(Backoff::from_config(config)));

        Ok(Self::start(sync, TabOptions::from_config(config), mirror))
    }

    /// Spawn the lease coordinator, the holder-gated subscription, the
    /// change log compactor and, if given, the mirror writer.
    pub fn start(sync: SyncClient, options: TabOptions, mirror: Option<MirrorWriter>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(4);

        let coordinator = TabCoordinator::new(sync.store().clone(), options.tab_id.clone(), options.lease.clone());
        let lease = coordinator.subscribe();
        {
            let shutdown_rx = shutdown_rx.clone();
            let tab_id = options.tab_id.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = coordinator.run(shutdown_rx).await {
                    warn!(%tab_id, error = %e, "lease coordinator stopped with error");
                }
            }));
        }

        if let Some(writer) = mirror {
            tasks.push(tokio::spawn(writer.run(sync.store().clone(), lease.clone(), shutdown_rx.clone())));
        }

        tasks.push(tokio::spawn(compact_while_holder(
            sync.store().clone(),
            options.change_log_retention,
            options.compact_every,
            lease.clone(),
            shutdown_rx.clone(),
        )));

        {
            let sync = sync.clone();
            let lease = lease.clone();
            let TabOptions { collections, filter, .. } = options.clone();
            tasks.push(tokio::spawn(async move {
                sync.run_while_holder(&collections, &filter, lease, shutdown_rx).await;
            }));
        }

        info!(tab_id = %options.tab_id, "tab started");
        Self { tab_id: options.tab_id, sync, lease, shutdown, tasks }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Write and delete through this tab.
    pub fn sync(&self) -> &SyncClient {
        &self.sync
    }

    pub fn store(&self) -> &LocalStore {
        self.sync.store()
    }

    pub fn lease_state(&self) -> LeaseState {
        *self.lease.borrow()
    }

    pub fn lease_watch(&self) -> watch::Receiver<LeaseState> {
        self.lease.clone()
    }

    /// Stop every task and release the lease if held.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(tab_id = %self.tab_id, error = %e, "tab task panicked");
            }
        }
        info!(tab_id = %self.tab_id, "tab stopped");
    }
}

/// Compact the change log every `every` while `lease` reads `Holder`.
async fn compact_while_holder(
    store: LocalStore, keep_last: u64, every: Duration, mut lease: watch::Receiver<LeaseState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }
        if *lease.borrow_and_update() != LeaseState::Holder {
            continue;
        }
        match store.compact_change_log(keep_last).await {
            Ok(0) => {}
            Ok(dropped) => debug!(dropped, keep_last, "compacted change log"),
            Err(e) => warn!(error = %e, "change log compaction failed"),
        }
    }
}
