//! Per-tab lease state machine.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{AcquireRequest, LeaseGrant, SYNC_LEASE};
use crate::Error;
use crate::config::AppConfig;
use crate::store::LocalStore;

/// Where a tab stands with respect to the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Not holding; trying to acquire on every heartbeat.
    Candidate,
    /// Holding and renewing.
    Holder,
    /// Gave the lease up (tab closing).
    Released,
    /// Lost the lease to expiry or another tab's takeover.
    Preempted,
}

/// Lease timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSettings {
    pub name: String,
    pub heartbeat: Duration,
    pub timeout: Duration,
}

impl LeaseSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self { name: SYNC_LEASE.into(), heartbeat: config.heartbeat(), timeout: config.lease_timeout() }
    }

    fn timeout_ms(&self) -> i64 {
        i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX)
    }

    fn heartbeat_ms(&self) -> i64 {
        i64::try_from(self.heartbeat.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Drives one tab's lease state.
///
/// `tick` is the whole state machine; `run` calls it on a heartbeat with the
/// wall clock. Tests drive `tick` directly with a simulated clock.
#[derive(Debug)]
pub struct TabCoordinator {
    store: LocalStore,
    tab_id: String,
    settings: LeaseSettings,
    claim_token: u64,
    grant: Option<LeaseGrant>,
    state: LeaseState,
    tx: watch::Sender<LeaseState>,
}

fn fresh_claim_token() -> u64 {
    rand::random::<u64>() >> 1
}

impl TabCoordinator {
    pub fn new(store: LocalStore, tab_id: impl Into<String>, settings: LeaseSettings) -> Self {
        let (tx, _) = watch::channel(LeaseState::Candidate);
        Self {
            store,
            tab_id: tab_id.into(),
            settings,
            claim_token: fresh_claim_token(),
            grant: None,
            state: LeaseState::Candidate,
            tx,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Claim token used for the current acquisition window.
    pub fn claim_token(&self) -> u64 {
        self.claim_token
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.tx.subscribe()
    }

    /// Whether this tab may act as holder at `now_ms`.
    ///
    /// True only while the last successful renewal is younger than the
    /// timeout, which is exactly the window in which no other tab may take over.
    pub fn is_holder(&self, now_ms: i64) -> bool {
        self.state == LeaseState::Holder
            && self.grant.is_some_and(|grant| now_ms - grant.renewed_at_ms < self.settings.timeout_ms())
    }

    fn transition(&mut self, next: LeaseState) {
        if self.state == next {
            return;
        }
        debug!(tab_id = %self.tab_id, from = ?self.state, to = ?next, "lease transition");
        self.state = next;
        if next == LeaseState::Candidate {
            self.claim_token = fresh_claim_token();
        }
        self.tx.send_replace(next);
    }

    /// Advance the state machine once.
    ///
    /// # Errors
    ///
    /// Returns non-transient storage errors. Conflicts and busy databases
    /// leave the state unchanged and are retried on the next tick.
    pub async fn tick(&mut self, now_ms: i64) -> Result<LeaseState, Error> {
        match self.state {
            LeaseState::Holder => self.renew(now_ms).await?,
            LeaseState::Released | LeaseState::Preempted => {
                self.transition(LeaseState::Candidate);
                self.acquire(now_ms).await?;
            }
            LeaseState::Candidate => self.acquire(now_ms).await?,
        }
        Ok(self.state)
    }

    async fn renew(&mut self, now_ms: i64) -> Result<(), Error> {
        let Some(grant) = self.grant else {
            self.transition(LeaseState::Preempted);
            return Ok(());
        };

        if now_ms - grant.renewed_at_ms >= self.settings.timeout_ms() {
            warn!(tab_id = %self.tab_id, epoch = grant.epoch, "lease expired before renewal");
            self.grant = None;
            self.transition(LeaseState::Preempted);
            return Ok(());
        }

        match self.store.renew_lease(&self.settings.name, &self.tab_id, grant.epoch, now_ms).await {
            Ok(()) => {
                self.grant = Some(LeaseGrant { epoch: grant.epoch, renewed_at_ms: now_ms });
                Ok(())
            }
            Err(Error::LeaseConflict(reason)) => {
                warn!(tab_id = %self.tab_id, %reason, "lease preempted");
                self.grant = None;
                self.transition(LeaseState::Preempted);
                Ok(())
            }
            Err(e) if e.is_transient() => {
                debug!(tab_id = %self.tab_id, error = %e, "lease renewal deferred");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn acquire(&mut self, now_ms: i64) -> Result<(), Error> {
        let request = AcquireRequest {
            name: self.settings.name.clone(),
            tab_id: self.tab_id.clone(),
            claim_token: self.claim_token,
            now_ms,
            timeout_ms: self.settings.timeout_ms(),
            settle_ms: self.settings.heartbeat_ms(),
        };

        match self.store.try_acquire_lease(request).await {
            Ok(grant) => {
                info!(tab_id = %self.tab_id, epoch = grant.epoch, "acquired lease");
                self.grant = Some(grant);
                self.transition(LeaseState::Holder);
                Ok(())
            }
            Err(e) if e.is_transient() => {
                debug!(tab_id = %self.tab_id, error = %e, "lease not acquired");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Give the lease up. Safe to call in any state.
    pub async fn release(&mut self) -> Result<(), Error> {
        if let (LeaseState::Holder, Some(grant)) = (self.state, self.grant) {
            let released = self.store.release_lease(&self.settings.name, &self.tab_id, grant.epoch).await?;
            info!(tab_id = %self.tab_id, epoch = grant.epoch, released, "released lease");
        }
        self.grant = None;
        self.transition(LeaseState::Released);
        Ok(())
    }

    /// Tick on every heartbeat until `shutdown` flips to `true`, then release.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let mut interval = tokio::time::interval(self.settings.heartbeat);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    if let Err(e) = self.tick(now_ms).await {
                        warn!(tab_id = %self.tab_id, error = %e, "lease tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.release().await
    }
}
