// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Leader election support.
//!
//! This module provides leader election functionality to ensure only one
//! instance of the controller is active at a time.
//!
//! Candidates race for a single lease record through a [`LeaseStore`]. Writes
//! are compare-and-swap on the record version, so two candidates can never
//! both succeed in taking the same lease. Expiry is judged against the local
//! clock: a candidate only takes over a lease it has watched go unchanged for
//! a full lease duration, which keeps the algorithm independent of clock skew
//! between replicas.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Contents of the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Current holder. `None` once released.
    pub holder_identity: Option<String>,
    /// How long the holder owns the lease after a renewal.
    pub lease_duration: Duration,
    /// When the current holder acquired the lease.
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the current holder last renewed the lease.
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of times the lease changed hands.
    pub lease_transitions: i32,
}

/// A lease record together with its storage version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLease {
    /// The record.
    pub record: LeaseRecord,
    /// Opaque version used for compare-and-swap updates.
    pub version: String,
}

/// Errors returned by a [`LeaseStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    /// The lease was created or modified by someone else.
    #[error("lease was modified concurrently")]
    Conflict,

    /// The backend could not be reached or refused the request.
    #[error("lease backend error: {0}")]
    Backend(String),
}

/// Storage for the single lease record candidates compete for.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Reads the lease. Returns `None` if it does not exist yet.
    async fn get(&self) -> Result<Option<VersionedLease>, LeaseError>;

    /// Creates the lease. Fails with [`LeaseError::Conflict`] if it exists.
    async fn create(&self, record: &LeaseRecord) -> Result<VersionedLease, LeaseError>;

    /// Replaces the lease if its version still equals `version`.
    async fn update(
        &self,
        record: &LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError>;
}

#[derive(Default)]
struct MemoryLeaseState {
    lease: Option<VersionedLease>,
    version: u64,
    unavailable: HashMap<String, bool>,
}

/// In-memory [`LeaseStore`] shared between candidates in one process.
///
/// Every clone talks to the same record. Individual candidates can be cut
/// off from the store with [`MemoryLeaseStore::partition`].
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    state: Arc<Mutex<MemoryLeaseState>>,
    client: Option<String>,
}

impl MemoryLeaseStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle that can be partitioned under `name`.
    pub fn client(&self, name: &str) -> Self {
        Self {
            state: Arc::clone(&self.state),
            client: Some(name.to_string()),
        }
    }

    /// Cuts the handle named `name` off from the store, or reconnects it.
    pub fn partition(&self, name: &str, unavailable: bool) {
        self.state
            .lock()
            .unwrap()
            .unavailable
            .insert(name.to_string(), unavailable);
    }

    /// The current record, if any.
    pub fn current(&self) -> Option<LeaseRecord> {
        self.state
            .lock()
            .unwrap()
            .lease
            .as_ref()
            .map(|lease| lease.record.clone())
    }

    /// The current holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.current().and_then(|record| record.holder_identity)
    }

    fn check_available(&self, state: &MemoryLeaseState) -> Result<(), LeaseError> {
        match &self.client {
            Some(name) if state.unavailable.get(name).copied().unwrap_or(false) => {
                Err(LeaseError::Backend(format!("{name} is partitioned")))
            }
            _ => Ok(()),
        }
    }

    fn store(state: &mut MemoryLeaseState, record: &LeaseRecord) -> VersionedLease {
        state.version += 1;
        let lease = VersionedLease {
            record: record.clone(),
            version: state.version.to_string(),
        };
        state.lease = Some(lease.clone());
        lease
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self) -> Result<Option<VersionedLease>, LeaseError> {
        let state = self.state.lock().unwrap();
        self.check_available(&state)?;
        Ok(state.lease.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<VersionedLease, LeaseError> {
        let mut state = self.state.lock().unwrap();
        self.check_available(&state)?;
        if state.lease.is_some() {
            return Err(LeaseError::Conflict);
        }
        Ok(Self::store(&mut state, record))
    }

    async fn update(
        &self,
        record: &LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError> {
        let mut state = self.state.lock().unwrap();
        self.check_available(&state)?;
        match &state.lease {
            Some(current) if current.version == version => Ok(Self::store(&mut state, record)),
            _ => Err(LeaseError::Conflict),
        }
    }
}

/// Configuration for leader election.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Resource namespace.
    pub resource_namespace: String,

    /// Resource name (lease name).
    pub resource_name: String,

    /// Identity of this candidate (hostname + random ID).
    pub identity: String,

    /// Lease duration.
    pub lease_duration: Duration,

    /// Renew deadline.
    pub renew_deadline: Duration,

    /// Retry period.
    pub retry_period: Duration,

    /// Clear the holder when stepping down on cancellation.
    pub release_on_cancel: bool,
}

impl LeaderElectionConfig {
    /// Creates a new leader election configuration.
    pub fn new(resource_namespace: String, resource_name: String, identity: String) -> Self {
        Self {
            resource_namespace,
            resource_name,
            identity,
            lease_duration: Duration::from_secs(60),
            renew_deadline: Duration::from_secs(15),
            retry_period: Duration::from_secs(5),
            release_on_cancel: true,
        }
    }

    /// Sets the lease duration.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Sets the renew deadline.
    pub fn with_renew_deadline(mut self, deadline: Duration) -> Self {
        self.renew_deadline = deadline;
        self
    }

    /// Sets the retry period.
    pub fn with_retry_period(mut self, period: Duration) -> Self {
        self.retry_period = period;
        self
    }

    /// Sets whether the lease is released on cancellation.
    pub fn with_release_on_cancel(mut self, release: bool) -> Self {
        self.release_on_cancel = release;
        self
    }
}

/// Leadership state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// Not participating.
    Standby,
    /// Polling for the lease.
    Acquiring,
    /// Holding the lease.
    Leading,
    /// Stepping down.
    Releasing,
}

impl LeaderState {
    /// Name used in status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaderState::Standby => "standby",
            LeaderState::Acquiring => "acquiring",
            LeaderState::Leading => "leading",
            LeaderState::Releasing => "releasing",
        }
    }
}

/// Callbacks for leader election events.
#[async_trait]
pub trait LeaderCallbacks: Send + Sync + 'static {
    /// Called when this instance becomes the leader.
    ///
    /// Runs for the whole term. `cancel` fires when leadership ends; the
    /// future must return promptly afterwards.
    async fn on_started_leading(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Called when this instance stops being the leader.
    async fn on_stopped_leading(&self) {}

    /// Called whenever a different holder is observed.
    fn on_new_leader(&self, _identity: &str) {}
}

/// Errors returned by [`LeaderElector::run`].
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// The leading callback returned an error.
    #[error("leading task failed: {0:#}")]
    Leading(anyhow::Error),

    /// The leading callback panicked.
    #[error("leading task panicked")]
    LeadingPanicked,
}

#[derive(Default)]
struct Observed {
    lease: Option<VersionedLease>,
    time: Option<Instant>,
    reported_leader: Option<String>,
}

enum TermEnd {
    Cancelled,
    Lost,
    Finished(Result<anyhow::Result<()>, tokio::task::JoinError>),
}

/// Runs leader election against a [`LeaseStore`].
pub struct LeaderElector {
    config: LeaderElectionConfig,
    store: Arc<dyn LeaseStore>,
    observed: Mutex<Observed>,
    state: watch::Sender<LeaderState>,
}

impl LeaderElector {
    /// Creates a new elector.
    pub fn new(config: LeaderElectionConfig, store: Arc<dyn LeaseStore>) -> Self {
        Self {
            config,
            store,
            observed: Mutex::new(Observed::default()),
            state: watch::channel(LeaderState::Standby).0,
        }
    }

    /// Current leadership state.
    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// Receives every leadership state change.
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    /// The most recently observed holder.
    pub fn observed_leader(&self) -> Option<String> {
        self.observed
            .lock()
            .unwrap()
            .lease
            .as_ref()
            .and_then(|lease| lease.record.holder_identity.clone())
    }

    fn set_state(&self, state: LeaderState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(identity = %self.config.identity, from = current.as_str(), to = state.as_str(), "leader state changed");
            *current = state;
            true
        });
    }

    /// Runs the election loop until `cancel` fires.
    ///
    /// Every time the lease is acquired, `on_started_leading` runs with a
    /// token scoped to that term. The term ends when the lease cannot be
    /// renewed within the renew deadline, when another holder is observed,
    /// or when `cancel` fires. After a lost term the candidate goes back to
    /// polling.
    pub async fn run(
        &self,
        callbacks: Arc<dyn LeaderCallbacks>,
        cancel: CancellationToken,
    ) -> Result<(), LeaderElectionError> {
        info!(
            identity = %self.config.identity,
            lease = %format!("{}/{}", self.config.resource_namespace, self.config.resource_name),
            "starting leader election"
        );

        loop {
            if !self.acquire(callbacks.as_ref(), &cancel).await {
                self.set_state(LeaderState::Standby);
                return Ok(());
            }

            info!(identity = %self.config.identity, "acquired leadership");
            self.set_state(LeaderState::Leading);

            let term = cancel.child_token();
            let mut leading: JoinHandle<anyhow::Result<()>> = tokio::spawn({
                let callbacks = Arc::clone(&callbacks);
                let term = term.clone();
                async move { callbacks.on_started_leading(term).await }
            });

            let end = self.renew(callbacks.as_ref(), &cancel, &mut leading).await;

            self.set_state(LeaderState::Releasing);
            term.cancel();
            if !matches!(end, TermEnd::Finished(_)) {
                if let Err(e) = leading.await {
                    error!(error = %e, "leading task failed to stop");
                }
            }

            let stepping_down = !matches!(end, TermEnd::Lost);
            if stepping_down && self.config.release_on_cancel {
                self.release().await;
            }

            info!(identity = %self.config.identity, "stopped leading");
            callbacks.on_stopped_leading().await;

            match end {
                TermEnd::Cancelled => {
                    self.set_state(LeaderState::Standby);
                    return Ok(());
                }
                TermEnd::Lost => {
                    warn!(identity = %self.config.identity, "leadership lost");
                }
                TermEnd::Finished(result) => {
                    self.set_state(LeaderState::Standby);
                    return match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(LeaderElectionError::Leading(e)),
                        Err(_) => Err(LeaderElectionError::LeadingPanicked),
                    };
                }
            }
        }
    }

    /// Polls for the lease every retry period. Returns false on cancellation.
    async fn acquire(&self, callbacks: &dyn LeaderCallbacks, cancel: &CancellationToken) -> bool {
        self.set_state(LeaderState::Acquiring);
        let mut ticker = tokio::time::interval(self.config.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = ticker.tick() => {}
            }

            let acquired = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = self.try_acquire_or_renew() => result,
            };
            self.report_leader(callbacks);

            match acquired {
                Ok(true) => return true,
                Ok(false) => {
                    debug!(
                        identity = %self.config.identity,
                        holder = ?self.observed_leader(),
                        "lease held by another candidate"
                    );
                }
                Err(e) => {
                    warn!(identity = %self.config.identity, error = %e, "failed to acquire lease");
                }
            }
        }
    }

    /// Keeps the lease alive while the leading task runs.
    async fn renew(
        &self,
        callbacks: &dyn LeaderCallbacks,
        cancel: &CancellationToken,
        leading: &mut JoinHandle<anyhow::Result<()>>,
    ) -> TermEnd {
        let mut ticker = tokio::time::interval(self.config.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last_renewal = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return TermEnd::Cancelled,
                result = &mut *leading => return TermEnd::Finished(result),
                _ = ticker.tick() => {}
            }

            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renewal.elapsed());
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return TermEnd::Cancelled,
                attempt = tokio::time::timeout(remaining, self.try_acquire_or_renew()) => attempt,
            };
            self.report_leader(callbacks);

            match attempt {
                Ok(Ok(true)) => {
                    last_renewal = Instant::now();
                    continue;
                }
                Ok(Ok(false)) => {
                    if self.observed_leader().as_deref() != Some(self.config.identity.as_str()) {
                        return TermEnd::Lost;
                    }
                }
                Ok(Err(e)) => {
                    warn!(identity = %self.config.identity, error = %e, "failed to renew lease");
                }
                Err(_) => {
                    warn!(identity = %self.config.identity, "lease renewal timed out");
                }
            }

            if last_renewal.elapsed() >= self.config.renew_deadline {
                return TermEnd::Lost;
            }
        }
    }

    /// Makes one attempt to take or extend the lease.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaseError> {
        let now = Utc::now();

        let Some(current) = self.store.get().await? else {
            let record = LeaseRecord {
                holder_identity: Some(self.config.identity.clone()),
                lease_duration: self.config.lease_duration,
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: 0,
            };
            return match self.store.create(&record).await {
                Ok(lease) => {
                    self.observe(lease);
                    Ok(true)
                }
                Err(LeaseError::Conflict) => Ok(false),
                Err(e) => Err(e),
            };
        };

        let observed_at = self.observe_if_changed(&current);
        let holder = current.record.holder_identity.as_deref().filter(|h| !h.is_empty());
        let held_by_us = holder == Some(self.config.identity.as_str());

        if let Some(holder) = holder {
            if !held_by_us && observed_at + current.record.lease_duration > Instant::now() {
                debug!(identity = %self.config.identity, %holder, "lease is held and not expired");
                return Ok(false);
            }
        }

        let record = if held_by_us {
            LeaseRecord {
                holder_identity: Some(self.config.identity.clone()),
                lease_duration: self.config.lease_duration,
                acquire_time: current.record.acquire_time,
                renew_time: Some(now),
                lease_transitions: current.record.lease_transitions,
            }
        } else {
            LeaseRecord {
                holder_identity: Some(self.config.identity.clone()),
                lease_duration: self.config.lease_duration,
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: current.record.lease_transitions + 1,
            }
        };

        match self.store.update(&record, &current.version).await {
            Ok(lease) => {
                self.observe(lease);
                Ok(true)
            }
            Err(LeaseError::Conflict) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Clears the holder so a standby can take over without waiting for expiry.
    async fn release(&self) {
        let (version, record) = {
            let observed = self.observed.lock().unwrap();
            match &observed.lease {
                Some(lease)
                    if lease.record.holder_identity.as_deref()
                        == Some(self.config.identity.as_str()) =>
                {
                    (lease.version.clone(), lease.record.clone())
                }
                _ => return,
            }
        };

        let released = LeaseRecord {
            holder_identity: None,
            lease_duration: Duration::from_secs(1),
            acquire_time: record.acquire_time,
            renew_time: Some(Utc::now()),
            lease_transitions: record.lease_transitions,
        };

        match self.store.update(&released, &version).await {
            Ok(lease) => {
                info!(identity = %self.config.identity, "released lease");
                self.observe(lease);
            }
            Err(e) => warn!(identity = %self.config.identity, error = %e, "failed to release lease"),
        }
    }

    fn observe(&self, lease: VersionedLease) {
        let mut observed = self.observed.lock().unwrap();
        observed.lease = Some(lease);
        observed.time = Some(Instant::now());
    }

    /// Records `lease` if its version changed. Returns when it was first seen.
    fn observe_if_changed(&self, lease: &VersionedLease) -> Instant {
        let mut observed = self.observed.lock().unwrap();
        let unchanged = observed
            .lease
            .as_ref()
            .is_some_and(|seen| seen.version == lease.version);
        match observed.time {
            Some(time) if unchanged => time,
            _ => {
                let now = Instant::now();
                observed.lease = Some(lease.clone());
                observed.time = Some(now);
                now
            }
        }
    }

    fn report_leader(&self, callbacks: &dyn LeaderCallbacks) {
        let leader = {
            let mut observed = self.observed.lock().unwrap();
            let leader = observed
                .lease
                .as_ref()
                .and_then(|lease| lease.record.holder_identity.clone());
            if leader.is_none() || leader == observed.reported_leader {
                return;
            }
            observed.reported_leader = leader.clone();
            leader
        };
        if let Some(leader) = leader {
            callbacks.on_new_leader(&leader);
        }
    }
}

/// Creates a default identity for leader election.
///
/// Uses the `ID` environment variable when set, otherwise the hostname plus
/// a random component.
pub fn create_identity() -> anyhow::Result<String> {
    if let Ok(id) = std::env::var("ID") {
        if !id.is_empty() {
            return Ok(id);
        }
    }

    let hostname = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string());

    let random: String = std::iter::repeat_with(rand::random::<u8>)
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect();

    Ok(format!("{}_{}", hostname, random))
}
