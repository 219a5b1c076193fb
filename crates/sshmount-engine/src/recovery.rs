//! Recovery engine: keeps the remotes in [`DesiredConnections`] connected.
//!
//! It is only a scheduler. Everything it does goes through the supervisor with
//! the recovery or startup trigger, so it never preempts the user.

use chrono::Utc;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RecoveryConfig;
use crate::desired::DesiredConnections;
use crate::state::RemoteTable;
use crate::store::RemoteStore;
use crate::supervisor::{SubmitOutcome, Supervisor};
use crate::types::{Intent, MountState, RemoteId, Trigger};

/// Notifications from the host environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    /// The host is about to sleep.
    WillSleep,
    /// The host woke up.
    DidWake,
    /// A network path became available.
    NetworkRestored,
    /// Something outside the engine unmounted this path.
    ExternalUnmount {
        /// Path that is no longer mounted.
        mount_point: PathBuf,
    },
}

/// Why a recovery pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Between sleep and wake notifications.
    Asleep,
    /// No remote is desired.
    NothingDesired,
    /// Everything desired is connected, nothing is running and a deep pass ran recently.
    Healthy,
}

/// Result of one recovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing was submitted.
    Skipped(SkipReason),
    /// Operations were submitted.
    Ran {
        /// Desired remotes whose refresh ran.
        refreshed: usize,
        /// Remotes brought back to connected.
        reconnected: usize,
    },
}

/// Drives desired remotes back to connected.
pub struct RecoveryEngine {
    config: RecoveryConfig,
    supervisor: Arc<Supervisor>,
    desired: Arc<DesiredConnections>,
    table: Arc<RemoteTable>,
    store: Arc<dyn RemoteStore>,
    last_deep_pass: Mutex<Option<Instant>>,
    asleep: AtomicBool,
}

fn same_path(a: &Path, b: &Path) -> bool {
    a.components().eq(b.components())
}

impl RecoveryEngine {
    /// Recovery over the shared supervisor, table and desired set.
    pub fn new(
        config: RecoveryConfig,
        supervisor: Arc<Supervisor>,
        desired: Arc<DesiredConnections>,
        table: Arc<RemoteTable>,
        store: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            config,
            supervisor,
            desired,
            table,
            store,
            last_deep_pass: Mutex::new(None),
            asleep: AtomicBool::new(false),
        }
    }

    /// Between sleep and wake notifications.
    pub fn is_asleep(&self) -> bool {
        self.asleep.load(Ordering::Acquire)
    }

    fn is_connected(&self, remote_id: &RemoteId) -> bool {
        self.table
            .status(remote_id)
            .map_or(false, |status| status.state == MountState::Connected)
    }

    /// Desired remotes not currently showing as connected.
    pub fn pending(&self) -> Vec<RemoteId> {
        self.desired
            .snapshot()
            .into_iter()
            .filter(|id| !self.is_connected(id))
            .collect()
    }

    /// One periodic pass: refresh every desired remote, reconnecting the ones
    /// that turn out not to be connected.
    pub async fn periodic_pass(&self) -> PassOutcome {
        if self.is_asleep() {
            return PassOutcome::Skipped(SkipReason::Asleep);
        }
        let desired = self.desired.snapshot();
        if desired.is_empty() {
            return PassOutcome::Skipped(SkipReason::NothingDesired);
        }

        let now = Instant::now();
        let window = self.config.deep_probe_window();
        {
            let mut last = self
                .last_deep_pass
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let recent = last.map_or(false, |at| now.saturating_duration_since(at) < window);
            let all_connected = desired.iter().all(|id| self.is_connected(id));
            if recent && all_connected && self.supervisor.is_idle() {
                tracing::trace!(desired = desired.len(), "periodic pass skipped, all healthy");
                return PassOutcome::Skipped(SkipReason::Healthy);
            }
            *last = Some(now);
        }

        let results = join_all(desired.iter().map(|id| self.reconcile(*id))).await;
        let refreshed = results.iter().filter(|(refreshed, _)| *refreshed).count();
        let reconnected = results.iter().filter(|(_, reconnected)| *reconnected).count();
        tracing::debug!(
            desired = desired.len(),
            refreshed,
            reconnected,
            elapsed_ms = now.elapsed().as_millis() as u64,
            "periodic pass finished"
        );
        PassOutcome::Ran {
            refreshed,
            reconnected,
        }
    }

    /// Refresh, then reconnect if the remote is still wanted but not connected.
    /// Returns (refreshed, reconnected).
    async fn reconcile(&self, remote_id: RemoteId) -> (bool, bool) {
        let outcome = self
            .supervisor
            .submit(remote_id, Intent::Refresh, Trigger::Recovery)
            .await;
        let connected = match &outcome {
            SubmitOutcome::Completed(status) | SubmitOutcome::TimedOut(status) => {
                status.state == MountState::Connected
            }
            _ => return (false, false),
        };
        if connected || !self.desired.contains(&remote_id) {
            return (true, false);
        }

        let outcome = self
            .supervisor
            .submit(remote_id, Intent::Connect, Trigger::Recovery)
            .await;
        let reconnected = outcome
            .status()
            .map_or(false, |status| status.state == MountState::Connected);
        (true, reconnected)
    }

    /// Connect attempts at the given offsets from now. Each step only retries
    /// desired remotes still not connected; returns the number of attempts.
    pub async fn burst(&self, schedule: &[Duration], reason: &str) -> usize {
        let start = Instant::now();
        let mut attempts = 0;
        for (step, offset) in schedule.iter().enumerate() {
            tokio::time::sleep_until(start + *offset).await;
            if self.is_asleep() {
                tracing::debug!(reason, step, "burst abandoned, system asleep");
                break;
            }
            let pending = self.pending();
            if pending.is_empty() {
                tracing::debug!(reason, step, "burst finished early, all desired remotes connected");
                break;
            }
            tracing::info!(reason, step, pending = pending.len(), "recovery burst step");
            attempts += pending.len();
            join_all(
                pending
                    .iter()
                    .map(|id| self.supervisor.submit(*id, Intent::Connect, Trigger::Recovery)),
            )
            .await;
        }
        attempts
    }

    /// React to a host notification. Bursts run in the background.
    pub fn handle_event(self: &Arc<Self>, event: SystemEvent) -> Option<JoinHandle<()>> {
        tracing::info!(event = ?event, "system event");
        match event {
            SystemEvent::WillSleep => {
                self.asleep.store(true, Ordering::Release);
                None
            }
            SystemEvent::DidWake => {
                self.asleep.store(false, Ordering::Release);
                let engine = Arc::clone(self);
                let schedule = self.config.wake_schedule();
                Some(tokio::spawn(async move {
                    engine.burst(&schedule, "wake").await;
                }))
            }
            SystemEvent::NetworkRestored => {
                let engine = Arc::clone(self);
                let schedule = self.config.network_schedule();
                Some(tokio::spawn(async move {
                    engine.burst(&schedule, "network restored").await;
                }))
            }
            SystemEvent::ExternalUnmount { mount_point } => {
                let remote = self
                    .store
                    .remotes()
                    .into_iter()
                    .find(|r| same_path(&r.mount_point, &mount_point))?;
                if !self.desired.contains(&remote.id) {
                    return None;
                }
                let engine = Arc::clone(self);
                Some(tokio::spawn(async move {
                    engine.reconcile(remote.id).await;
                }))
            }
        }
    }

    /// Startup: adopt surviving mounts, then connect the auto-connect remotes.
    pub async fn startup(&self) -> Vec<(RemoteId, SubmitOutcome)> {
        let remotes = self.store.remotes();
        join_all(
            remotes
                .iter()
                .map(|r| self.supervisor.submit(r.id, Intent::Refresh, Trigger::Startup)),
        )
        .await;

        if !self.config.auto_connect_on_startup {
            return Vec::new();
        }
        let selected: Vec<RemoteId> = remotes
            .iter()
            .filter(|r| r.auto_connect)
            .map(|r| r.id)
            .collect();
        for id in &selected {
            self.desired.insert(*id, "auto-connect at startup");
        }

        let pending: Vec<RemoteId> = selected
            .into_iter()
            .filter(|id| !self.is_connected(id))
            .collect();
        join_all(pending.into_iter().map(|id| async move {
            let outcome = self
                .supervisor
                .submit(id, Intent::Connect, Trigger::Startup)
                .await;
            (id, outcome)
        }))
        .await
    }

    /// Timer and notification loop. A wall-clock jump of more than twice the
    /// periodic interval between ticks is treated as a wake.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SystemEvent>, shutdown: CancellationToken) {
        let period = self.config.periodic_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last_wall = Utc::now();
        let mut pass: Option<JoinHandle<PassOutcome>> = None;
        let mut events_open = true;
        tracing::info!(interval_secs = period.as_secs(), "recovery loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let wall = Utc::now();
                    let gap = (wall - last_wall).to_std().unwrap_or_default();
                    last_wall = wall;
                    if gap > period * 2 {
                        tracing::info!(gap_secs = gap.as_secs(), "clock jump detected, treating as wake");
                        self.handle_event(SystemEvent::DidWake);
                    }
                    if pass.as_ref().map_or(true, |handle| handle.is_finished()) {
                        let engine = Arc::clone(&self);
                        pass = Some(tokio::spawn(async move { engine.periodic_pass().await }));
                    }
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => events_open = false,
                },
            }
        }
        if let Some(handle) = pass {
            handle.abort();
        }
        tracing::info!("recovery loop stopped");
    }
}
