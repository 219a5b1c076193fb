//! Entry points for the UI and the daemon binary.
//!
//! [`MountService`] wires the remote table, desired set, lifecycle engine,
//! supervisor and recovery engine together over a set of [`Collaborators`].

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::CommandBuilder;
use crate::config::SshmountConfig;
use crate::credentials::CredentialResolver;
use crate::desired::DesiredConnections;
use crate::diagnostics::DiagnosticsSnapshot;
use crate::error::Result;
use crate::events::OperationEvent;
use crate::lifecycle::MountEngine;
use crate::probe::{FsProbe, MountProbe};
use crate::process::ProcessRunner;
use crate::recovery::{RecoveryEngine, SystemEvent};
use crate::state::{RemoteTable, StatusUpdate};
use crate::store::RemoteStore;
use crate::supervisor::{SubmitOutcome, Supervisor};
use crate::types::{Intent, MountState, RemoteConfig, RemoteId, RemoteStatus, Trigger};

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Runs sshfs, umount and friends.
    pub runner: Arc<dyn ProcessRunner>,
    /// Local filesystem probes.
    pub fs: Arc<dyn FsProbe>,
    /// Password lookup.
    pub credentials: Arc<dyn CredentialResolver>,
    /// Builds the external commands.
    pub builder: Arc<dyn CommandBuilder>,
    /// Saved remotes.
    pub store: Arc<dyn RemoteStore>,
}

#[cfg(unix)]
impl Collaborators {
    /// Real processes, the real filesystem, sshfs, environment passwords and
    /// the remotes from `config`.
    pub fn system(config: &SshmountConfig) -> Self {
        use crate::command::{Platform, SshfsCommandBuilder};
        use crate::credentials::EnvCredentialResolver;
        use crate::probe::SystemFsProbe;
        use crate::process::TokioProcessRunner;
        use crate::store::MemoryRemoteStore;

        Self {
            runner: Arc::new(TokioProcessRunner::default()),
            fs: Arc::new(SystemFsProbe),
            credentials: Arc::new(EnvCredentialResolver),
            builder: Arc::new(SshfsCommandBuilder::new(
                config.sshfs_path.clone(),
                Platform::current(),
            )),
            store: Arc::new(MemoryRemoteStore::new(config.remotes.clone())),
        }
    }
}

/// Running recovery loop.
pub struct RecoveryHandle {
    events: mpsc::Sender<SystemEvent>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RecoveryHandle {
    /// Forward a host notification (sleep, wake, network, external unmount).
    pub async fn notify(&self, event: SystemEvent) {
        if self.events.send(event).await.is_err() {
            tracing::warn!("recovery loop is not running, notification dropped");
        }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "recovery loop ended abnormally");
        }
    }
}

/// The assembled engine: table, supervisor and recovery.
pub struct MountService {
    table: Arc<RemoteTable>,
    desired: Arc<DesiredConnections>,
    supervisor: Arc<Supervisor>,
    recovery: Arc<RecoveryEngine>,
    store: Arc<dyn RemoteStore>,
}

impl MountService {
    /// Wire the components together and register every saved remote.
    pub fn new(config: &SshmountConfig, collaborators: Collaborators) -> Self {
        let table = Arc::new(RemoteTable::new(config.supervisor.event_capacity));
        let desired = Arc::new(DesiredConnections::new());
        for remote in collaborators.store.remotes() {
            table.register(remote.id);
        }

        let probe = MountProbe::new(
            collaborators.runner,
            collaborators.fs,
            collaborators.builder,
            config.lifecycle.probe_timeout(),
        );
        let engine = Arc::new(MountEngine::new(
            config.lifecycle.clone(),
            Arc::clone(&table),
            Arc::clone(&desired),
            Arc::clone(&collaborators.store),
            collaborators.credentials,
            probe,
        ));
        let supervisor = Arc::new(Supervisor::new(
            config.supervisor.clone(),
            engine,
            Arc::clone(&table),
            Arc::clone(&desired),
        ));
        let recovery = Arc::new(RecoveryEngine::new(
            config.recovery.clone(),
            Arc::clone(&supervisor),
            Arc::clone(&desired),
            Arc::clone(&table),
            Arc::clone(&collaborators.store),
        ));

        Self {
            table,
            desired,
            supervisor,
            recovery,
            store: collaborators.store,
        }
    }

    /// Connect on behalf of the user.
    pub async fn connect(&self, remote_id: RemoteId) -> SubmitOutcome {
        self.supervisor
            .submit(remote_id, Intent::Connect, Trigger::Manual)
            .await
    }

    /// Disconnect on behalf of the user.
    pub async fn disconnect(&self, remote_id: RemoteId) -> SubmitOutcome {
        self.supervisor
            .submit(remote_id, Intent::Disconnect, Trigger::Manual)
            .await
    }

    /// Re-probe a remote on behalf of the user.
    pub async fn refresh_status(&self, remote_id: RemoteId) -> SubmitOutcome {
        self.supervisor
            .submit(remote_id, Intent::Refresh, Trigger::Manual)
            .await
    }

    /// Test a remote that may not be saved yet.
    pub async fn test_connection(&self, draft: RemoteConfig) -> SubmitOutcome {
        self.supervisor.test_connection(draft, Trigger::Manual).await
    }

    /// Cancel the live operation of a remote; false if there is none.
    pub fn cancel(&self, remote_id: &RemoteId) -> bool {
        self.supervisor.cancel(remote_id)
    }

    /// Kill the helper processes serving a remote's mount point.
    pub async fn force_stop(&self, remote_id: &RemoteId) -> Result<()> {
        self.supervisor.engine().force_stop(remote_id).await
    }

    /// Tear down engine state for a remote that is about to be deleted from
    /// the store. Call before removing it there.
    pub async fn remove_remote(&self, remote_id: RemoteId) {
        self.desired.remove(&remote_id, "remote deleted");
        let mounted = self.table.status(&remote_id).map_or(false, |status| {
            matches!(status.state, MountState::Connected | MountState::Connecting)
        });
        if mounted || self.supervisor.is_busy(&remote_id) {
            self.supervisor
                .submit(remote_id, Intent::Disconnect, Trigger::Manual)
                .await;
        }
        self.table.forget(&remote_id);
    }

    /// Current status, `None` for unknown remotes.
    pub fn status(&self, remote_id: &RemoteId) -> Option<RemoteStatus> {
        self.table.status(remote_id)
    }

    /// Every known status, sorted by id.
    pub fn statuses(&self) -> Vec<(RemoteId, RemoteStatus)> {
        self.table.statuses()
    }

    /// Receive every status write from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.table.subscribe()
    }

    /// Receive every operation event from now on.
    pub fn subscribe_operations(&self) -> broadcast::Receiver<OperationEvent> {
        self.supervisor.events().subscribe()
    }

    /// Point-in-time diagnostics.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot::collect(
            &self.supervisor,
            &self.table,
            &self.desired,
            self.store.as_ref(),
        )
    }

    /// Desired connections.
    pub fn desired(&self) -> &Arc<DesiredConnections> {
        &self.desired
    }

    /// The operation supervisor.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// The recovery engine.
    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    /// Adopt existing mounts and connect the auto-connect selection.
    pub async fn startup(&self) -> Vec<(RemoteId, SubmitOutcome)> {
        self.recovery.startup().await
    }

    /// Spawn the recovery loop.
    pub fn start_recovery(&self) -> RecoveryHandle {
        let (events, receiver) = mpsc::channel(32);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.recovery).run(receiver, shutdown.clone()));
        RecoveryHandle {
            events,
            shutdown,
            task,
        }
    }

    /// Unmount everything that is mounted or mid-operation. Desired
    /// connections are kept so the next start reconnects them.
    pub async fn terminate(&self) -> Vec<(RemoteId, SubmitOutcome)> {
        let targets: Vec<RemoteId> = self
            .table
            .statuses()
            .into_iter()
            .filter(|(id, status)| {
                status.state != MountState::Disconnected || self.supervisor.is_busy(id)
            })
            .map(|(id, _)| id)
            .collect();
        tracing::info!(remotes = targets.len(), "terminating, unmounting remotes");

        join_all(targets.into_iter().map(|id| async move {
            let outcome = self
                .supervisor
                .submit(id, Intent::Disconnect, Trigger::Termination)
                .await;
            (id, outcome)
        }))
        .await
    }
}
