//! Mount lifecycle engine: the connect, disconnect, refresh and test-connection
//! pipelines.
//!
//! The engine never decides whether it may run; the supervisor admits it and
//! hands it an [`OperationContext`]. Every status write goes through the
//! remote table's operation-id guard so a superseded pipeline cannot clobber
//! the status of the operation that replaced it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::CommandLine;
use crate::config::LifecycleConfig;
use crate::credentials::{CredentialResolver, Secret};
use crate::desired::DesiredConnections;
use crate::error::{is_auth_signature, MountError, Result};
use crate::probe::{scratch_mount_point, Evidence, MountProbe};
use crate::state::{ProbeCounters, RemoteTable};
use crate::store::RemoteStore;
use crate::types::{AuthMode, Intent, MountState, OperationId, RemoteConfig, RemoteId, RemoteStatus, Trigger};

/// Identity of the admitted operation a pipeline runs on behalf of.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Target remote.
    pub remote_id: RemoteId,
    /// Guard for status writes.
    pub operation_id: OperationId,
    /// Who submitted the operation.
    pub trigger: Trigger,
    /// Fires on supersession, user cancel or watchdog expiry.
    pub cancel: CancellationToken,
}

/// Outcome of a connection test against a draft remote.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TestReport {
    /// Mounted and verified.
    pub success: bool,
    /// Summary shown to the user.
    pub message: String,
    /// Wall time of the test.
    pub elapsed: Duration,
}

/// Runs the mount lifecycle pipelines for admitted operations.
pub struct MountEngine {
    config: LifecycleConfig,
    table: Arc<RemoteTable>,
    desired: Arc<DesiredConnections>,
    store: Arc<dyn RemoteStore>,
    credentials: Arc<dyn CredentialResolver>,
    probe: MountProbe,
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(MountError::Cancelled),
    }
}

/// Keep a transitional state visible for at least `minimum`.
async fn hold_transition(started: Instant, minimum: Duration, cancel: &CancellationToken) {
    if let Some(rest) = minimum.checked_sub(started.elapsed()) {
        let _ = sleep_or_cancel(rest, cancel).await;
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Interpret one probing pass for a remote, updating its anti-flap counters.
///
/// A single miss never downgrades a connected remote. Misses add strikes
/// (outside the post-connect cooldown) and the status escalates to error only
/// when the strikes reach the configured threshold. A vanished mount-point
/// directory is positive evidence of unmount and is reported immediately.
pub fn assess(
    evidence: &Evidence,
    previous: &RemoteStatus,
    counters: &mut ProbeCounters,
    mount_point: &Path,
    now: Instant,
    config: &LifecycleConfig,
) -> RemoteStatus {
    if evidence.healthy() {
        counters.record_success(now);
        return RemoteStatus::connected(mount_point);
    }

    let was_connected = previous.state == MountState::Connected;

    if evidence.mount_point_missing() {
        counters.strikes = 0;
        return if was_connected {
            RemoteStatus::error(format!(
                "Mount point {} no longer exists",
                mount_point.display()
            ))
        } else {
            RemoteStatus::disconnected()
        };
    }

    if was_connected {
        if counters.in_cooldown(now) {
            tracing::debug!(mount_point = %mount_point.display(), "probe miss during warm-up ignored");
            return RemoteStatus::connected(mount_point);
        }
        counters.strikes += 1;
        if counters.strikes < config.strike_threshold {
            tracing::debug!(
                mount_point = %mount_point.display(),
                strikes = counters.strikes,
                threshold = config.strike_threshold,
                "probe miss absorbed"
            );
            return RemoteStatus::connected(mount_point);
        }
        let strikes = counters.strikes;
        counters.strikes = 0;
        return match evidence.directory_failure() {
            Some(reason) => RemoteStatus::error(format!(
                "Mount at {} is unresponsive: directory listing failed ({reason})",
                mount_point.display()
            )),
            None => RemoteStatus::error(format!(
                "Mount could not be verified at {} after {strikes} consecutive probes",
                mount_point.display()
            )),
        };
    }

    if evidence.mounted() {
        // Adopted with its first strike; the usual threshold decides from here.
        counters.strikes = 1;
        tracing::debug!(
            mount_point = %mount_point.display(),
            reason = evidence.directory_failure().unwrap_or("no response"),
            "adopting mount that did not answer a directory listing"
        );
        return RemoteStatus::connected(mount_point);
    }

    match previous.state {
        MountState::Error => previous.clone(),
        _ => RemoteStatus::disconnected(),
    }
}

impl MountEngine {
    /// Engine over the shared table and collaborators.
    pub fn new(
        config: LifecycleConfig,
        table: Arc<RemoteTable>,
        desired: Arc<DesiredConnections>,
        store: Arc<dyn RemoteStore>,
        credentials: Arc<dyn CredentialResolver>,
        probe: MountProbe,
    ) -> Self {
        Self {
            config,
            table,
            desired,
            store,
            credentials,
            probe,
        }
    }

    /// Lifecycle tuning in effect.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Saved configuration of a remote.
    pub fn remote_config(&self, remote_id: &RemoteId) -> Result<RemoteConfig> {
        self.store
            .remote(remote_id)
            .ok_or(MountError::RemoteNotFound(*remote_id))
    }

    /// Where a connection test for `draft_id` under `operation_id` mounts. The
    /// supervisor submits tests under the draft's id.
    pub fn test_mount_point(draft_id: &RemoteId, operation_id: OperationId) -> PathBuf {
        scratch_mount_point(&format!("{}-{}", draft_id, operation_id.value()))
    }

    /// Reject mount points shared with, or nested inside, another remote's.
    fn validate_mount_point(&self, remote: &RemoteConfig) -> Result<()> {
        let mine = normalize_path(&remote.mount_point);
        for other in self.store.remotes().iter().filter(|o| o.id != remote.id) {
            let theirs = normalize_path(&other.mount_point);
            if mine == theirs {
                return Err(MountError::MountPointInUse {
                    mount_point: mine.display().to_string(),
                    other: other.name.clone(),
                });
            }
            if mine.starts_with(&theirs) || theirs.starts_with(&mine) {
                return Err(MountError::NestedMountPoint {
                    mount_point: mine.display().to_string(),
                    other: other.name.clone(),
                });
            }
        }
        Ok(())
    }

    async fn resolve_password(
        &self,
        remote: &RemoteConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<Secret>> {
        if !matches!(remote.auth, AuthMode::Password) {
            return Ok(None);
        }
        let timeout = self.config.credential_timeout();
        let lookup = tokio::time::timeout(timeout, self.credentials.resolve_password(&remote.id));
        let resolved = tokio::select! {
            r = lookup => r,
            _ = cancel.cancelled() => return Err(MountError::Cancelled),
        };
        match resolved {
            Ok(Ok(Some(secret))) => Ok(Some(secret)),
            Ok(Ok(None)) => Err(MountError::Credentials(format!(
                "no password stored for remote '{}'",
                remote.name
            ))),
            Ok(Err(e)) => Err(MountError::Credentials(e)),
            Err(_) => Err(MountError::CommandTimedOut {
                command: "credential lookup".to_string(),
                elapsed_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn run_mount(
        &self,
        remote: &RemoteConfig,
        command: &CommandLine,
        password: Option<Secret>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let redactor = password.clone();
        let output = match self
            .probe
            .run(command, self.config.mount_command_timeout(), password, cancel)
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MountError::MissingDependency {
                    name: command.program.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        if output.cancelled {
            return Err(MountError::Cancelled);
        }
        if output.timed_out {
            return Err(MountError::CommandTimedOut {
                command: command.display.clone(),
                elapsed_ms: output.duration.as_millis() as u64,
            });
        }
        if output.success() {
            return Ok(());
        }

        let raw = output.diagnostic_text();
        let detail = match &redactor {
            Some(secret) => secret.redact(raw),
            None => raw.to_string(),
        };
        let detail = if detail.is_empty() {
            "no output".to_string()
        } else {
            detail
        };
        if is_auth_signature(&detail) {
            return Err(MountError::AuthenticationRejected {
                host: remote.host.clone(),
                detail,
            });
        }
        Err(MountError::CommandFailed {
            exit_code: output.exit_code,
            detail,
        })
    }

    /// Poll the second-source mount check until it agrees with the command.
    async fn verify_mounted(&self, mount_point: &Path, cancel: &CancellationToken) -> Result<()> {
        let attempts = self.config.verify_attempts.max(1);
        for attempt in 1..=attempts {
            if self.probe.is_mounted(mount_point, cancel).await {
                return Ok(());
            }
            if attempt < attempts {
                sleep_or_cancel(self.config.verify_interval(), cancel).await?;
            }
        }
        Err(MountError::MountNotVisible {
            mount_point: mount_point.display().to_string(),
        })
    }

    /// Credentials, pre-cleanup, mount command with one transient retry, then
    /// verification. Shared by connect and test connection.
    async fn mount_remote(
        &self,
        remote: &RemoteConfig,
        mount_point: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let password = self.resolve_password(remote, cancel).await?;

        if self.probe.is_mounted(mount_point, cancel).await {
            tracing::info!(
                remote_id = %remote.id,
                mount_point = %mount_point.display(),
                "mount point already mounted, cleaning up before connect"
            );
            self.unmount_sequence(mount_point, cancel).await?;
        }

        self.probe.fs().prepare_mount_point(mount_point).await?;
        let command = self
            .probe
            .builder()
            .mount_command(remote, mount_point, password.is_some())?;

        let mut retried = false;
        loop {
            match self.run_mount(remote, &command, password.clone(), cancel).await {
                Ok(()) => break,
                Err(e) if !retried && e.is_transient_command_failure() => {
                    retried = true;
                    tracing::warn!(
                        remote_id = %remote.id,
                        command = %command.display,
                        error = %e,
                        "transient mount failure, retrying once"
                    );
                    sleep_or_cancel(self.config.transient_retry_delay(), cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }

        self.verify_mounted(mount_point, cancel).await
    }

    /// Escalating unmount until the mount point no longer shows as mounted.
    async fn unmount_sequence(&self, mount_point: &Path, cancel: &CancellationToken) -> Result<()> {
        if !self.probe.is_mounted(mount_point, cancel).await {
            return Ok(());
        }
        let mut last_detail = String::from("still mounted after all unmount attempts");
        for command in self.probe.builder().unmount_commands(mount_point) {
            if cancel.is_cancelled() {
                return Err(MountError::Cancelled);
            }
            match self
                .probe
                .run(&command, self.config.unmount_step_timeout(), None, cancel)
                .await
            {
                Ok(out) if out.cancelled => return Err(MountError::Cancelled),
                Ok(out) if out.success() => {
                    tracing::debug!(command = %command.display, "unmount command succeeded");
                }
                Ok(out) => {
                    last_detail = if out.timed_out {
                        format!("{} timed out", command.display)
                    } else {
                        format!("{}: {}", command.display, out.diagnostic_text())
                    };
                    tracing::debug!(command = %command.display, exit_code = ?out.exit_code, "unmount command failed");
                }
                Err(e) => {
                    last_detail = format!("{}: {e}", command.display);
                    tracing::debug!(command = %command.display, error = %e, "unmount command could not start");
                }
            }
            if !self.probe.is_mounted(mount_point, cancel).await {
                return Ok(());
            }
        }
        Err(MountError::UnmountFailed {
            mount_point: mount_point.display().to_string(),
            detail: last_detail,
        })
    }

    /// Last resort after the unmount sequence: kill the helpers, then re-probe.
    async fn force_stop_and_verify(
        &self,
        mount_point: &Path,
        detail: String,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.probe.force_stop(mount_point).await;
        if self.probe.is_mounted(mount_point, cancel).await {
            Err(MountError::UnmountFailed {
                mount_point: mount_point.display().to_string(),
                detail: format!("{detail}; still mounted after force stop"),
            })
        } else {
            Ok(())
        }
    }

    /// Mount the remote and verify it, retrying once on a transient failure.
    pub async fn connect(&self, ctx: &OperationContext) -> Result<RemoteStatus> {
        let remote = self.remote_config(&ctx.remote_id)?;
        self.validate_mount_point(&remote)?;

        let started = Instant::now();
        self.table
            .write_if_current(ctx.remote_id, ctx.operation_id, RemoteStatus::connecting());

        let result = self
            .mount_remote(&remote, &remote.mount_point, &ctx.cancel)
            .await;
        hold_transition(started, self.config.min_connect_transition(), &ctx.cancel).await;
        result?;

        let cooldown = self.config.reconnect_cooldown();
        let current = self
            .table
            .update_if_current(ctx.remote_id, ctx.operation_id, |entry| {
                entry.counters.on_connected(Instant::now(), cooldown)
            })
            .is_some();
        if current {
            self.desired.insert(ctx.remote_id, "connected");
        }

        tracing::info!(
            remote_id = %ctx.remote_id,
            operation_id = %ctx.operation_id,
            mount_point = %remote.mount_point.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "remote connected"
        );
        Ok(RemoteStatus::connected(&remote.mount_point))
    }

    /// Unmount the remote, escalating to forced unmounts when needed.
    pub async fn disconnect(&self, ctx: &OperationContext) -> Result<RemoteStatus> {
        let remote = self.remote_config(&ctx.remote_id)?;
        // Termination keeps the user's intent so the next launch reconnects.
        if ctx.trigger != Trigger::Termination {
            self.desired.remove(&ctx.remote_id, "disconnect requested");
        }

        let mount_point = remote.mount_point.as_path();
        let started = Instant::now();
        self.table.write_if_current(
            ctx.remote_id,
            ctx.operation_id,
            RemoteStatus::disconnecting(mount_point),
        );

        let outer = self.config.unmount_outer_timeout();
        let outcome = match tokio::time::timeout(outer, self.unmount_sequence(mount_point, &ctx.cancel)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(MountError::Cancelled)) => Err(MountError::Cancelled),
            Ok(Err(e)) => {
                tracing::warn!(
                    remote_id = %ctx.remote_id,
                    mount_point = %mount_point.display(),
                    error = %e,
                    "unmount sequence failed, force-stopping helper processes"
                );
                self.force_stop_and_verify(mount_point, e.to_string(), &ctx.cancel)
                    .await
            }
            Err(_) => {
                tracing::warn!(
                    remote_id = %ctx.remote_id,
                    mount_point = %mount_point.display(),
                    timeout_ms = outer.as_millis() as u64,
                    "unmount timed out, force-stopping helper processes"
                );
                let detail = format!("unmount timed out after {}ms", outer.as_millis());
                self.force_stop_and_verify(mount_point, detail, &ctx.cancel)
                    .await
            }
        };

        self.table
            .update_if_current(ctx.remote_id, ctx.operation_id, |entry| entry.counters.reset());
        hold_transition(started, self.config.min_disconnect_transition(), &ctx.cancel).await;
        outcome?;

        tracing::info!(
            remote_id = %ctx.remote_id,
            operation_id = %ctx.operation_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "remote disconnected"
        );
        Ok(RemoteStatus::disconnected())
    }

    /// Probe the mount point and apply the anti-flap rules to the result.
    pub async fn refresh(&self, ctx: &OperationContext) -> Result<RemoteStatus> {
        let remote = self.remote_config(&ctx.remote_id)?;
        let evidence = self.probe.gather(&remote.mount_point, &ctx.cancel).await;
        if ctx.cancel.is_cancelled() {
            return Err(MountError::Cancelled);
        }
        tracing::debug!(remote_id = %ctx.remote_id, evidence = ?evidence, "refresh evidence");

        let now = Instant::now();
        self.table
            .update_if_current(ctx.remote_id, ctx.operation_id, |entry| {
                let previous = entry.status.clone();
                assess(
                    &evidence,
                    &previous,
                    &mut entry.counters,
                    &remote.mount_point,
                    now,
                    &self.config,
                )
            })
            .ok_or(MountError::Superseded)
    }

    /// Mount `draft` on a throwaway mount point, then tear down whatever the
    /// outcome. Never touches remote status.
    pub async fn test_connection(&self, ctx: &OperationContext, draft: &RemoteConfig) -> Result<TestReport> {
        let started = Instant::now();
        let mount_point = Self::test_mount_point(&draft.id, ctx.operation_id);
        let result = self.mount_remote(draft, &mount_point, &ctx.cancel).await;

        let teardown = CancellationToken::new();
        if let Err(e) = self.unmount_sequence(&mount_point, &teardown).await {
            tracing::warn!(mount_point = %mount_point.display(), error = %e, "test mount teardown failed");
            self.probe.force_stop(&mount_point).await;
        }
        if let Err(e) = self.probe.fs().remove_mount_point(&mount_point).await {
            tracing::debug!(mount_point = %mount_point.display(), error = %e, "could not remove test mount point");
        }

        let elapsed = started.elapsed();
        match result {
            Ok(()) => Ok(TestReport {
                success: true,
                message: format!("Connected to {}@{}:{}", draft.username, draft.host, draft.port),
                elapsed,
            }),
            Err(MountError::Cancelled) => Err(MountError::Cancelled),
            Err(e) => Ok(TestReport {
                success: false,
                message: e.to_string(),
                elapsed,
            }),
        }
    }

    /// Kill helper processes serving the remote's mount point.
    pub async fn force_stop(&self, remote_id: &RemoteId) -> Result<()> {
        let remote = self.remote_config(remote_id)?;
        self.probe.force_stop(&remote.mount_point).await;
        Ok(())
    }

    /// Best-effort teardown after an operation was abandoned by cancellation or
    /// the watchdog. Runs in the background; the caller never waits for it.
    pub fn spawn_abort_cleanup(
        &self,
        intent: Intent,
        remote_id: RemoteId,
        operation_id: OperationId,
    ) {
        let mount_point = match intent {
            Intent::Refresh => return,
            Intent::TestConnection => Self::test_mount_point(&remote_id, operation_id),
            Intent::Connect | Intent::Disconnect => match self.store.remote(&remote_id) {
                Some(remote) => remote.mount_point,
                None => return,
            },
        };
        let probe = self.probe.clone();
        let table = Arc::clone(&self.table);
        let step_timeout = self.config.unmount_step_timeout();

        tokio::spawn(async move {
            // A newer operation owns the mount point now; leave it alone.
            let shared = intent != Intent::TestConnection;
            if shared && table.is_busy(&remote_id) {
                tracing::debug!(remote_id = %remote_id, "skipping abort cleanup, remote busy again");
                return;
            }
            probe.force_stop(&mount_point).await;
            if shared && table.is_busy(&remote_id) {
                return;
            }
            let cancel = CancellationToken::new();
            if probe.is_mounted(&mount_point, &cancel).await {
                for command in probe.builder().unmount_commands(&mount_point) {
                    let _ = probe.run(&command, step_timeout, None, &cancel).await;
                    if !probe.is_mounted(&mount_point, &cancel).await {
                        break;
                    }
                }
            }
            if intent == Intent::TestConnection {
                let _ = probe.fs().remove_mount_point(&mount_point).await;
            }
            tracing::debug!(
                remote_id = %remote_id,
                operation_id = %operation_id,
                intent = %intent,
                "abort cleanup finished"
            );
        });
    }
}
