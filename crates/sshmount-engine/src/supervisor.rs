//! Operation supervisor: one live operation per remote, a global limiter
//! across remotes, and a watchdog around every lifecycle pipeline.
//!
//! `submit` never fails. Every admission resolves to a [`SubmitOutcome`], and
//! every admission, supersession, skip, cancellation, timeout and completion is
//! published on the operation event bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::desired::DesiredConnections;
use crate::error::{MountError, Result};
use crate::events::{EventBus, OperationEvent, OperationEventKind};
use crate::lifecycle::{MountEngine, OperationContext, TestReport};
use crate::state::{CancelCause, OperationRecord, RemoteTable};
use crate::types::{Intent, OperationId, RemoteConfig, RemoteId, RemoteStatus, Trigger};

/// What happens when a submission finds the remote busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Cancel the running operation and take its slot.
    LatestIntentWins,
    /// Leave the running operation alone unless it has gone stale.
    SkipIfBusy,
}

impl ConflictPolicy {
    /// User and shutdown requests win; automatic ones yield.
    pub fn for_trigger(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Manual | Trigger::Termination => ConflictPolicy::LatestIntentWins,
            Trigger::Recovery | Trigger::Startup => ConflictPolicy::SkipIfBusy,
        }
    }
}

/// Result of submitting an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Ran to completion; the status was applied.
    Completed(RemoteStatus),
    /// A connection test finished.
    Tested(TestReport),
    /// The watchdog fired; carries the timeout error status.
    TimedOut(RemoteStatus),
    /// The remote was busy and the policy said not to interfere.
    Skipped,
    /// A newer operation took the slot; this one's result was discarded.
    Superseded,
    /// Cancelled by the user; the prior status was restored.
    Cancelled,
}

impl SubmitOutcome {
    /// Status carried by the outcome, if any.
    pub fn status(&self) -> Option<&RemoteStatus> {
        match self {
            SubmitOutcome::Completed(status) | SubmitOutcome::TimedOut(status) => Some(status),
            _ => None,
        }
    }
}

enum Admission {
    Admitted {
        record: OperationRecord,
        superseded: Option<OperationRecord>,
    },
    Skipped {
        busy: OperationRecord,
    },
}

enum Finished {
    Status(RemoteStatus),
    Report(TestReport),
}

/// Status to fall back to when an operation is abandoned: whatever was showing
/// before it started, unless that was itself mid-transition.
fn restorable(prior: &RemoteStatus) -> RemoteStatus {
    if prior.state.is_transitional() {
        RemoteStatus::disconnected()
    } else {
        prior.clone()
    }
}

/// What a finished connection test leaves behind. Tests own no status, but one
/// that replaced a transitional operation must not leave its status showing.
fn settle_after_test(current: &RemoteStatus, prior: &RemoteStatus) -> Option<RemoteStatus> {
    current.state.is_transitional().then(|| restorable(prior))
}

fn outcome_for(cause: Option<CancelCause>) -> SubmitOutcome {
    match cause {
        Some(CancelCause::Superseded) => SubmitOutcome::Superseded,
        _ => SubmitOutcome::Cancelled,
    }
}

/// Admits operations into per-remote slots and runs them under the limiter and watchdog.
pub struct Supervisor {
    config: SupervisorConfig,
    engine: Arc<MountEngine>,
    table: Arc<RemoteTable>,
    desired: Arc<DesiredConnections>,
    limiter: Arc<Semaphore>,
    events: EventBus,
    next_operation: AtomicU64,
}

impl Supervisor {
    /// Supervisor with a limiter of `config.max_concurrent_operations` permits.
    pub fn new(
        config: SupervisorConfig,
        engine: Arc<MountEngine>,
        table: Arc<RemoteTable>,
        desired: Arc<DesiredConnections>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_operations.max(1)));
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            engine,
            table,
            desired,
            limiter,
            events,
            next_operation: AtomicU64::new(1),
        }
    }

    /// Operation event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Admission and watchdog settings.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Pipelines the supervisor runs.
    pub fn engine(&self) -> &Arc<MountEngine> {
        &self.engine
    }

    /// Admit and run one lifecycle operation for a configured remote.
    pub async fn submit(&self, remote_id: RemoteId, intent: Intent, trigger: Trigger) -> SubmitOutcome {
        self.submit_inner(remote_id, intent, trigger, None).await
    }

    /// Test a draft remote. Occupies the draft id's slot like any other
    /// operation but never writes a status.
    pub async fn test_connection(&self, draft: RemoteConfig, trigger: Trigger) -> SubmitOutcome {
        self.submit_inner(draft.id, Intent::TestConnection, trigger, Some(draft))
            .await
    }

    fn next_id(&self) -> OperationId {
        OperationId::new(self.next_operation.fetch_add(1, Ordering::Relaxed))
    }

    fn event(&self, kind: OperationEventKind, record: &OperationRecord) -> OperationEvent {
        OperationEvent::new(
            kind,
            record.remote_id,
            Some(record.operation_id),
            record.intent,
            record.trigger,
        )
        .elapsed(record.started_at.elapsed())
        .queue_wait(record.queue_wait)
    }

    fn admit(&self, remote_id: RemoteId, intent: Intent, trigger: Trigger) -> Admission {
        let policy = ConflictPolicy::for_trigger(trigger);
        let stale_after = self.config.stale_after();
        let now = Instant::now();

        self.table.with_entry(remote_id, |entry| {
            let superseded = match entry.active.clone() {
                None => None,
                Some(existing) => {
                    let age = now.saturating_duration_since(existing.started_at);
                    if policy == ConflictPolicy::SkipIfBusy && age < stale_after {
                        return Admission::Skipped { busy: existing };
                    }
                    existing.cancel_with(CancelCause::Superseded);
                    Some(existing)
                }
            };
            let prior_status = superseded
                .as_ref()
                .map(|old| old.prior_status.clone())
                .unwrap_or_else(|| entry.status.clone());
            let record = OperationRecord {
                operation_id: self.next_id(),
                remote_id,
                intent,
                trigger,
                started_at: now,
                running_since: None,
                queue_wait: None,
                cancel: CancellationToken::new(),
                cause: Arc::new(OnceLock::new()),
                prior_status,
            };
            entry.active = Some(record.clone());
            Admission::Admitted { record, superseded }
        })
    }

    async fn submit_inner(
        &self,
        remote_id: RemoteId,
        intent: Intent,
        trigger: Trigger,
        draft: Option<RemoteConfig>,
    ) -> SubmitOutcome {
        let record = match self.admit(remote_id, intent, trigger) {
            Admission::Skipped { busy } => {
                self.events.publish(
                    OperationEvent::new(OperationEventKind::Skipped, remote_id, None, intent, trigger)
                        .detail(format!("busy with {} {}", busy.intent, busy.operation_id)),
                );
                return SubmitOutcome::Skipped;
            }
            Admission::Admitted { record, superseded } => {
                if let Some(old) = superseded {
                    self.events.publish(self.event(OperationEventKind::Superseded, &old).detail(
                        format!("replaced by {} {} ({})", intent, record.operation_id, trigger),
                    ));
                }
                self.events
                    .publish(self.event(OperationEventKind::Admitted, &record));
                record
            }
        };
        let operation_id = record.operation_id;
        let ctx = OperationContext {
            remote_id,
            operation_id,
            trigger,
            cancel: record.cancel.clone(),
        };

        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                // Superseded or cancelled while queued; whoever cancelled owns the slot now.
                return outcome_for(record.cause.get().copied());
            }
            permit = Arc::clone(&self.limiter).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    let write = (intent != Intent::TestConnection)
                        .then(|| restorable(&record.prior_status));
                    self.release(&record, write);
                    return SubmitOutcome::Cancelled;
                }
            },
        };

        let queue_wait = record.started_at.elapsed();
        let running = self
            .table
            .update_if_current(remote_id, operation_id, |entry| {
                if let Some(active) = entry.active.as_mut() {
                    active.running_since = Some(Instant::now());
                    active.queue_wait = Some(queue_wait);
                }
            })
            .is_some();
        if !running {
            return outcome_for(record.cause.get().copied());
        }
        let record = OperationRecord {
            queue_wait: Some(queue_wait),
            ..record
        };
        self.events
            .publish(self.event(OperationEventKind::Started, &record));

        let watchdog = self.config.watchdog(intent);
        let run_started = Instant::now();
        let work = async {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(MountError::Cancelled),
                result = self.run_intent(&ctx, intent, draft.as_ref()) => result,
            }
        };
        let result = tokio::time::timeout(watchdog, work).await;
        drop(permit);

        match result {
            Err(_) => self.on_timeout(&record, run_started.elapsed()),
            Ok(Ok(finished)) => self.on_finished(&record, finished),
            Ok(Err(MountError::Cancelled | MountError::Superseded)) => self.on_abandoned(&record),
            Ok(Err(error)) => self.on_failed(&record, error),
        }
    }

    async fn run_intent(
        &self,
        ctx: &OperationContext,
        intent: Intent,
        draft: Option<&RemoteConfig>,
    ) -> Result<Finished> {
        match intent {
            Intent::Connect => self.engine.connect(ctx).await.map(Finished::Status),
            Intent::Disconnect => self.engine.disconnect(ctx).await.map(Finished::Status),
            Intent::Refresh => self.engine.refresh(ctx).await.map(Finished::Status),
            Intent::TestConnection => {
                let draft = match draft {
                    Some(draft) => draft.clone(),
                    None => self.engine.remote_config(&ctx.remote_id)?,
                };
                self.engine
                    .test_connection(ctx, &draft)
                    .await
                    .map(Finished::Report)
            }
        }
    }

    /// Give up the slot held by `record`, writing `status` if given. Tests pass
    /// `None` and only undo a transitional status left by an operation they
    /// superseded. Returns `false` if the slot was already lost.
    fn release(&self, record: &OperationRecord, status: Option<RemoteStatus>) -> bool {
        let test = record.intent == Intent::TestConnection;
        let released = self
            .table
            .complete_with(record.remote_id, record.operation_id, |current| match status {
                Some(status) => Some(status),
                None if test => settle_after_test(current, &record.prior_status),
                None => None,
            });
        if released && test {
            self.forget_draft(record.remote_id);
        }
        released
    }

    /// Drafts that were never saved keep no entry once their test is over.
    fn forget_draft(&self, remote_id: RemoteId) {
        if self.engine.remote_config(&remote_id).is_ok() {
            return;
        }
        if self.table.forget_if_idle(&remote_id) {
            tracing::debug!(remote_id = %remote_id, "released entry of unsaved draft");
        }
    }

    /// The slot was lost between finishing and writing back.
    fn dropped(&self, record: &OperationRecord, detail: &str) -> SubmitOutcome {
        self.events
            .publish(self.event(OperationEventKind::Dropped, record).detail(detail));
        outcome_for(record.cause.get().copied())
    }

    fn on_timeout(&self, record: &OperationRecord, elapsed: std::time::Duration) -> SubmitOutcome {
        record.cancel_with(CancelCause::TimedOut);
        let message = MountError::Timeout {
            intent: record.intent,
            elapsed_ms: elapsed.as_millis() as u64,
        }
        .to_string();
        let status = RemoteStatus::error(message.clone());
        let write = (record.intent != Intent::TestConnection).then(|| status.clone());

        if !self.release(record, write) {
            return self.dropped(record, "timed out after losing its slot");
        }
        self.events
            .publish(self.event(OperationEventKind::TimedOut, record).detail(message));
        self.engine
            .spawn_abort_cleanup(record.intent, record.remote_id, record.operation_id);
        SubmitOutcome::TimedOut(status)
    }

    fn on_finished(&self, record: &OperationRecord, finished: Finished) -> SubmitOutcome {
        let (write, outcome, detail) = match finished {
            Finished::Status(status) => {
                let detail = status.state.to_string();
                (Some(status.clone()), SubmitOutcome::Completed(status), detail)
            }
            Finished::Report(report) => {
                let detail = if report.success {
                    "test succeeded".to_string()
                } else {
                    format!("test failed: {}", report.message)
                };
                (None, SubmitOutcome::Tested(report), detail)
            }
        };
        if !self.release(record, write) {
            return self.dropped(record, "result discarded");
        }
        self.events
            .publish(self.event(OperationEventKind::Completed, record).detail(detail));
        outcome
    }

    fn on_failed(&self, record: &OperationRecord, error: MountError) -> SubmitOutcome {
        let message = error.to_string();
        if record.intent == Intent::TestConnection {
            if !self.release(record, None) {
                return self.dropped(record, "result discarded");
            }
            self.events.publish(
                self.event(OperationEventKind::Completed, record)
                    .detail(format!("test failed: {message}")),
            );
            return SubmitOutcome::Tested(TestReport {
                success: false,
                message,
                elapsed: record.started_at.elapsed(),
            });
        }

        let status = RemoteStatus::error(message.clone());
        if !self.release(record, Some(status.clone())) {
            return self.dropped(record, "failure discarded");
        }
        let class = self.desired.record_failure(&record.remote_id, &error);
        self.events.publish(
            self.event(OperationEventKind::Completed, record)
                .detail(format!("{class:?} failure: {message}")),
        );
        SubmitOutcome::Completed(status)
    }

    /// The pipeline stopped because its token fired. Normally the canceller
    /// already released the slot; if not, restore the prior status.
    fn on_abandoned(&self, record: &OperationRecord) -> SubmitOutcome {
        let restored = restorable(&record.prior_status);
        let write = (record.intent != Intent::TestConnection).then_some(restored);
        if self.release(record, write) {
            tracing::debug!(
                remote_id = %record.remote_id,
                operation_id = %record.operation_id,
                "abandoned operation released its own slot"
            );
        }
        self.dropped(record, "abandoned")
    }

    /// Cancel the remote's live operation. Returns without waiting for the
    /// pipeline or its external processes to wind down.
    pub fn cancel(&self, remote_id: &RemoteId) -> bool {
        let cancelled = self.table.with_entry(*remote_id, |entry| {
            let record = entry.active.take()?;
            record.cancel_with(CancelCause::UserCancelled);
            let restored = if record.intent == Intent::TestConnection {
                settle_after_test(&entry.status, &record.prior_status)
            } else {
                Some(restorable(&record.prior_status))
            };
            if let Some(status) = restored {
                entry.set_status(status);
            }
            Some(record)
        });
        let Some(record) = cancelled else {
            return false;
        };

        self.events
            .publish(self.event(OperationEventKind::Cancelled, &record));
        if record.intent == Intent::TestConnection {
            self.forget_draft(record.remote_id);
        }
        if matches!(record.intent, Intent::Connect | Intent::TestConnection) {
            self.engine
                .spawn_abort_cleanup(record.intent, record.remote_id, record.operation_id);
        }
        true
    }

    /// Live operation of every busy remote.
    pub fn active_operations(&self) -> Vec<OperationRecord> {
        self.table
            .snapshots()
            .into_iter()
            .filter_map(|snapshot| snapshot.active)
            .collect()
    }

    /// No remote has a live operation.
    pub fn is_idle(&self) -> bool {
        self.table.active_count() == 0
    }

    /// Remote has a live operation.
    pub fn is_busy(&self, remote_id: &RemoteId) -> bool {
        self.table.is_busy(remote_id)
    }

    /// Permits not currently held.
    pub fn limiter_available(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Total number of permits.
    pub fn capacity(&self) -> usize {
        self.config.max_concurrent_operations.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MountState;

    #[test]
    fn policy_by_trigger() {
        assert_eq!(ConflictPolicy::for_trigger(Trigger::Manual), ConflictPolicy::LatestIntentWins);
        assert_eq!(
            ConflictPolicy::for_trigger(Trigger::Termination),
            ConflictPolicy::LatestIntentWins
        );
        assert_eq!(ConflictPolicy::for_trigger(Trigger::Recovery), ConflictPolicy::SkipIfBusy);
        assert_eq!(ConflictPolicy::for_trigger(Trigger::Startup), ConflictPolicy::SkipIfBusy);
    }

    #[test]
    fn transitional_prior_status_restores_to_disconnected() {
        assert_eq!(
            restorable(&RemoteStatus::connecting()).state,
            MountState::Disconnected
        );
        let connected = RemoteStatus::connected("/mnt/a");
        assert_eq!(restorable(&connected), connected);
    }

    #[test]
    fn test_restores_only_transitional_status() {
        let prior = RemoteStatus::connected("/mnt/a");
        assert_eq!(
            settle_after_test(&RemoteStatus::connecting(), &prior),
            Some(prior.clone())
        );
        assert_eq!(
            settle_after_test(&RemoteStatus::disconnecting("/mnt/a"), &RemoteStatus::connecting())
                .map(|s| s.state),
            Some(MountState::Disconnected)
        );
        assert_eq!(settle_after_test(&RemoteStatus::error("boom"), &prior), None);
    }

    #[test]
    fn outcome_follows_cancel_cause() {
        assert_eq!(outcome_for(Some(CancelCause::Superseded)), SubmitOutcome::Superseded);
        assert_eq!(outcome_for(Some(CancelCause::UserCancelled)), SubmitOutcome::Cancelled);
        assert_eq!(outcome_for(None), SubmitOutcome::Cancelled);
    }

    #[test]
    fn outcome_status_accessor() {
        let status = RemoteStatus::error("connect timed out after 45000ms");
        assert_eq!(SubmitOutcome::TimedOut(status.clone()).status(), Some(&status));
        assert!(SubmitOutcome::Skipped.status().is_none());
    }
}
