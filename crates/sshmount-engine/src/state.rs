//! Per-remote authoritative state: status, live operation record and probe
//! counters, each remote behind its own mutex.
//!
//! The mutex is only ever held for mutation and never across an `.await`, so
//! work on different remotes never contends and I/O never runs under a lock.
//! Every status write that belongs to an operation goes through
//! [`RemoteTable::update_if_current`] or [`RemoteTable::complete`], which compare
//! operation ids under the lock; a superseded operation can therefore never
//! overwrite the status of the operation that replaced it.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::{Intent, OperationId, RemoteId, RemoteStatus, Trigger};

/// Anti-flap bookkeeping for one remote.
#[derive(Debug, Clone, Default)]
pub struct ProbeCounters {
    /// Consecutive probes that failed to confirm a previously connected mount.
    pub strikes: u32,
    /// Misses before this instant do not count as strikes.
    pub cooldown_until: Option<Instant>,
    /// Last probe that confirmed the mount.
    pub last_success: Option<Instant>,
}

impl ProbeCounters {
    /// Inside the warm-up window at `now`.
    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(false, |until| now < until)
    }

    /// Confirmed mount: clear strikes.
    pub fn record_success(&mut self, now: Instant) {
        self.strikes = 0;
        self.last_success = Some(now);
    }

    /// Fresh mount: reset strikes and open the warm-up window.
    pub fn on_connected(&mut self, now: Instant, cooldown: Duration) {
        self.record_success(now);
        self.cooldown_until = Some(now + cooldown);
    }

    /// Forget everything, as after an unmount.
    pub fn reset(&mut self) {
        *self = ProbeCounters::default();
    }
}

/// Why a live operation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// Replaced by a newer operation on the same remote.
    Superseded,
    /// Explicit user cancellation.
    UserCancelled,
    /// Watchdog expiry.
    TimedOut,
}

/// The live operation occupying a remote's slot.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    /// Unique id of this admission.
    pub operation_id: OperationId,
    /// Remote whose slot this occupies.
    pub remote_id: RemoteId,
    /// What the operation does.
    pub intent: Intent,
    /// Who asked for it.
    pub trigger: Trigger,
    /// Admission time; staleness is measured from here.
    pub started_at: Instant,
    /// Set once the limiter permit is held.
    pub running_since: Option<Instant>,
    /// Time spent waiting for the permit.
    pub queue_wait: Option<Duration>,
    /// Cancels the operation's work.
    pub cancel: CancellationToken,
    pub(crate) cause: Arc<OnceLock<CancelCause>>,
    /// Status to restore if the operation is cancelled by the user.
    pub(crate) prior_status: RemoteStatus,
}

impl OperationRecord {
    /// Cancel the operation's work, remembering the first cause.
    pub(crate) fn cancel_with(&self, cause: CancelCause) {
        let _ = self.cause.set(cause);
        self.cancel.cancel();
    }
}

#[derive(Debug)]
pub(crate) struct RemoteEntry {
    pub status: RemoteStatus,
    pub active: Option<OperationRecord>,
    pub counters: ProbeCounters,
    revision: u64,
}

impl RemoteEntry {
    fn new() -> Self {
        RemoteEntry {
            status: RemoteStatus::disconnected(),
            active: None,
            counters: ProbeCounters::default(),
            revision: 0,
        }
    }

    pub fn set_status(&mut self, status: RemoteStatus) {
        self.status = status;
        self.revision += 1;
    }

    pub fn is_current(&self, operation_id: OperationId) -> bool {
        self.active
            .as_ref()
            .map_or(false, |record| record.operation_id == operation_id)
    }
}

/// Broadcast on every status write.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// Remote whose status changed.
    pub remote_id: RemoteId,
    /// The status just written.
    pub status: RemoteStatus,
}

/// Read-only copy of a remote's entry for diagnostics.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    /// Remote the entry belongs to.
    pub remote_id: RemoteId,
    /// Status at snapshot time.
    pub status: RemoteStatus,
    /// Live operation, if any.
    pub active: Option<OperationRecord>,
    /// Anti-flap counters.
    pub counters: ProbeCounters,
}

/// Status, live operation and counters of every known remote.
pub struct RemoteTable {
    entries: DashMap<RemoteId, Arc<Mutex<RemoteEntry>>>,
    updates: broadcast::Sender<StatusUpdate>,
}

fn lock(entry: &Mutex<RemoteEntry>) -> MutexGuard<'_, RemoteEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RemoteTable {
    /// Empty table whose update channel buffers `update_capacity` writes.
    pub fn new(update_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            entries: DashMap::new(),
            updates,
        }
    }

    fn entry(&self, remote_id: RemoteId) -> Arc<Mutex<RemoteEntry>> {
        // Clone the Arc out so the shard lock is released before the entry lock is taken.
        self.entries
            .entry(remote_id)
            .or_insert_with(|| Arc::new(Mutex::new(RemoteEntry::new())))
            .clone()
    }

    fn existing(&self, remote_id: &RemoteId) -> Option<Arc<Mutex<RemoteEntry>>> {
        self.entries.get(remote_id).map(|e| e.value().clone())
    }

    /// Make sure a remote has an entry (initially disconnected).
    pub fn register(&self, remote_id: RemoteId) {
        self.entry(remote_id);
    }

    /// Drop a remote's entry entirely, e.g. after the remote was deleted.
    pub fn forget(&self, remote_id: &RemoteId) {
        self.entries.remove(remote_id);
    }

    /// Drop a remote's entry unless an operation holds its slot. Returns
    /// whether it was dropped.
    pub fn forget_if_idle(&self, remote_id: &RemoteId) -> bool {
        self.entries
            .remove_if(remote_id, |_, entry| lock(entry).active.is_none())
            .is_some()
    }

    /// Status updates for every remote.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    /// Run `f` against the remote's entry under its lock, publishing a status
    /// update if `f` wrote one.
    pub(crate) fn with_entry<R>(&self, remote_id: RemoteId, f: impl FnOnce(&mut RemoteEntry) -> R) -> R {
        let entry = self.entry(remote_id);
        let mut guard = lock(&entry);
        let before = guard.revision;
        let result = f(&mut guard);
        if guard.revision != before {
            let _ = self.updates.send(StatusUpdate {
                remote_id,
                status: guard.status.clone(),
            });
        }
        result
    }

    /// Like [`with_entry`](Self::with_entry) but only runs `f` while `operation_id`
    /// still owns the remote's slot.
    pub(crate) fn update_if_current<R>(
        &self,
        remote_id: RemoteId,
        operation_id: OperationId,
        f: impl FnOnce(&mut RemoteEntry) -> R,
    ) -> Option<R> {
        self.with_entry(remote_id, |entry| {
            if entry.is_current(operation_id) {
                Some(f(entry))
            } else {
                None
            }
        })
    }

    /// Write an intermediate status on behalf of a live operation.
    pub fn write_if_current(
        &self,
        remote_id: RemoteId,
        operation_id: OperationId,
        status: RemoteStatus,
    ) -> bool {
        self.update_if_current(remote_id, operation_id, |entry| entry.set_status(status))
            .is_some()
    }

    /// Release the slot held by `operation_id`, writing `status` first. Returns
    /// `false` (and writes nothing) if the operation no longer owns the slot.
    pub(crate) fn complete(
        &self,
        remote_id: RemoteId,
        operation_id: OperationId,
        status: Option<RemoteStatus>,
    ) -> bool {
        self.complete_with(remote_id, operation_id, |_| status)
    }

    /// Like [`complete`](Self::complete), with the status to write chosen from
    /// the current one under the lock.
    pub(crate) fn complete_with(
        &self,
        remote_id: RemoteId,
        operation_id: OperationId,
        settle: impl FnOnce(&RemoteStatus) -> Option<RemoteStatus>,
    ) -> bool {
        self.update_if_current(remote_id, operation_id, |entry| {
            if let Some(status) = settle(&entry.status) {
                entry.set_status(status);
            }
            entry.active = None;
        })
        .is_some()
    }

    /// Current status, `None` for unknown remotes.
    pub fn status(&self, remote_id: &RemoteId) -> Option<RemoteStatus> {
        self.existing(remote_id).map(|e| lock(&e).status.clone())
    }

    /// Every status, sorted by id.
    pub fn statuses(&self) -> Vec<(RemoteId, RemoteStatus)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|(id, entry)| (id, lock(&entry).status.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Copy of one remote's entry.
    pub fn snapshot(&self, remote_id: &RemoteId) -> Option<EntrySnapshot> {
        self.existing(remote_id).map(|entry| {
            let guard = lock(&entry);
            EntrySnapshot {
                remote_id: *remote_id,
                status: guard.status.clone(),
                active: guard.active.clone(),
                counters: guard.counters.clone(),
            }
        })
    }

    /// Copies of every entry, sorted by id.
    pub fn snapshots(&self) -> Vec<EntrySnapshot> {
        let mut ids: Vec<RemoteId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids.iter().filter_map(|id| self.snapshot(id)).collect()
    }

    /// Copy of the live operation record.
    pub fn active_operation(&self, remote_id: &RemoteId) -> Option<OperationRecord> {
        self.existing(remote_id)
            .and_then(|entry| lock(&entry).active.clone())
    }

    /// Remote has a live operation.
    pub fn is_busy(&self, remote_id: &RemoteId) -> bool {
        self.active_operation(remote_id).is_some()
    }

    /// Remotes with an operation in their slot.
    pub fn active_count(&self) -> usize {
        self.snapshots().iter().filter(|s| s.active.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MountState;
    use uuid::Uuid;

    fn id() -> RemoteId {
        RemoteId::from_uuid(Uuid::new_v4())
    }

    fn record(remote_id: RemoteId, op: u64) -> OperationRecord {
        OperationRecord {
            operation_id: OperationId::new(op),
            remote_id,
            intent: Intent::Refresh,
            trigger: Trigger::Recovery,
            started_at: Instant::now(),
            running_since: None,
            queue_wait: None,
            cancel: CancellationToken::new(),
            cause: Arc::new(OnceLock::new()),
            prior_status: RemoteStatus::disconnected(),
        }
    }

    #[tokio::test]
    async fn stale_operation_cannot_write() {
        let table = RemoteTable::new(16);
        let remote = id();
        table.with_entry(remote, |e| e.active = Some(record(remote, 2)));

        assert!(!table.write_if_current(remote, OperationId::new(1), RemoteStatus::connecting()));
        assert_eq!(table.status(&remote).unwrap().state, MountState::Disconnected);

        assert!(table.write_if_current(remote, OperationId::new(2), RemoteStatus::connecting()));
        assert_eq!(table.status(&remote).unwrap().state, MountState::Connecting);
    }

    #[tokio::test]
    async fn complete_releases_only_matching_slot() {
        let table = RemoteTable::new(16);
        let remote = id();
        table.with_entry(remote, |e| e.active = Some(record(remote, 7)));

        assert!(!table.complete(remote, OperationId::new(6), Some(RemoteStatus::error("late"))));
        assert!(table.is_busy(&remote));

        assert!(table.complete(remote, OperationId::new(7), Some(RemoteStatus::connected("/mnt/x"))));
        assert!(!table.is_busy(&remote));
        assert_eq!(table.status(&remote).unwrap().state, MountState::Connected);
    }

    #[test]
    fn complete_with_sees_current_status() {
        let table = RemoteTable::new(16);
        let remote = id();
        table.with_entry(remote, |e| {
            e.set_status(RemoteStatus::connecting());
            e.active = Some(record(remote, 3));
        });

        let released = table.complete_with(remote, OperationId::new(3), |current| {
            current
                .state
                .is_transitional()
                .then(RemoteStatus::disconnected)
        });

        assert!(released);
        assert_eq!(table.status(&remote).unwrap().state, MountState::Disconnected);
    }

    #[test]
    fn busy_entry_is_not_forgotten() {
        let table = RemoteTable::new(16);
        let remote = id();
        table.with_entry(remote, |e| e.active = Some(record(remote, 1)));

        assert!(!table.forget_if_idle(&remote));
        assert!(table.status(&remote).is_some());

        table.complete(remote, OperationId::new(1), None);
        assert!(table.forget_if_idle(&remote));
        assert!(table.status(&remote).is_none());
    }

    #[tokio::test]
    async fn writes_are_broadcast() {
        let table = RemoteTable::new(16);
        let remote = id();
        let mut updates = table.subscribe();
        table.with_entry(remote, |e| e.set_status(RemoteStatus::error("boom")));
        // A closure that writes nothing publishes nothing.
        table.with_entry(remote, |e| e.counters.strikes += 1);

        let update = updates.recv().await.unwrap();
        assert_eq!(update.remote_id, remote);
        assert_eq!(update.status.state, MountState::Error);
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn cooldown_window() {
        let now = Instant::now();
        let mut counters = ProbeCounters::default();
        counters.strikes = 2;
        counters.on_connected(now, Duration::from_secs(10));
        assert_eq!(counters.strikes, 0);
        assert!(counters.in_cooldown(now + Duration::from_secs(9)));
        assert!(!counters.in_cooldown(now + Duration::from_secs(10)));
    }

    #[test]
    fn first_cancel_cause_wins() {
        let r = record(id(), 1);
        r.cancel_with(CancelCause::Superseded);
        r.cancel_with(CancelCause::UserCancelled);
        assert!(r.cancel.is_cancelled());
        assert_eq!(r.cause.get(), Some(&CancelCause::Superseded));
    }
}
