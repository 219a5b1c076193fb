//! Point-in-time view of the engine for status pages and `sshmountd` output.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::desired::DesiredConnections;
use crate::state::{EntrySnapshot, RemoteTable};
use crate::store::RemoteStore;
use crate::supervisor::Supervisor;
use crate::types::{Intent, OperationId, RemoteId, RemoteStatus, Trigger};

/// The live operation of one remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveOperation {
    /// Id of the admission.
    pub operation_id: OperationId,
    /// What it does.
    pub intent: Intent,
    /// Who asked for it.
    pub trigger: Trigger,
    /// Time since admission, queue wait included.
    pub age_ms: u64,
    /// `None` while still waiting for a limiter permit.
    pub queue_wait_ms: Option<u64>,
}

/// Diagnostics of one remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteDiagnostics {
    /// Remote id.
    pub remote_id: RemoteId,
    /// `None` for drafts that are not in the store.
    pub name: Option<String>,
    /// Current status.
    pub status: RemoteStatus,
    /// Recovery keeps this remote connected.
    pub desired: bool,
    /// Consecutive probe misses.
    pub strikes: u32,
    /// Inside the post-connect warm-up window.
    pub in_cooldown: bool,
    /// Live operation, if any.
    pub active: Option<ActiveOperation>,
}

/// Engine-wide diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Wall-clock time of collection.
    pub generated_at: DateTime<Utc>,
    /// Total limiter permits.
    pub limiter_capacity: usize,
    /// Permits not currently held.
    pub limiter_available: usize,
    /// Number of desired remotes.
    pub desired_count: usize,
    /// Per-remote details, sorted by id.
    pub remotes: Vec<RemoteDiagnostics>,
}

impl DiagnosticsSnapshot {
    /// Read the current state of every component.
    pub fn collect(
        supervisor: &Supervisor,
        table: &RemoteTable,
        desired: &DesiredConnections,
        store: &dyn RemoteStore,
    ) -> Self {
        let now = tokio::time::Instant::now();
        let remotes = table
            .snapshots()
            .into_iter()
            .map(|snapshot: EntrySnapshot| RemoteDiagnostics {
                remote_id: snapshot.remote_id,
                name: store.remote(&snapshot.remote_id).map(|r| r.name),
                desired: desired.contains(&snapshot.remote_id),
                strikes: snapshot.counters.strikes,
                in_cooldown: snapshot.counters.in_cooldown(now),
                active: snapshot.active.map(|record| ActiveOperation {
                    operation_id: record.operation_id,
                    intent: record.intent,
                    trigger: record.trigger,
                    age_ms: now.saturating_duration_since(record.started_at).as_millis() as u64,
                    queue_wait_ms: record.queue_wait.map(|d| d.as_millis() as u64),
                }),
                status: snapshot.status,
            })
            .collect();

        DiagnosticsSnapshot {
            generated_at: Utc::now(),
            limiter_capacity: supervisor.capacity(),
            limiter_available: supervisor.limiter_available(),
            desired_count: desired.len(),
            remotes,
        }
    }

    /// Remotes with an operation in their slot.
    pub fn busy_count(&self) -> usize {
        self.remotes.iter().filter(|r| r.active.is_some()).count()
    }

    /// Details of one remote.
    pub fn remote(&self, remote_id: &RemoteId) -> Option<&RemoteDiagnostics> {
        self.remotes.iter().find(|r| &r.remote_id == remote_id)
    }

    /// Pretty-printed JSON for `sshmountd status`.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
