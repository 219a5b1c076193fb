//! Declared user intent: the remotes the user wants connected.
//!
//! Call sites that change membership:
//! - insert: successful connect, startup auto-connect selection
//! - remove: manual disconnect, permanent failure, remote deletion

use dashmap::DashSet;

use crate::error::{FailureClass, MountError};
use crate::types::RemoteId;

/// Set of remotes recovery keeps connected.
#[derive(Debug, Default)]
pub struct DesiredConnections {
    set: DashSet<RemoteId>,
}

impl DesiredConnections {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a remote; true if it was not already desired.
    pub fn insert(&self, remote_id: RemoteId, reason: &str) -> bool {
        let added = self.set.insert(remote_id);
        if added {
            tracing::info!(remote_id = %remote_id, reason, "remote added to desired connections");
        }
        added
    }

    /// Drop a remote; true if it was desired.
    pub fn remove(&self, remote_id: &RemoteId, reason: &str) -> bool {
        let removed = self.set.remove(remote_id).is_some();
        if removed {
            tracing::info!(remote_id = %remote_id, reason, "remote removed from desired connections");
        }
        removed
    }

    /// Whether the remote is desired.
    pub fn contains(&self, remote_id: &RemoteId) -> bool {
        self.set.contains(remote_id)
    }

    /// Sorted copy of the set.
    pub fn snapshot(&self) -> Vec<RemoteId> {
        let mut ids: Vec<RemoteId> = self.set.iter().map(|id| *id).collect();
        ids.sort();
        ids
    }

    /// Number of desired remotes.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// No remote is desired.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Classify a failed operation; permanent failures drop the remote so that
    /// nothing retries it until the user connects it again.
    pub fn record_failure(&self, remote_id: &RemoteId, error: &MountError) -> FailureClass {
        let class = error.failure_class();
        if class == FailureClass::Permanent {
            if self.remove(remote_id, "permanent failure") {
                tracing::warn!(
                    remote_id = %remote_id,
                    error = %error,
                    "automatic retries suppressed until the user reconnects"
                );
            }
        }
        class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id() -> RemoteId {
        RemoteId::from_uuid(Uuid::new_v4())
    }

    #[test]
    fn insert_and_remove_report_changes() {
        let desired = DesiredConnections::new();
        let a = id();
        assert!(desired.insert(a, "test"));
        assert!(!desired.insert(a, "test"));
        assert!(desired.contains(&a));
        assert!(desired.remove(&a, "test"));
        assert!(!desired.remove(&a, "test"));
        assert!(desired.is_empty());
    }

    #[test]
    fn permanent_failure_removes_remote() {
        let desired = DesiredConnections::new();
        let a = id();
        desired.insert(a, "test");
        let class = desired.record_failure(
            &a,
            &MountError::AuthenticationRejected {
                host: "h".into(),
                detail: "Permission denied".into(),
            },
        );
        assert_eq!(class, FailureClass::Permanent);
        assert!(!desired.contains(&a));
    }

    #[test]
    fn transient_failure_keeps_remote() {
        let desired = DesiredConnections::new();
        let a = id();
        desired.insert(a, "test");
        let class = desired.record_failure(
            &a,
            &MountError::CommandFailed {
                exit_code: Some(1),
                detail: "Connection reset by peer".into(),
            },
        );
        assert_eq!(class, FailureClass::Transient);
        assert!(desired.contains(&a));
    }

    #[test]
    fn snapshot_is_sorted() {
        let desired = DesiredConnections::new();
        for _ in 0..5 {
            desired.insert(id(), "test");
        }
        let snapshot = desired.snapshot();
        let mut sorted = snapshot.clone();
        sorted.sort();
        assert_eq!(snapshot, sorted);
        assert_eq!(desired.len(), 5);
    }
}
