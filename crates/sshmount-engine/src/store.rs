//! Read-mostly view of the configured remotes.

use std::sync::{PoisonError, RwLock};

use crate::types::{RemoteConfig, RemoteId};

/// Source of saved remote configurations.
pub trait RemoteStore: Send + Sync {
    /// Every saved remote, in display order.
    fn remotes(&self) -> Vec<RemoteConfig>;

    /// Saved remote with this id.
    fn remote(&self, id: &RemoteId) -> Option<RemoteConfig> {
        self.remotes().into_iter().find(|r| &r.id == id)
    }
}

/// Store holding remotes in memory, seeded from the loaded config file.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    remotes: RwLock<Vec<RemoteConfig>>,
}

impl MemoryRemoteStore {
    /// Store seeded with `remotes`.
    pub fn new(remotes: Vec<RemoteConfig>) -> Self {
        Self {
            remotes: RwLock::new(remotes),
        }
    }

    /// Insert or replace by id, keeping list order.
    pub fn upsert(&self, remote: RemoteConfig) {
        let mut remotes = self.remotes.write().unwrap_or_else(PoisonError::into_inner);
        match remotes.iter_mut().find(|r| r.id == remote.id) {
            Some(existing) => *existing = remote,
            None => remotes.push(remote),
        }
    }

    /// Remove by id, returning the removed remote.
    pub fn remove(&self, id: &RemoteId) -> Option<RemoteConfig> {
        let mut remotes = self.remotes.write().unwrap_or_else(PoisonError::into_inner);
        let index = remotes.iter().position(|r| &r.id == id)?;
        Some(remotes.remove(index))
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn remotes(&self) -> Vec<RemoteConfig> {
        self.remotes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Saved remote with this id.
    fn remote(&self, id: &RemoteId) -> Option<RemoteConfig> {
        self.remotes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| &r.id == id)
            .cloned()
    }
}
