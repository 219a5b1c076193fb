//! Credential resolution seam.
//!
//! The engine asks for a password only while connecting a password-authenticated
//! remote. Secrets are zeroized on drop and never rendered by `Debug`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::RemoteId;

/// A password held only as long as a mount attempt needs it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    /// Wrap a password.
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    /// The plain text. Keep it out of logs.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Replace every occurrence of the secret in `text`.
    pub fn redact(&self, text: &str) -> String {
        if self.0.is_empty() {
            return text.to_string();
        }
        text.replace(self.0.as_str(), "***")
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Looks up stored passwords.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// `Ok(None)` when nothing is stored for the remote.
    async fn resolve_password(&self, remote_id: &RemoteId) -> Result<Option<Secret>, String>;
}

/// Resolver backed by `SSHMOUNT_PASSWORD_<ID>` environment variables, where
/// `<ID>` is the remote id upper-cased with dashes replaced by underscores.
#[derive(Debug, Default)]
pub struct EnvCredentialResolver;

impl EnvCredentialResolver {
    /// Environment variable consulted for `remote_id`.
    pub fn variable_name(remote_id: &RemoteId) -> String {
        format!(
            "SSHMOUNT_PASSWORD_{}",
            remote_id.to_string().to_uppercase().replace('-', "_")
        )
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve_password(&self, remote_id: &RemoteId) -> Result<Option<Secret>, String> {
        match std::env::var(Self::variable_name(remote_id)) {
            Ok(value) => Ok(Some(Secret::new(value))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// In-memory resolver.
#[derive(Default)]
pub struct MemoryCredentialResolver {
    passwords: DashMap<RemoteId, Secret>,
}

impl MemoryCredentialResolver {
    /// Empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace the password of a remote.
    pub fn store(&self, remote_id: RemoteId, secret: Secret) {
        self.passwords.insert(remote_id, secret);
    }

    /// Drop the stored password of a remote.
    pub fn forget(&self, remote_id: &RemoteId) {
        self.passwords.remove(remote_id);
    }
}

#[async_trait]
impl CredentialResolver for MemoryCredentialResolver {
    async fn resolve_password(&self, remote_id: &RemoteId) -> Result<Option<Secret>, String> {
        Ok(self.passwords.get(remote_id).map(|s| s.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn debug_never_shows_secret() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
    }

    #[test]
    fn redact_replaces_all_occurrences() {
        let secret = Secret::new("hunter2");
        assert_eq!(
            secret.redact("sent hunter2 twice: hunter2"),
            "sent *** twice: ***"
        );
        assert_eq!(Secret::new("").redact("unchanged"), "unchanged");
    }

    #[test]
    fn env_variable_name_is_shell_safe() {
        let id: RemoteId = "6f1f3c0e-8d6a-4c7e-9a59-0b7f0c8b2d11".parse().unwrap();
        assert_eq!(
            EnvCredentialResolver::variable_name(&id),
            "SSHMOUNT_PASSWORD_6F1F3C0E_8D6A_4C7E_9A59_0B7F0C8B2D11"
        );
    }

    #[tokio::test]
    async fn memory_resolver_store_and_forget() {
        let resolver = MemoryCredentialResolver::new();
        let id = RemoteId::from_uuid(Uuid::new_v4());
        assert!(resolver.resolve_password(&id).await.unwrap().is_none());

        resolver.store(id, Secret::new("pw"));
        let found = resolver.resolve_password(&id).await.unwrap().unwrap();
        assert_eq!(found.expose(), "pw");

        resolver.forget(&id);
        assert!(resolver.resolve_password(&id).await.unwrap().is_none());
    }
}
