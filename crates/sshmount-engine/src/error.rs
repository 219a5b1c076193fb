//! Engine error type and failure classification.

use crate::types::{Intent, RemoteId};
use thiserror::Error;

/// Failure of a lifecycle operation or one of its steps.
#[derive(Debug, Error)]
pub enum MountError {
    /// No saved remote has this id.
    #[error("Remote not found: {0}")]
    RemoteNotFound(RemoteId),

    /// Another remote mounts on the same path.
    #[error("Mount point {mount_point} is already used by remote '{other}'")]
    MountPointInUse {
        /// Conflicting path
        mount_point: String,
        /// Name of the remote already using it
        other: String,
    },

    /// Mount point lies inside, or contains, another remote's mount point.
    #[error("Mount point {mount_point} is nested with the mount point of remote '{other}'")]
    NestedMountPoint {
        /// Conflicting path
        mount_point: String,
        /// Name of the other remote
        other: String,
    },

    /// The server refused the credentials.
    #[error("Authentication rejected by {host}: {detail}")]
    AuthenticationRejected {
        /// SSH host
        host: String,
        /// Redacted command output
        detail: String,
    },

    /// sshfs or another helper is not installed.
    #[error("Required dependency not found: {name}")]
    MissingDependency {
        /// Executable name
        name: String,
    },

    /// The credential resolver failed or had no password.
    #[error("Credential lookup failed: {0}")]
    Credentials(String),

    /// The mount command exited unsuccessfully.
    #[error("Mount command failed (exit {exit_code:?}): {detail}")]
    CommandFailed {
        /// Exit status, if the process exited normally
        exit_code: Option<i32>,
        /// Redacted command output
        detail: String,
    },

    /// An external command hit its own timeout.
    #[error("Command timed out after {elapsed_ms}ms: {command}")]
    CommandTimedOut {
        /// Redacted command line
        command: String,
        /// Time until the kill
        elapsed_ms: u64,
    },

    /// Verification never saw the mount.
    #[error("Mount command reported success but {mount_point} is not mounted")]
    MountNotVisible {
        /// Path that was expected to be mounted
        mount_point: String,
    },

    /// Every unmount step failed and the path is still mounted.
    #[error("Unmount of {mount_point} failed: {detail}")]
    UnmountFailed {
        /// Path that is still mounted
        mount_point: String,
        /// Output of the last step
        detail: String,
    },

    /// The supervisor's watchdog fired.
    #[error("{intent} timed out after {elapsed_ms}ms")]
    Timeout {
        /// Intent of the operation
        intent: Intent,
        /// Time since admission
        elapsed_ms: u64,
    },

    /// Cancelled by the user.
    #[error("Operation cancelled")]
    Cancelled,

    /// Replaced by a newer operation on the same remote.
    #[error("Operation superseded by a newer one")]
    Superseded,

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, MountError>;

/// Whether automatic recovery may retry after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Eligible for the next scheduled or event-triggered retry.
    Transient,
    /// The user must act before anything is retried.
    Permanent,
    /// Cancellation or supersession; not a failure at all.
    Benign,
}

const TRANSIENT_SIGNATURES: &[&str] = &[
    "resource busy",
    "connection reset",
    "timed out",
    "timeout",
    "network is unreachable",
    "network is down",
    "no route to host",
    "connection refused",
    "connection closed",
    "broken pipe",
    "temporary failure in name resolution",
];

const AUTH_SIGNATURES: &[&str] = &[
    "permission denied",
    "authentication failed",
    "too many authentication failures",
    "host key verification failed",
];

/// Text of a failing command matches a signature that is worth one retry.
pub fn is_transient_signature(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Text of a failing command says the server refused our credentials.
pub fn is_auth_signature(text: &str) -> bool {
    let lower = text.to_lowercase();
    AUTH_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

impl MountError {
    /// How recovery should treat this failure.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            MountError::AuthenticationRejected { .. }
            | MountError::MountPointInUse { .. }
            | MountError::NestedMountPoint { .. }
            | MountError::MissingDependency { .. }
            | MountError::Credentials(_)
            | MountError::RemoteNotFound(_) => FailureClass::Permanent,
            MountError::Cancelled | MountError::Superseded => FailureClass::Benign,
            _ => FailureClass::Transient,
        }
    }

    /// A failed command whose output looks like a network blip.
    pub fn is_transient_command_failure(&self) -> bool {
        match self {
            MountError::CommandTimedOut { .. } => true,
            MountError::CommandFailed { detail, .. } => is_transient_signature(detail),
            _ => false,
        }
    }
}
