//! Identifiers, remote descriptions and status values shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identity of a configured remote, stable across edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(Uuid);

impl RemoteId {
    /// Wrap an id supplied by the configuration store.
    pub fn from_uuid(uuid: Uuid) -> Self {
        RemoteId(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemoteId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RemoteId)
    }
}

/// Unique id handed out once per admitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    /// Build an id from a raw generation number.
    pub fn new(value: u64) -> Self {
        OperationId(value)
    }

    /// Raw generation number.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// How the SSH session authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMode {
    /// Password resolved through the credential collaborator and fed on stdin.
    Password,
    /// Private key file passed to ssh as `IdentityFile`.
    PrivateKey {
        /// Path to the key.
        identity_file: PathBuf,
    },
}

fn default_port() -> u16 {
    22
}

fn default_remote_path() -> String {
    String::from("/")
}

/// Connection parameters of one configured remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Stable identity.
    pub id: RemoteId,
    /// Display name.
    pub name: String,
    /// SSH host name or address.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Directory on the remote host to expose.
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
    /// Local directory the remote is mounted on.
    pub mount_point: PathBuf,
    /// Authentication method.
    pub auth: AuthMode,
    /// Connect at startup.
    #[serde(default)]
    pub auto_connect: bool,
    /// Additional `-o` options passed through to sshfs.
    #[serde(default)]
    pub extra_options: Vec<String>,
}

/// Lifecycle state of a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    /// Not mounted.
    Disconnected,
    /// Mount command in flight.
    Connecting,
    /// Mounted and verified.
    Connected,
    /// Unmount in flight.
    Disconnecting,
    /// Last operation failed or the mount stopped answering.
    Error,
}

impl MountState {
    /// States in which a mutating external command is in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(self, MountState::Connecting | MountState::Disconnecting)
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountState::Disconnected => "disconnected",
            MountState::Connecting => "connecting",
            MountState::Connected => "connected",
            MountState::Disconnecting => "disconnecting",
            MountState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Authoritative status of one remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    /// Current state.
    pub state: MountState,
    /// Where the remote is mounted, when it is.
    pub mounted_path: Option<PathBuf>,
    /// Human readable failure text, secrets already scrubbed.
    pub last_error: Option<String>,
    /// Wall-clock time of the last write.
    pub updated_at: DateTime<Utc>,
}

impl RemoteStatus {
    fn with(state: MountState, mounted_path: Option<PathBuf>, last_error: Option<String>) -> Self {
        RemoteStatus {
            state,
            mounted_path,
            last_error,
            updated_at: Utc::now(),
        }
    }

    /// Not mounted, no error.
    pub fn disconnected() -> Self {
        Self::with(MountState::Disconnected, None, None)
    }

    /// Mount in progress.
    pub fn connecting() -> Self {
        Self::with(MountState::Connecting, None, None)
    }

    /// Mounted at `path`.
    pub fn connected(path: impl Into<PathBuf>) -> Self {
        Self::with(MountState::Connected, Some(path.into()), None)
    }

    /// Unmount of `path` in progress.
    pub fn disconnecting(path: impl Into<PathBuf>) -> Self {
        Self::with(MountState::Disconnecting, Some(path.into()), None)
    }

    /// Failed with `message`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::with(MountState::Error, None, Some(message.into()))
    }

    /// Last error collapsed to a single line and truncated to `max_chars`.
    pub fn display_error(&self, max_chars: usize) -> Option<String> {
        self.last_error
            .as_deref()
            .map(|text| collapse_error_text(text, max_chars))
    }
}

/// Collapse whitespace runs (including newlines) into single spaces and
/// truncate on a character boundary, appending an ellipsis when cut.
pub fn collapse_error_text(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut out: String = collapsed.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

/// What an operation is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Mount the remote.
    Connect,
    /// Unmount the remote.
    Disconnect,
    /// Re-probe the remote and update its status.
    Refresh,
    /// Mount a draft remote on a throwaway mount point, then tear down.
    TestConnection,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Intent::Connect => "connect",
            Intent::Disconnect => "disconnect",
            Intent::Refresh => "refresh",
            Intent::TestConnection => "test connection",
        };
        f.write_str(s)
    }
}

/// Who asked for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Explicit user action.
    Manual,
    /// Recovery engine timer or system event.
    Recovery,
    /// Application startup.
    Startup,
    /// Application shutdown.
    Termination,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trigger::Manual => "manual",
            Trigger::Recovery => "recovery",
            Trigger::Startup => "startup",
            Trigger::Termination => "termination",
        };
        f.write_str(s)
    }
}
