#![warn(missing_docs)]

//! sshmount engine: per-remote operation supervisor, SSHFS mount lifecycle with
//! anti-flap status probing, and intent-driven recovery.

pub mod cli;
pub mod command;
pub mod config;
pub mod credentials;
pub mod desired;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod probe;
pub mod process;
pub mod recovery;
pub mod service;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod types;

pub use config::SshmountConfig;
pub use error::{MountError, Result};
pub use events::{OperationEvent, OperationEventKind};
pub use lifecycle::TestReport;
pub use recovery::SystemEvent;
pub use service::{Collaborators, MountService, RecoveryHandle};
pub use supervisor::SubmitOutcome;
pub use types::{Intent, MountState, RemoteConfig, RemoteId, RemoteStatus, Trigger};
