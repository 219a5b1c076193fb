//! Daemon configuration, loaded from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::{Intent, RemoteConfig};

/// Failure to load or validate the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),
    /// TOML syntax or schema error.
    #[error("Invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    /// JSON syntax or schema error.
    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    /// Neither `.toml` nor `.json`.
    #[error("Unsupported config file extension: {0}")]
    UnsupportedExtension(String),
    /// Parsed but failed validation.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Admission, limiter and watchdog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Global limiter capacity shared by all remotes.
    pub max_concurrent_operations: usize,
    /// Busy operations older than this may be replaced by recovery/startup.
    pub stale_operation_secs: u64,
    /// Watchdog budget for connects.
    pub connect_timeout_secs: u64,
    /// Watchdog budget for disconnects.
    pub disconnect_timeout_secs: u64,
    /// Watchdog budget for refreshes.
    pub refresh_timeout_secs: u64,
    /// Watchdog budget for connection tests.
    pub test_connection_timeout_secs: u64,
    /// Buffer size of the event and status broadcast channels.
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 4,
            stale_operation_secs: 20,
            connect_timeout_secs: 45,
            disconnect_timeout_secs: 10,
            refresh_timeout_secs: 18,
            test_connection_timeout_secs: 45,
            event_capacity: 256,
        }
    }
}

impl SupervisorConfig {
    /// Watchdog budget for an intent.
    pub fn watchdog(&self, intent: Intent) -> Duration {
        let secs = match intent {
            Intent::Connect => self.connect_timeout_secs,
            Intent::Disconnect => self.disconnect_timeout_secs,
            Intent::Refresh => self.refresh_timeout_secs,
            Intent::TestConnection => self.test_connection_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    /// Age after which a busy operation counts as stale.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_operation_secs)
    }
}

/// Connect/disconnect/refresh tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Timeout of a single sshfs invocation.
    pub mount_command_timeout_secs: u64,
    /// Pause before the one retry after a transient mount failure.
    pub transient_retry_delay_ms: u64,
    /// Limit on a password lookup.
    pub credential_timeout_secs: u64,
    /// Polls of the second-source mount check after a successful mount command.
    pub verify_attempts: u32,
    /// Pause between verification polls.
    pub verify_interval_ms: u64,
    /// Timeout of each unmount command in the escalation.
    pub unmount_step_timeout_secs: u64,
    /// Bound on the whole unmount escalation.
    pub unmount_outer_timeout_secs: u64,
    /// Timeout of each individual probe.
    pub probe_timeout_ms: u64,
    /// Minimum time a remote is shown as connecting.
    pub min_connect_transition_ms: u64,
    /// Minimum time a remote is shown as disconnecting.
    pub min_disconnect_transition_ms: u64,
    /// Consecutive misses before a connected remote is escalated to error.
    pub strike_threshold: u32,
    /// Warm-up window after a connect during which misses are not counted.
    pub reconnect_cooldown_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            mount_command_timeout_secs: 30,
            transient_retry_delay_ms: 1000,
            credential_timeout_secs: 10,
            verify_attempts: 5,
            verify_interval_ms: 400,
            unmount_step_timeout_secs: 3,
            unmount_outer_timeout_secs: 6,
            probe_timeout_ms: 2500,
            min_connect_transition_ms: 800,
            min_disconnect_transition_ms: 700,
            strike_threshold: 3,
            reconnect_cooldown_secs: 10,
        }
    }
}

impl LifecycleConfig {
    /// `mount_command_timeout_secs` as a duration.
    pub fn mount_command_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_command_timeout_secs)
    }

    /// `transient_retry_delay_ms` as a duration.
    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transient_retry_delay_ms)
    }

    /// `credential_timeout_secs` as a duration.
    pub fn credential_timeout(&self) -> Duration {
        Duration::from_secs(self.credential_timeout_secs)
    }

    /// `verify_interval_ms` as a duration.
    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    /// `unmount_step_timeout_secs` as a duration.
    pub fn unmount_step_timeout(&self) -> Duration {
        Duration::from_secs(self.unmount_step_timeout_secs)
    }

    /// `unmount_outer_timeout_secs` as a duration.
    pub fn unmount_outer_timeout(&self) -> Duration {
        Duration::from_secs(self.unmount_outer_timeout_secs)
    }

    /// `probe_timeout_ms` as a duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// `min_connect_transition_ms` as a duration.
    pub fn min_connect_transition(&self) -> Duration {
        Duration::from_millis(self.min_connect_transition_ms)
    }

    /// `min_disconnect_transition_ms` as a duration.
    pub fn min_disconnect_transition(&self) -> Duration {
        Duration::from_millis(self.min_disconnect_transition_ms)
    }

    /// `reconnect_cooldown_secs` as a duration.
    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_secs(self.reconnect_cooldown_secs)
    }
}

/// Recovery timer and burst schedules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Interval of the periodic recovery pass.
    pub periodic_interval_secs: u64,
    /// Idle passes are skipped while the last deep pass is younger than this.
    pub deep_probe_window_secs: u64,
    /// Offsets from the wake notification.
    pub wake_burst_ms: Vec<u64>,
    /// Offsets from the network-restored notification.
    pub network_burst_ms: Vec<u64>,
    /// Treat the startup auto-connect selection as desired connections.
    pub auto_connect_on_startup: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            periodic_interval_secs: 15,
            deep_probe_window_secs: 60,
            wake_burst_ms: vec![0, 1000, 3000, 8000],
            network_burst_ms: vec![0, 2000, 6000],
            auto_connect_on_startup: true,
        }
    }
}

fn schedule(offsets: &[u64]) -> Vec<Duration> {
    offsets.iter().copied().map(Duration::from_millis).collect()
}

impl RecoveryConfig {
    /// `periodic_interval_secs` as a duration.
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    /// `deep_probe_window_secs` as a duration.
    pub fn deep_probe_window(&self) -> Duration {
        Duration::from_secs(self.deep_probe_window_secs)
    }

    /// Wake burst offsets.
    pub fn wake_schedule(&self) -> Vec<Duration> {
        schedule(&self.wake_burst_ms)
    }

    /// Network burst offsets.
    pub fn network_schedule(&self) -> Vec<Duration> {
        schedule(&self.network_burst_ms)
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshmountConfig {
    /// Admission and watchdog settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Mount lifecycle tuning.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Recovery schedules.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Overrides the PATH lookup for sshfs.
    #[serde(default)]
    pub sshfs_path: Option<PathBuf>,
    /// Configured remotes.
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
}

impl SshmountConfig {
    /// Parse and validate a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SshmountConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => return Err(ConfigError::UnsupportedExtension(ext.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.max_concurrent_operations == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.max_concurrent_operations must be at least 1".into(),
            ));
        }
        if self.lifecycle.strike_threshold == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.strike_threshold must be at least 1".into(),
            ));
        }
        if self.recovery.periodic_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "recovery.periodic_interval_secs must be at least 1".into(),
            ));
        }
        for (name, offsets) in [
            ("wake_burst_ms", &self.recovery.wake_burst_ms),
            ("network_burst_ms", &self.recovery.network_burst_ms),
        ] {
            if offsets.windows(2).any(|w| w[0] > w[1]) {
                return Err(ConfigError::Invalid(format!(
                    "recovery.{name} offsets must be ascending"
                )));
            }
        }

        let mut ids = HashSet::new();
        for remote in &self.remotes {
            if !ids.insert(remote.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate remote id {}",
                    remote.id
                )));
            }
            if !remote.mount_point.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "remote '{}' mount point {} is not absolute",
                    remote.name,
                    remote.mount_point.display()
                )));
            }
        }
        Ok(())
    }

    /// First remote with this display name.
    pub fn remote_by_name(&self, name: &str) -> Option<&RemoteConfig> {
        self.remotes.iter().find(|r| r.name == name)
    }
}
