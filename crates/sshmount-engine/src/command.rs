//! Construction of the external commands the engine runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::Secret;
use crate::error::{MountError, Result};
use crate::process::ProcessSpec;
use crate::types::{AuthMode, RemoteConfig};

/// An executable plus argument vector, with a display form safe for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Executable name or path.
    pub program: String,
    /// Arguments, passed as-is.
    pub args: Vec<String>,
    /// Rendering with sensitive option values masked.
    pub display: String,
}

const SENSITIVE_OPTION_KEYS: &[&str] = &["password", "passphrase", "pass"];

fn redact_arg(arg: &str) -> String {
    let mut parts = Vec::new();
    for option in arg.split(',') {
        match option.split_once('=') {
            Some((key, _)) if SENSITIVE_OPTION_KEYS.contains(&key.to_lowercase().as_str()) => {
                parts.push(format!("{}=***", key))
            }
            _ => parts.push(option.to_string()),
        }
    }
    parts.join(",")
}

impl CommandLine {
    /// Build a command line and its redacted display form.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        let mut display = program.clone();
        for arg in &args {
            display.push(' ');
            display.push_str(&redact_arg(arg));
        }
        CommandLine {
            program,
            args,
            display,
        }
    }

    /// Process invocation for this command.
    pub fn to_spec(&self, timeout: Duration, stdin: Option<Secret>) -> ProcessSpec {
        ProcessSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            env: Vec::new(),
            stdin,
            timeout,
            display: self.display.clone(),
        }
    }
}

/// Produces mount, unmount, force-stop and mount-table commands.
pub trait CommandBuilder: Send + Sync {
    /// Command mounting `remote` on `mount_point`. `password_on_stdin` is set when
    /// a resolved password will be written to the process's stdin.
    fn mount_command(
        &self,
        remote: &RemoteConfig,
        mount_point: &Path,
        password_on_stdin: bool,
    ) -> Result<CommandLine>;

    /// Unmount commands in escalation order, graceful first.
    fn unmount_commands(&self, mount_point: &Path) -> Vec<CommandLine>;

    /// Kills helper processes serving `mount_point`.
    fn force_stop_command(&self, mount_point: &Path) -> CommandLine;

    /// Lists the system mount table in `mount(8)` format.
    fn mount_table_command(&self) -> CommandLine;
}

/// Host flavour; selects unmount and mount-table tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// macOS with macFUSE.
    MacOs,
    /// Linux with FUSE.
    Linux,
}

impl Platform {
    /// Platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

const EXTRA_SEARCH_DIRS: &[&str] = &["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin", "/bin"];

/// Search `PATH` and the usual package-manager prefixes for an executable.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .chain(EXTRA_SEARCH_DIRS.iter().map(PathBuf::from))
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Builder for sshfs on macOS (macFUSE) and Linux (libfuse).
#[derive(Debug, Clone)]
pub struct SshfsCommandBuilder {
    sshfs_path: Option<PathBuf>,
    platform: Platform,
}

impl SshfsCommandBuilder {
    /// `sshfs_path` overrides the PATH lookup.
    pub fn new(sshfs_path: Option<PathBuf>, platform: Platform) -> Self {
        Self {
            sshfs_path,
            platform,
        }
    }

    fn sshfs(&self) -> Result<PathBuf> {
        match &self.sshfs_path {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(MountError::MissingDependency {
                name: path.display().to_string(),
            }),
            None => find_executable("sshfs").ok_or_else(|| MountError::MissingDependency {
                name: "sshfs".to_string(),
            }),
        }
    }
}

impl Default for SshfsCommandBuilder {
    fn default() -> Self {
        Self::new(None, Platform::current())
    }
}

impl CommandBuilder for SshfsCommandBuilder {
    fn mount_command(
        &self,
        remote: &RemoteConfig,
        mount_point: &Path,
        password_on_stdin: bool,
    ) -> Result<CommandLine> {
        let sshfs = self.sshfs()?;
        let mut options = vec![
            "reconnect".to_string(),
            "ServerAliveInterval=15".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        match &remote.auth {
            AuthMode::Password if password_on_stdin => options.push("password_stdin".to_string()),
            AuthMode::Password => {}
            AuthMode::PrivateKey { identity_file } => {
                options.push(format!("IdentityFile={}", identity_file.display()));
                options.push("BatchMode=yes".to_string());
            }
        }
        if self.platform == Platform::MacOs {
            options.push(format!("volname={}", remote.name));
        }
        options.extend(remote.extra_options.iter().cloned());

        let args = vec![
            format!("{}@{}:{}", remote.username, remote.host, remote.remote_path),
            mount_point.display().to_string(),
            "-p".to_string(),
            remote.port.to_string(),
            "-o".to_string(),
            options.join(","),
        ];
        Ok(CommandLine::new(sshfs.display().to_string(), args))
    }

    fn unmount_commands(&self, mount_point: &Path) -> Vec<CommandLine> {
        let target = mount_point.display().to_string();
        match self.platform {
            Platform::MacOs => vec![
                CommandLine::new("/sbin/umount", vec![target.clone()]),
                CommandLine::new("/sbin/umount", vec!["-f".to_string(), target.clone()]),
                CommandLine::new(
                    "/usr/sbin/diskutil",
                    vec!["unmount".to_string(), "force".to_string(), target],
                ),
            ],
            Platform::Linux => vec![
                CommandLine::new("fusermount", vec!["-u".to_string(), target.clone()]),
                CommandLine::new("umount", vec![target.clone()]),
                CommandLine::new("fusermount", vec!["-uz".to_string(), target]),
            ],
        }
    }

    fn force_stop_command(&self, mount_point: &Path) -> CommandLine {
        CommandLine::new(
            "pkill",
            vec![
                "-f".to_string(),
                format!("sshfs.* {}", mount_point.display()),
            ],
        )
    }

    fn mount_table_command(&self) -> CommandLine {
        match self.platform {
            Platform::MacOs => CommandLine::new("/sbin/mount", Vec::new()),
            Platform::Linux => CommandLine::new("mount", Vec::new()),
        }
    }
}
