//! Mount probes and transition primitives.
//!
//! Each primitive performs exactly one diagnostic or mutating step and bounds it
//! with its own timeout. None of them touch remote status; interpreting the
//! evidence is the lifecycle engine's job.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandBuilder, CommandLine};
use crate::credentials::Secret;
use crate::process::{ProcessOutput, ProcessRunner};

/// Result of a metadata stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathInfo {
    /// Device id of the filesystem holding the path.
    pub device: u64,
    /// Path is a directory.
    pub is_dir: bool,
}

/// Result of a capacity (statvfs) probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Filesystem id as reported by statvfs.
    pub filesystem_id: u64,
    /// Size of the filesystem.
    pub total_bytes: u64,
    /// Space available to unprivileged users.
    pub available_bytes: u64,
}

/// Local filesystem operations used by the probes.
#[async_trait]
pub trait FsProbe: Send + Sync {
    async fn stat(&self, path: &Path) -> io::Result<PathInfo>;
    async fn capacity(&self, path: &Path) -> io::Result<Capacity>;
    /// Opens the directory and reads a handful of entries.
    async fn read_dir(&self, path: &Path) -> io::Result<usize>;
    async fn prepare_mount_point(&self, path: &Path) -> io::Result<()>;
    /// Removes an empty mount-point directory; missing is not an error.
    async fn remove_mount_point(&self, path: &Path) -> io::Result<()>;
}

/// [`FsProbe`] over the real filesystem.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFsProbe;

#[cfg(unix)]
fn statvfs(path: &Path) -> io::Result<Capacity> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;
    // SAFETY: statvfs only writes into the zeroed struct we own, and c_path is a
    // valid NUL-terminated string for the duration of the call.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let frsize = stat.f_frsize as u64;
    Ok(Capacity {
        filesystem_id: stat.f_fsid as u64,
        total_bytes: (stat.f_blocks as u64).saturating_mul(frsize),
        available_bytes: (stat.f_bavail as u64).saturating_mul(frsize),
    })
}

#[cfg(unix)]
#[async_trait]
impl FsProbe for SystemFsProbe {
    async fn stat(&self, path: &Path) -> io::Result<PathInfo> {
        use std::os::unix::fs::MetadataExt;
        let meta = tokio::fs::metadata(path).await?;
        Ok(PathInfo {
            device: meta.dev(),
            is_dir: meta.is_dir(),
        })
    }

    async fn capacity(&self, path: &Path) -> io::Result<Capacity> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || statvfs(&path))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    async fn read_dir(&self, path: &Path) -> io::Result<usize> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut seen = 0;
        while seen < 8 {
            match entries.next_entry().await? {
                Some(_) => seen += 1,
                None => break,
            }
        }
        Ok(seen)
    }

    async fn prepare_mount_point(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_mount_point(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_dir(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    // macOS reports /tmp and /var mounts under /private.
    match trimmed.strip_prefix("/private") {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => trimmed.to_string(),
    }
}

fn mounted_on(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once(" on ")?;
    let end = [rest.find(" ("), rest.find(" type ")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Whether a `mount(8)` listing has an entry mounted on `mount_point`.
/// Handles both the BSD (`src on /path (type, opts)`) and Linux
/// (`src on /path type t (opts)`) layouts.
pub fn mount_table_contains(listing: &str, mount_point: &Path) -> bool {
    let wanted = normalize(&mount_point.to_string_lossy());
    listing
        .lines()
        .filter_map(mounted_on)
        .any(|path| normalize(path) == wanted)
}

/// What the system mount table says about a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvidence {
    /// Listed.
    Present,
    /// Not listed.
    Absent,
    /// Listing failed or timed out.
    Unknown(String),
}

/// What a stat or capacity probe says about a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathEvidence {
    /// Path sits on a different filesystem than its parent.
    MountPoint,
    /// Same filesystem as its parent.
    PlainDirectory,
    /// The mount-point directory does not exist.
    Missing,
    /// Probe failed or timed out.
    Unresponsive(String),
    /// Probe skipped.
    NotChecked,
}

/// Outcome of listing the mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvidence {
    /// Listing succeeded.
    Readable,
    /// Listing failed or timed out.
    Failed(String),
    /// Probe skipped.
    NotChecked,
}

/// Everything one probing pass learned about a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    /// Mount table listing.
    pub table: TableEvidence,
    /// Device id comparison with the parent directory.
    pub stat: PathEvidence,
    /// Filesystem id comparison with the parent directory.
    pub capacity: PathEvidence,
    /// Directory listing.
    pub directory: DirectoryEvidence,
}

impl Evidence {
    /// Positive evidence that something is mounted on the path.
    pub fn mounted(&self) -> bool {
        self.table == TableEvidence::Present
            || self.stat == PathEvidence::MountPoint
            || self.capacity == PathEvidence::MountPoint
    }

    /// Mounted and answering directory queries.
    pub fn healthy(&self) -> bool {
        self.mounted() && self.directory == DirectoryEvidence::Readable
    }

    /// Positive evidence of unmount: the mount point itself is gone.
    pub fn mount_point_missing(&self) -> bool {
        !self.mounted() && self.stat == PathEvidence::Missing
    }

    /// Reason the directory listing failed, if it did.
    pub fn directory_failure(&self) -> Option<&str> {
        match &self.directory {
            DirectoryEvidence::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Probe and transition primitives bound to the process and filesystem
/// collaborators.
#[derive(Clone)]
pub struct MountProbe {
    runner: Arc<dyn ProcessRunner>,
    fs: Arc<dyn FsProbe>,
    builder: Arc<dyn CommandBuilder>,
    probe_timeout: Duration,
}

impl MountProbe {
    /// Bind the primitives to their collaborators.
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        fs: Arc<dyn FsProbe>,
        builder: Arc<dyn CommandBuilder>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            fs,
            builder,
            probe_timeout,
        }
    }

    /// Command builder in use.
    pub fn builder(&self) -> &dyn CommandBuilder {
        self.builder.as_ref()
    }

    /// Filesystem probe in use.
    pub fn fs(&self) -> &dyn FsProbe {
        self.fs.as_ref()
    }

    /// Run one external command.
    pub async fn run(
        &self,
        command: &CommandLine,
        timeout: Duration,
        stdin: Option<Secret>,
        cancel: &CancellationToken,
    ) -> io::Result<ProcessOutput> {
        self.runner
            .run(command.to_spec(timeout, stdin), cancel.clone())
            .await
    }

    /// Look the mount point up in the system mount table.
    pub async fn mount_table(&self, mount_point: &Path, cancel: &CancellationToken) -> TableEvidence {
        let command = self.builder.mount_table_command();
        match self.run(&command, self.probe_timeout, None, cancel).await {
            Ok(out) if out.success() => {
                if mount_table_contains(&out.stdout, mount_point) {
                    TableEvidence::Present
                } else {
                    TableEvidence::Absent
                }
            }
            Ok(out) if out.timed_out => {
                TableEvidence::Unknown("mount table listing timed out".to_string())
            }
            Ok(out) if out.cancelled => TableEvidence::Unknown("cancelled".to_string()),
            Ok(out) => TableEvidence::Unknown(format!(
                "{} exited with {:?}: {}",
                command.display,
                out.exit_code,
                out.diagnostic_text()
            )),
            Err(e) => TableEvidence::Unknown(e.to_string()),
        }
    }

    async fn timed<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = io::Result<T>>,
    ) -> io::Result<T> {
        match tokio::time::timeout(self.probe_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{what} timed out after {}ms", self.probe_timeout.as_millis()),
            )),
        }
    }

    /// Metadata stat of the mount point compared with its parent.
    pub async fn stat_evidence(&self, mount_point: &Path) -> PathEvidence {
        let info = match self.timed("metadata stat", self.fs.stat(mount_point)).await {
            Ok(info) => info,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return PathEvidence::Missing,
            Err(e) => return PathEvidence::Unresponsive(e.to_string()),
        };
        let Some(parent) = mount_point.parent() else {
            return PathEvidence::PlainDirectory;
        };
        match self.timed("parent stat", self.fs.stat(parent)).await {
            Ok(parent_info) if parent_info.device != info.device => PathEvidence::MountPoint,
            Ok(_) => PathEvidence::PlainDirectory,
            Err(e) => PathEvidence::Unresponsive(e.to_string()),
        }
    }

    /// Capacity probe of the mount point compared with its parent.
    pub async fn capacity_evidence(&self, mount_point: &Path) -> PathEvidence {
        let capacity = match self.timed("capacity probe", self.fs.capacity(mount_point)).await {
            Ok(capacity) => capacity,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return PathEvidence::Missing,
            Err(e) => return PathEvidence::Unresponsive(e.to_string()),
        };
        let Some(parent) = mount_point.parent() else {
            return PathEvidence::PlainDirectory;
        };
        match self.timed("parent capacity probe", self.fs.capacity(parent)).await {
            Ok(p) if (p.filesystem_id, p.total_bytes) != (capacity.filesystem_id, capacity.total_bytes) => {
                PathEvidence::MountPoint
            }
            Ok(_) => PathEvidence::PlainDirectory,
            Err(e) => PathEvidence::Unresponsive(e.to_string()),
        }
    }

    /// Real directory query; distinguishes a stale FUSE handle from a live mount.
    pub async fn directory_evidence(&self, mount_point: &Path) -> DirectoryEvidence {
        match self.timed("directory listing", self.fs.read_dir(mount_point)).await {
            Ok(_) => DirectoryEvidence::Readable,
            Err(e) => DirectoryEvidence::Failed(e.to_string()),
        }
    }

    /// Full probing pass used by refresh.
    pub async fn gather(&self, mount_point: &Path, cancel: &CancellationToken) -> Evidence {
        let table = self.mount_table(mount_point, cancel).await;
        let (stat, capacity) = if table == TableEvidence::Present {
            (PathEvidence::NotChecked, PathEvidence::NotChecked)
        } else {
            tokio::join!(
                self.stat_evidence(mount_point),
                self.capacity_evidence(mount_point)
            )
        };
        let mut evidence = Evidence {
            table,
            stat,
            capacity,
            directory: DirectoryEvidence::NotChecked,
        };
        if evidence.mounted() {
            evidence.directory = self.directory_evidence(mount_point).await;
        }
        evidence
    }

    /// Cheap mounted check: mount table first, metadata stat as second source.
    pub async fn is_mounted(&self, mount_point: &Path, cancel: &CancellationToken) -> bool {
        match self.mount_table(mount_point, cancel).await {
            TableEvidence::Present => true,
            TableEvidence::Absent | TableEvidence::Unknown(_) => {
                self.stat_evidence(mount_point).await == PathEvidence::MountPoint
            }
        }
    }

    /// Kill helper processes serving `mount_point`. Best effort.
    pub async fn force_stop(&self, mount_point: &Path) {
        let command = self.builder.force_stop_command(mount_point);
        match self
            .run(&command, self.probe_timeout, None, &CancellationToken::new())
            .await
        {
            Ok(out) => tracing::info!(
                command = %command.display,
                exit_code = ?out.exit_code,
                "force-stopped helper processes"
            ),
            Err(e) => tracing::warn!(command = %command.display, error = %e, "force stop failed"),
        }
    }
}

/// Throwaway mount point used by connection tests.
pub fn scratch_mount_point(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("sshmount-test-{tag}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MACOS_LISTING: &str = "\
/dev/disk3s1s1 on / (apfs, sealed, local, read-only, journaled)
devfs on /dev (devfs, local, nobrowse)
alice@nas.local:/srv/media on /Users/alice/mnt/media (macfuse, nodev, nosuid, synchronous, mounted by alice)
bob@host:/tmp on /private/tmp/scratch (macfuse, nodev)
";

    const LINUX_LISTING: &str = "\
proc on /proc type proc (rw,nosuid,nodev,noexec,relatime)
alice@nas.local:/srv/media on /mnt/media type fuse.sshfs (rw,nosuid,nodev,relatime,user_id=1000)
";

    #[test]
    fn finds_macos_entries() {
        assert!(mount_table_contains(MACOS_LISTING, Path::new("/Users/alice/mnt/media")));
        assert!(mount_table_contains(MACOS_LISTING, Path::new("/Users/alice/mnt/media/")));
        assert!(mount_table_contains(MACOS_LISTING, Path::new("/tmp/scratch")));
        assert!(!mount_table_contains(MACOS_LISTING, Path::new("/Users/alice/mnt")));
    }

    #[test]
    fn finds_linux_entries() {
        assert!(mount_table_contains(LINUX_LISTING, Path::new("/mnt/media")));
        assert!(!mount_table_contains(LINUX_LISTING, Path::new("/mnt/med")));
        assert!(!mount_table_contains("", Path::new("/mnt/media")));
    }

    #[test]
    fn evidence_interpretation() {
        let mut evidence = Evidence {
            table: TableEvidence::Absent,
            stat: PathEvidence::PlainDirectory,
            capacity: PathEvidence::Unresponsive("timed out".into()),
            directory: DirectoryEvidence::NotChecked,
        };
        assert!(!evidence.mounted());
        assert!(!evidence.mount_point_missing());

        evidence.capacity = PathEvidence::MountPoint;
        evidence.directory = DirectoryEvidence::Failed("Input/output error".into());
        assert!(evidence.mounted());
        assert!(!evidence.healthy());
        assert_eq!(evidence.directory_failure(), Some("Input/output error"));

        evidence.directory = DirectoryEvidence::Readable;
        assert!(evidence.healthy());
    }

    #[test]
    fn missing_mount_point_counts_only_without_other_evidence() {
        let evidence = Evidence {
            table: TableEvidence::Unknown("timed out".into()),
            stat: PathEvidence::Missing,
            capacity: PathEvidence::Missing,
            directory: DirectoryEvidence::NotChecked,
        };
        assert!(evidence.mount_point_missing());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_probe_reads_a_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let probe = SystemFsProbe;

        let info = probe.stat(dir.path()).await.unwrap();
        assert!(info.is_dir);
        assert_eq!(probe.read_dir(dir.path()).await.unwrap(), 1);
        let capacity = probe.capacity(dir.path()).await.unwrap();
        assert!(capacity.total_bytes > 0);

        let nested = dir.path().join("mnt/x");
        probe.prepare_mount_point(&nested).await.unwrap();
        assert!(nested.is_dir());
        probe.remove_mount_point(&nested).await.unwrap();
        probe.remove_mount_point(&nested).await.unwrap();
        assert!(!nested.exists());
    }
}
