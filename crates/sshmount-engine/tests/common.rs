//! Common fakes and fixtures for integration tests.
//!
//! `FakeWorld` is an in-memory model of the mount table and the mount points.
//! The fake runner, command builder and filesystem probe all act on it, so
//! tests drive the real supervisor, lifecycle engine and recovery engine
//! without touching sshfs or the filesystem.

#![allow(dead_code)]

use async_trait::async_trait;
use sshmount_engine::command::{CommandBuilder, CommandLine};
use sshmount_engine::config::SshmountConfig;
use sshmount_engine::credentials::MemoryCredentialResolver;
use sshmount_engine::error::Result as MountResult;
use sshmount_engine::probe::{Capacity, FsProbe, PathInfo};
use sshmount_engine::process::{ProcessOutput, ProcessRunner, ProcessSpec};
use sshmount_engine::service::{Collaborators, MountService};
use sshmount_engine::store::MemoryRemoteStore;
use sshmount_engine::types::{AuthMode, RemoteConfig, RemoteId};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How `fake-mount` behaves for a mount point.
#[derive(Debug, Clone)]
pub enum MountBehavior {
    /// Mount after the world's default latency.
    Succeed,
    /// Mount after the given delay.
    Delay(Duration),
    /// Never exit.
    Hang,
    /// Exit 1 with this stderr.
    Fail(String),
    /// Fail with this stderr for the next `n` calls, then succeed.
    FailTimes(usize, String),
    /// Exit 0 without mounting anything.
    Phantom,
}

#[derive(Default)]
struct World {
    mounted: HashSet<PathBuf>,
    stale: HashSet<PathBuf>,
    missing: HashSet<PathBuf>,
    hung_unmount: HashSet<PathBuf>,
    behaviors: HashMap<PathBuf, MountBehavior>,
    default_behavior: Option<MountBehavior>,
    mount_calls: HashMap<PathBuf, usize>,
    unmount_calls: HashMap<PathBuf, usize>,
    stdin_seen: Vec<String>,
    killed: Vec<PathBuf>,
    removed: Vec<PathBuf>,
    read_dir_delay: Duration,
    running_mounts: usize,
    max_running_mounts: usize,
}

pub struct FakeWorld {
    inner: Mutex<World>,
    latency: Duration,
}

impl FakeWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(World::default()),
            latency: Duration::from_millis(50),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn mount(&self, path: &Path) {
        self.with(|w| w.mounted.insert(path.to_path_buf()));
    }

    /// External unmount: the mount disappears, the directory stays.
    pub fn unmount(&self, path: &Path) {
        self.with(|w| w.mounted.remove(path));
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.with(|w| w.mounted.contains(path))
    }

    pub fn set_stale(&self, path: &Path) {
        self.with(|w| w.stale.insert(path.to_path_buf()));
    }

    pub fn set_missing(&self, path: &Path) {
        self.with(|w| w.missing.insert(path.to_path_buf()));
    }

    pub fn set_hung_unmount(&self, path: &Path) {
        self.with(|w| w.hung_unmount.insert(path.to_path_buf()));
    }

    pub fn set_behavior(&self, path: &Path, behavior: MountBehavior) {
        self.with(|w| w.behaviors.insert(path.to_path_buf(), behavior));
    }

    /// Behavior for mount points without one of their own, such as the
    /// scratch mount points of connection tests.
    pub fn set_default_behavior(&self, behavior: MountBehavior) {
        self.with(|w| w.default_behavior = Some(behavior));
    }

    pub fn set_read_dir_delay(&self, delay: Duration) {
        self.with(|w| w.read_dir_delay = delay);
    }

    pub fn mount_calls(&self, path: &Path) -> usize {
        self.with(|w| w.mount_calls.get(path).copied().unwrap_or(0))
    }

    pub fn unmount_calls(&self, path: &Path) -> usize {
        self.with(|w| w.unmount_calls.get(path).copied().unwrap_or(0))
    }

    pub fn stdin_seen(&self) -> Vec<String> {
        self.with(|w| w.stdin_seen.clone())
    }

    pub fn killed(&self) -> Vec<PathBuf> {
        self.with(|w| w.killed.clone())
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.with(|w| w.removed.clone())
    }

    pub fn max_concurrent_mounts(&self) -> usize {
        self.with(|w| w.max_running_mounts)
    }

    fn listing(&self) -> String {
        self.with(|w| {
            let mut lines: Vec<String> = w
                .mounted
                .iter()
                .map(|p| format!("fake@host:/ on {} (fuse.sshfs, nodev, nosuid)", p.display()))
                .collect();
            lines.sort();
            lines.join("\n")
        })
    }
}

/// Decrements the running-mount gauge when the fake mount process ends,
/// including when its future is dropped.
struct MountGauge<'a>(&'a FakeWorld);

impl<'a> MountGauge<'a> {
    fn enter(world: &'a FakeWorld) -> Self {
        world.with(|w| {
            w.running_mounts += 1;
            w.max_running_mounts = w.max_running_mounts.max(w.running_mounts);
        });
        MountGauge(world)
    }
}

impl Drop for MountGauge<'_> {
    fn drop(&mut self) {
        self.0.with(|w| w.running_mounts -= 1);
    }
}

fn exited(code: i32, stdout: String, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        stdout,
        stderr: stderr.to_string(),
        exit_code: Some(code),
        ..Default::default()
    }
}

pub struct FakeRunner {
    world: Arc<FakeWorld>,
}

impl FakeRunner {
    async fn fake_mount(&self, mount_point: PathBuf, stdin: Option<String>) -> ProcessOutput {
        let world = &self.world;
        let behavior = world.with(|w| {
            *w.mount_calls.entry(mount_point.clone()).or_default() += 1;
            if let Some(secret) = stdin {
                w.stdin_seen.push(secret);
            }
            let behavior = w
                .behaviors
                .get(&mount_point)
                .cloned()
                .or_else(|| w.default_behavior.clone())
                .unwrap_or(MountBehavior::Succeed);
            if let MountBehavior::FailTimes(n, stderr) = &behavior {
                let next = if *n <= 1 {
                    MountBehavior::Succeed
                } else {
                    MountBehavior::FailTimes(n - 1, stderr.clone())
                };
                w.behaviors.insert(mount_point.clone(), next);
            }
            behavior
        });

        let _gauge = MountGauge::enter(world);
        match behavior {
            MountBehavior::Succeed => {
                tokio::time::sleep(world.latency).await;
                world.mount(&mount_point);
                exited(0, String::new(), "")
            }
            MountBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                world.mount(&mount_point);
                exited(0, String::new(), "")
            }
            MountBehavior::Hang => std::future::pending().await,
            MountBehavior::Fail(stderr) | MountBehavior::FailTimes(_, stderr) => {
                tokio::time::sleep(world.latency).await;
                exited(1, String::new(), &stderr)
            }
            MountBehavior::Phantom => {
                tokio::time::sleep(world.latency).await;
                exited(0, String::new(), "")
            }
        }
    }

    async fn execute(&self, spec: &ProcessSpec) -> io::Result<ProcessOutput> {
        let target = spec.args.last().map(PathBuf::from).unwrap_or_default();
        match spec.program.as_str() {
            "fake-mount" => {
                let stdin = spec.stdin.as_ref().map(|s| s.expose().to_string());
                Ok(self.fake_mount(target, stdin).await)
            }
            "fake-umount" => {
                let hung = self.world.with(|w| {
                    *w.unmount_calls.entry(target.clone()).or_default() += 1;
                    w.hung_unmount.contains(&target)
                });
                if hung {
                    std::future::pending::<()>().await;
                }
                self.world.unmount(&target);
                Ok(exited(0, String::new(), ""))
            }
            "fake-mounts" => Ok(exited(0, self.world.listing(), "")),
            "fake-kill" => {
                self.world.with(|w| {
                    w.killed.push(target.clone());
                    w.hung_unmount.remove(&target);
                    w.mounted.remove(&target);
                });
                Ok(exited(0, String::new(), ""))
            }
            other => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{other}: not found"),
            )),
        }
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, spec: ProcessSpec, cancel: CancellationToken) -> io::Result<ProcessOutput> {
        let started = Instant::now();
        let output = tokio::select! {
            output = self.execute(&spec) => output?,
            _ = tokio::time::sleep(spec.timeout) => ProcessOutput { timed_out: true, ..Default::default() },
            _ = cancel.cancelled() => ProcessOutput { cancelled: true, ..Default::default() },
        };
        Ok(ProcessOutput {
            duration: started.elapsed(),
            ..output
        })
    }
}

pub struct FakeBuilder;

impl CommandBuilder for FakeBuilder {
    fn mount_command(
        &self,
        remote: &RemoteConfig,
        mount_point: &Path,
        password_on_stdin: bool,
    ) -> MountResult<CommandLine> {
        let mut args = vec![format!("{}@{}:{}", remote.username, remote.host, remote.remote_path)];
        if password_on_stdin {
            args.push("-o".to_string());
            args.push("password_stdin".to_string());
        }
        args.push(mount_point.display().to_string());
        Ok(CommandLine::new("fake-mount", args))
    }

    fn unmount_commands(&self, mount_point: &Path) -> Vec<CommandLine> {
        let target = mount_point.display().to_string();
        vec![
            CommandLine::new("fake-umount", vec![target.clone()]),
            CommandLine::new("fake-umount", vec!["--force".to_string(), target]),
        ]
    }

    fn force_stop_command(&self, mount_point: &Path) -> CommandLine {
        CommandLine::new("fake-kill", vec![mount_point.display().to_string()])
    }

    fn mount_table_command(&self) -> CommandLine {
        CommandLine::new("fake-mounts", Vec::new())
    }
}

pub struct FakeFs {
    world: Arc<FakeWorld>,
}

#[async_trait]
impl FsProbe for FakeFs {
    async fn stat(&self, path: &Path) -> io::Result<PathInfo> {
        self.world.with(|w| {
            if w.missing.contains(path) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "No such file or directory"));
            }
            let device = if w.mounted.contains(path) { 2 } else { 1 };
            Ok(PathInfo { device, is_dir: true })
        })
    }

    async fn capacity(&self, path: &Path) -> io::Result<Capacity> {
        self.world.with(|w| {
            if w.missing.contains(path) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "No such file or directory"));
            }
            Ok(if w.mounted.contains(path) {
                Capacity {
                    filesystem_id: 2,
                    total_bytes: 1 << 40,
                    available_bytes: 1 << 39,
                }
            } else {
                Capacity {
                    filesystem_id: 1,
                    total_bytes: 1 << 30,
                    available_bytes: 1 << 29,
                }
            })
        })
    }

    async fn read_dir(&self, path: &Path) -> io::Result<usize> {
        let delay = self.world.with(|w| w.read_dir_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.world.with(|w| {
            if w.missing.contains(path) {
                Err(io::Error::new(io::ErrorKind::NotFound, "No such file or directory"))
            } else if w.stale.contains(path) {
                Err(io::Error::new(io::ErrorKind::Other, "Input/output error"))
            } else {
                Ok(3)
            }
        })
    }

    async fn prepare_mount_point(&self, path: &Path) -> io::Result<()> {
        self.world.with(|w| w.missing.remove(path));
        Ok(())
    }

    async fn remove_mount_point(&self, path: &Path) -> io::Result<()> {
        self.world.with(|w| w.removed.push(path.to_path_buf()));
        Ok(())
    }
}

pub fn remote(name: &str) -> RemoteConfig {
    RemoteConfig {
        id: RemoteId::from_uuid(Uuid::new_v4()),
        name: name.to_string(),
        host: format!("{name}.example.net"),
        port: 22,
        username: "tester".to_string(),
        remote_path: "/srv".to_string(),
        mount_point: PathBuf::from(format!("/mnt/sshmount-tests/{name}")),
        auth: AuthMode::PrivateKey {
            identity_file: PathBuf::from("/home/tester/.ssh/id_ed25519"),
        },
        auto_connect: false,
        extra_options: Vec::new(),
    }
}

pub struct Harness {
    pub world: Arc<FakeWorld>,
    pub store: Arc<MemoryRemoteStore>,
    pub credentials: Arc<MemoryCredentialResolver>,
    pub service: MountService,
    pub remotes: Vec<RemoteConfig>,
}

impl Harness {
    pub fn new(names: &[&str]) -> Self {
        Self::with_remotes(SshmountConfig::default(), names.iter().map(|n| remote(n)).collect())
    }

    pub fn with_remotes(config: SshmountConfig, remotes: Vec<RemoteConfig>) -> Self {
        let world = FakeWorld::new();
        let store = Arc::new(MemoryRemoteStore::new(remotes.clone()));
        let credentials = Arc::new(MemoryCredentialResolver::new());
        let collaborators = Collaborators {
            runner: Arc::new(FakeRunner {
                world: Arc::clone(&world),
            }),
            fs: Arc::new(FakeFs {
                world: Arc::clone(&world),
            }),
            credentials: credentials.clone(),
            builder: Arc::new(FakeBuilder),
            store: store.clone(),
        };
        let service = MountService::new(&config, collaborators);
        Self {
            world,
            store,
            credentials,
            service,
            remotes,
        }
    }

    pub fn remote(&self, index: usize) -> &RemoteConfig {
        &self.remotes[index]
    }

    pub fn id(&self, index: usize) -> RemoteId {
        self.remotes[index].id
    }

    pub fn mount_point(&self, index: usize) -> &Path {
        &self.remotes[index].mount_point
    }
}
