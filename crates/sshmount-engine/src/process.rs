//! External process execution.
//!
//! Every mount, unmount and mount-table listing goes through a [`ProcessRunner`].
//! The tokio implementation bounds the total duration of a call even when the
//! spawned program leaves detached descendants holding its output pipes open:
//! once the child exits (or is killed) the pipe readers get a short grace period
//! and are then abandoned.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::credentials::Secret;

/// One program invocation. Arguments are never joined into a shell string.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable name or path.
    pub program: String,
    /// Argument vector.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Written to stdin followed by a newline, then stdin is closed.
    pub stdin: Option<Secret>,
    /// Kill the process after this long.
    pub timeout: Duration,
    /// Redacted rendering for logs.
    pub display: String,
}

/// Result of a finished, timed-out or cancelled invocation.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
    /// `None` when killed or terminated by a signal.
    pub exit_code: Option<i32>,
    /// Killed on timeout.
    pub timed_out: bool,
    /// Killed on cancellation.
    pub cancelled: bool,
    /// Wall time from spawn to exit.
    pub duration: Duration,
}

impl ProcessOutput {
    /// Exited with status zero on its own.
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }

    /// Stderr if it says anything, otherwise stdout.
    pub fn diagnostic_text(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runs external programs.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion, timeout or cancellation. `Err` only when the program
    /// could not be started at all.
    async fn run(
        &self,
        spec: ProcessSpec,
        cancel: CancellationToken,
    ) -> std::io::Result<ProcessOutput>;
}

/// Runner backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    pipe_grace: Duration,
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self {
            pipe_grace: Duration::from_millis(250),
        }
    }
}

impl TokioProcessRunner {
    /// Runner that waits up to `pipe_grace` for output pipes after a kill.
    pub fn new(pipe_grace: Duration) -> Self {
        Self { pipe_grace }
    }
}

enum Exit {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(reader: JoinHandle<String>, grace: Duration) -> String {
    let abort = reader.abort_handle();
    match tokio::time::timeout(grace, reader).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            tracing::debug!("abandoning output pipe still held open by a descendant");
            String::new()
        }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        spec: ProcessSpec,
        cancel: CancellationToken,
    ) -> std::io::Result<ProcessOutput> {
        let started = Instant::now();
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(command = %spec.display, timeout_ms = spec.timeout.as_millis() as u64, "spawning");
        let mut child = command.spawn()?;

        if let (Some(secret), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(secret.expose().as_bytes()).await;
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let exit = tokio::select! {
            status = child.wait() => Exit::Exited(status.ok().and_then(|s| s.code())),
            _ = tokio::time::sleep(spec.timeout) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        let (exit_code, timed_out, cancelled) = match exit {
            Exit::Exited(code) => (code, false, false),
            Exit::TimedOut | Exit::Cancelled => {
                let _ = child.start_kill();
                // Reaping happens in the background; callers never wait on teardown.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                (None, matches!(exit, Exit::TimedOut), matches!(exit, Exit::Cancelled))
            }
        };

        let stdout = collect(stdout, self.pipe_grace).await;
        let stderr = collect(stderr, self.pipe_grace).await;
        let duration = started.elapsed();

        if timed_out {
            tracing::warn!(command = %spec.display, elapsed_ms = duration.as_millis() as u64, "command timed out");
        }

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
            cancelled,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str], timeout: Duration) -> ProcessSpec {
        ProcessSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: Vec::new(),
            stdin: None,
            timeout,
            display: program.to_string(),
        }
    }

    #[test]
    fn diagnostic_text_prefers_stderr() {
        let output = ProcessOutput {
            stdout: "out".into(),
            stderr: "  err \n".into(),
            ..Default::default()
        };
        assert_eq!(output.diagnostic_text(), "err");

        let quiet = ProcessOutput {
            stdout: "only stdout\n".into(),
            ..Default::default()
        };
        assert_eq!(quiet.diagnostic_text(), "only stdout");
    }

    #[test]
    fn success_requires_clean_exit() {
        let mut output = ProcessOutput {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(output.success());
        output.timed_out = true;
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = TokioProcessRunner::default();
        let output = runner
            .run(
                spec("sh", &["-c", "echo mounted; exit 3"], Duration::from_secs(5)),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "mounted");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn feeds_secret_on_stdin() {
        let runner = TokioProcessRunner::default();
        let mut s = spec("sh", &["-c", "read pw; echo got-$pw"], Duration::from_secs(5));
        s.stdin = Some(Secret::new("pw1"));
        let output = runner.run(s, CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout.trim(), "got-pw1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_child() {
        let runner = TokioProcessRunner::default();
        let started = std::time::Instant::now();
        let output = runner
            .run(
                spec("sleep", &["30"], Duration::from_millis(200)),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detached_descendant_does_not_hold_the_call() {
        let runner = TokioProcessRunner::default();
        let started = std::time::Instant::now();
        let output = runner
            .run(
                spec("sh", &["-c", "sleep 30 & echo parent-done"], Duration::from_secs(10)),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(0));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_returns_promptly() {
        let runner = TokioProcessRunner::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let output = runner
            .run(spec("sleep", &["30"], Duration::from_secs(20)), cancel)
            .await
            .unwrap();
        assert!(output.cancelled);
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let runner = TokioProcessRunner::default();
        let err = runner
            .run(
                spec("/nonexistent/sshfs-binary", &[], Duration::from_secs(1)),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
