//! Child process supervision: the long-lived server and one-shot commands.

use crate::config::LaunchSpec;
use crate::error::{PreflightError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Result of a one-shot command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedOutput {
    /// Executable that was run.
    pub program: String,

    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl CapturedOutput {
    /// Whether the command passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// First non-empty stdout line, trimmed.
    pub fn first_stdout_line(&self) -> Option<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

/// What cleanup did with a service handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CleanupOutcome {
    /// The service was not started by this run; nothing was touched.
    NotOwned,

    /// The owned process was signalled and has exited.
    Terminated { pid: Option<u32>, status: String },
}

/// A server process this run may own.
///
/// Consumed by [`ServiceHandle::terminate_and_wait`], so a handle can only be
/// cleaned up once.
#[derive(Debug)]
pub struct ServiceHandle {
    program: String,
    child: Option<Child>,
    process_id: Option<u32>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    is_owned: bool,
}

impl ServiceHandle {
    /// Handle for a service that was already running.
    pub fn unowned() -> Self {
        Self {
            program: String::new(),
            child: None,
            process_id: None,
            stdout: None,
            stderr: None,
            is_owned: false,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.is_owned
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    /// Drain the captured streams into debug logs so the child never blocks
    /// on a full pipe. Best effort; read errors end the drain silently.
    pub fn forward_output(&mut self) {
        if let Some(stdout) = self.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = self.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }
    }

    /// Exit status if the owned process has already exited.
    pub fn try_exit_status(&mut self) -> Result<Option<String>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?.map(|status| status.to_string())),
            None => Ok(None),
        }
    }

    /// Signal the owned process to stop and block until it has exited.
    ///
    /// Known gap: the wait has no timeout. A server that ignores SIGTERM
    /// hangs the run here.
    pub async fn terminate_and_wait(mut self) -> Result<CleanupOutcome> {
        let mut child = match (self.is_owned, self.child.take()) {
            (true, Some(child)) => child,
            _ => return Ok(CleanupOutcome::NotOwned),
        };

        info!(pid = ?self.process_id, program = %self.program, "Stopping server process");
        if let Err(e) = send_terminate(&mut child) {
            warn!(pid = ?self.process_id, "Failed to signal server process: {}", e);
        }

        let status = child.wait().await?;
        info!(pid = ?self.process_id, status = %status, "Server process exited");

        Ok(CleanupOutcome::Terminated {
            pid: self.process_id,
            status: status.to_string(),
        })
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from),
        // Already reaped
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

async fn forward_lines<R: AsyncRead + Unpin>(pipe: R, stream: &'static str) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream, "server: {}", line);
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Kill a child that is not handed out, so it does not outlive the run.
fn discard_child(child: &mut Child, program: &str) {
    if let Err(e) = child.start_kill() {
        warn!(program = %program, "Failed to kill server process: {}", e);
    }
}

/// Resolve a relative program path such as `./katago_eigen` against the
/// directory the command runs in. Bare names are left to `PATH` lookup.
fn resolve_program(exe: &str, dir: Option<&Path>) -> PathBuf {
    let path = Path::new(exe);
    match dir {
        Some(dir) if path.is_relative() && path.components().count() > 1 => dir.join(path),
        _ => path.to_path_buf(),
    }
}

fn split_command<'a>(command: &'a [String], purpose: &str) -> Result<(&'a String, &'a [String])> {
    command
        .split_first()
        .ok_or_else(|| PreflightError::EmptyCommand(purpose.to_string()))
}

/// Launches the server and runs one-shot commands.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Start the server as a child process with piped output.
    ///
    /// Does not wait for readiness. The child is checked once after the
    /// startup grace period; a child that already exited is a launch failure.
    pub async fn launch(spec: &LaunchSpec) -> Result<ServiceHandle> {
        let (exe, args) = split_command(&spec.command, "launch")?;

        let dir = spec.working_dir.as_deref();
        let mut command = Command::new(resolve_program(exe, dir));
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| PreflightError::Spawn {
            program: exe.clone(),
            source,
        })?;
        let process_id = child.id();
        info!(pid = ?process_id, program = %exe, "Launched server process");

        let grace = spec.startup_grace();
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }

        let exited = match child.try_wait() {
            Ok(exited) => exited,
            Err(e) => {
                discard_child(&mut child, exe);
                return Err(e.into());
            }
        };
        if let Some(status) = exited {
            let stderr = tokio::time::timeout(Duration::from_secs(1), read_pipe(child.stderr.take()))
                .await
                .unwrap_or_default();
            let stderr = stderr.trim();
            let status = if stderr.is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, stderr)
            };
            return Err(PreflightError::ExitedEarly {
                program: exe.clone(),
                status,
            });
        }

        Ok(ServiceHandle {
            program: exe.clone(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child: Some(child),
            process_id,
            is_owned: true,
        })
    }

    /// Run a command to completion, capturing its output.
    ///
    /// On timeout the child is killed and reaped before the error is returned.
    pub async fn run_and_capture(command: &[String], timeout: Duration) -> Result<CapturedOutput> {
        Self::run_and_capture_in(command, None, timeout).await
    }

    /// Like [`ProcessSupervisor::run_and_capture`], run from `dir` when given.
    pub async fn run_and_capture_in(
        command: &[String],
        dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<CapturedOutput> {
        let start = Instant::now();
        let (exe, args) = split_command(command, "one-shot command")?;

        let mut cmd = Command::new(resolve_program(exe, dir));
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|source| PreflightError::Spawn {
            program: exe.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async {
            let (status, stdout, stderr) =
                tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr));
            status.map(|status| (status, stdout, stderr))
        };
        let finished = tokio::time::timeout(timeout, run).await;

        let (status, stdout, stderr) = match finished {
            Ok(result) => result?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(program = %exe, "Failed to kill timed out command: {}", e);
                }
                return Err(PreflightError::Timeout {
                    program: exe.clone(),
                    secs: timeout.as_secs(),
                });
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = status.code().unwrap_or(-1);
        debug!(program = %exe, exit_code, duration_ms, "Command finished");

        Ok(CapturedOutput {
            program: exe.clone(),
            exit_code,
            stdout,
            stderr,
            duration_ms,
            success: status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_captured_output_passed() {
        let output = CapturedOutput {
            program: "katago_eigen".to_string(),
            exit_code: 0,
            stdout: "\nKataGo v1.4.5\nGit revision: abc\n".to_string(),
            stderr: "".to_string(),
            duration_ms: 100,
            success: true,
        };
        assert!(output.passed());
        assert_eq!(output.first_stdout_line().as_deref(), Some("KataGo v1.4.5"));
    }

    #[test]
    fn test_captured_output_failed() {
        let output = CapturedOutput {
            program: "katago_eigen".to_string(),
            exit_code: 1,
            stdout: "".to_string(),
            stderr: "error".to_string(),
            duration_ms: 100,
            success: false,
        };
        assert!(!output.passed());
        assert!(output.first_stdout_line().is_none());
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let err = ProcessSupervisor::run_and_capture(&[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PreflightError::EmptyCommand(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = ProcessSupervisor::run_and_capture(
            &command(&["definitely-not-a-binary-5f1c"]),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PreflightError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_and_capture_simple_command() {
        let output =
            ProcessSupervisor::run_and_capture(&command(&["echo", "hello"]), Duration::from_secs(10))
                .await
                .expect("run failed");
        assert!(output.passed());
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_and_capture_failing_command() {
        let output = ProcessSupervisor::run_and_capture(
            &command(&["sh", "-c", "echo broken >&2; exit 3"]),
            Duration::from_secs(10),
        )
        .await
        .expect("run failed");
        assert!(!output.passed());
        assert_eq!(output.exit_code, 3);
        assert!(output.stderr.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_and_capture_timeout_kills_child() {
        let start = Instant::now();
        let err = ProcessSupervisor::run_and_capture(
            &command(&["sleep", "30"]),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PreflightError::Timeout { .. }));
        // Returned promptly, not after the child finished on its own
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_and_terminate() {
        let mut spec = LaunchSpec::new(command(&["sleep", "30"]));
        spec.startup_grace_ms = 100;

        let mut handle = ProcessSupervisor::launch(&spec).await.expect("launch failed");
        assert!(handle.is_owned());
        assert!(handle.process_id().is_some());
        assert_eq!(handle.try_exit_status().unwrap(), None);
        handle.forward_output();

        let outcome = handle.terminate_and_wait().await.expect("terminate failed");
        match outcome {
            CleanupOutcome::Terminated { pid, status } => {
                assert!(pid.is_some());
                assert!(status.contains("signal"), "unexpected status: {}", status);
            }
            other => panic!("expected Terminated, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_child_exiting_immediately() {
        let mut spec = LaunchSpec::new(command(&["sh", "-c", "echo boom >&2; exit 2"]));
        spec.startup_grace_ms = 300;

        let err = ProcessSupervisor::launch(&spec).await.unwrap_err();
        match err {
            PreflightError::ExitedEarly { program, status } => {
                assert_eq!(program, "sh");
                assert!(status.contains("boom"), "unexpected status: {}", status);
            }
            other => panic!("expected ExitedEarly, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let spec = LaunchSpec::new(command(&["definitely-not-a-binary-5f1c"]));
        let err = ProcessSupervisor::launch(&spec).await.unwrap_err();
        assert!(matches!(err, PreflightError::Spawn { .. }));
    }

    #[test]
    fn test_resolve_program() {
        let dir = Path::new("/opt/katago");
        assert_eq!(
            resolve_program("./katago_eigen", Some(dir)),
            PathBuf::from("/opt/katago/./katago_eigen")
        );
        assert_eq!(resolve_program("python3", Some(dir)), PathBuf::from("python3"));
        assert_eq!(resolve_program("/usr/bin/env", Some(dir)), PathBuf::from("/usr/bin/env"));
        assert_eq!(resolve_program("./katago_eigen", None), PathBuf::from("./katago_eigen"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_and_capture_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.bin.gz"), b"weights").unwrap();

        let output = ProcessSupervisor::run_and_capture_in(
            &command(&["sh", "-c", "test -f model.bin.gz && echo found"]),
            Some(dir.path()),
            Duration::from_secs(10),
        )
        .await
        .expect("run failed");
        assert!(output.passed(), "stderr: {}", output.stderr);
        assert_eq!(output.first_stdout_line().as_deref(), Some("found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discarded_child_is_killed() {
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");

        discard_child(&mut child, "sleep");

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child still running")
            .expect("wait failed");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_unowned_handle_is_not_terminated() {
        let handle = ServiceHandle::unowned();
        assert!(!handle.is_owned());
        let outcome = handle.terminate_and_wait().await.unwrap();
        assert_eq!(outcome, CleanupOutcome::NotOwned);
    }
}
