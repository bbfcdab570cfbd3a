//! Handle to a supervised child process.
//!
//! Each spawned process is owned by a waiter task that selects between the
//! child exiting on its own and a stop request. The outcome is published on
//! a `watch` channel so that the monitor (polling) and a reload (awaiting)
//! observe the same exit.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Whether the exit was requested through [`EncoderProcess::terminate`].
    pub terminated: bool,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.terminated) {
            (Some(code), false) => write!(f, "exited with code {}", code),
            (None, false) => write!(f, "killed by signal"),
            (Some(code), true) => write!(f, "stopped (code {})", code),
            (None, true) => write!(f, "stopped"),
        }
    }
}

/// Spawn-time options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOptions {
    /// Kill the process if it has not exited this long after a stop request.
    /// `None` waits forever.
    pub stop_timeout: Option<Duration>,
    /// Forward stderr lines to the log at debug level.
    pub forward_stderr: bool,
}

/// A running (or finished) child process.
///
/// Dropping the handle requests a stop.
#[derive(Debug)]
pub struct EncoderProcess {
    pid: Option<u32>,
    cancel: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    started_at: Instant,
}

impl EncoderProcess {
    /// Spawn `command` and start supervising it.
    pub fn spawn(
        label: impl Into<String>,
        mut command: Command,
        options: SpawnOptions,
    ) -> std::io::Result<Self> {
        let label = label.into();

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(if options.forward_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn()?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, label.clone()));
        }

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        spawn_waiter(child, label, cancel.clone(), options.stop_timeout, exit_tx);

        Ok(Self {
            pid,
            cancel,
            exit_rx,
            started_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether the process is still alive.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none() && self.exit_rx.has_changed().is_ok()
    }

    /// Exit report, once the process has ended.
    pub fn exit_report(&self) -> Option<ExitReport> {
        *self.exit_rx.borrow()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_report().and_then(|r| r.code)
    }

    /// Request termination. Returns immediately.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// A receiver that yields the exit report once the process ends.
    ///
    /// Outlives the handle, so a caller can drop the process and still wait
    /// for the exit elsewhere.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitReport>> {
        self.exit_rx.clone()
    }

    /// Wait until the process has exited.
    pub async fn wait(&self) -> ExitReport {
        wait_for_exit(self.exit_watch()).await
    }

    /// Terminate and wait for the exit.
    pub async fn stop(&self) -> ExitReport {
        self.terminate();
        self.wait().await
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Wait on an exit watch obtained from [`EncoderProcess::exit_watch`].
pub async fn wait_for_exit(mut rx: watch::Receiver<Option<ExitReport>>) -> ExitReport {
    match rx.wait_for(Option::is_some).await {
        Ok(report) => report.unwrap_or_default(),
        // Waiter task is gone; the child went with it.
        Err(_) => ExitReport::default(),
    }
}

/// Log everything the child writes to stderr.
///
/// Reading stops only at EOF or a read error, so the pipe never fills up
/// and blocks the child.
async fn forward_stderr<R>(stderr: R, label: String)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                for line in output_lines(&buf) {
                    debug!(process = %label, "{}", line);
                }
            }
            Err(e) => {
                debug!(process = %label, "stderr closed: {}", e);
                break;
            }
        }
    }
}

/// Split a chunk of process output into printable lines.
fn output_lines(chunk: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(chunk)
        .split(['\r', '\n'])
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn spawn_waiter(
    mut child: Child,
    label: String,
    cancel: CancellationToken,
    stop_timeout: Option<Duration>,
    exit_tx: watch::Sender<Option<ExitReport>>,
) {
    tokio::spawn(async move {
        let report = tokio::select! {
            status = child.wait() => ExitReport {
                code: exit_code(&label, status),
                terminated: false,
            },
            _ = cancel.cancelled() => stop_child(&mut child, &label, stop_timeout).await,
        };

        let _ = exit_tx.send(Some(report));
    });
}

/// Send the termination signal and wait, killing after `stop_timeout`.
async fn stop_child(child: &mut Child, label: &str, stop_timeout: Option<Duration>) -> ExitReport {
    let signalled = match child.id() {
        Some(pid) => process_utils::send_terminate(pid).is_ok(),
        None => false,
    };
    if !signalled {
        let _ = child.start_kill();
    }

    let status = match stop_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    process = %label,
                    "Did not exit within {:?} of stop request, killing",
                    timeout
                );
                let _ = child.kill().await;
                child.wait().await
            }
        },
        None => child.wait().await,
    };

    ExitReport {
        code: exit_code(label, status),
        terminated: true,
    }
}

fn exit_code(label: &str, status: std::io::Result<ExitStatus>) -> Option<i32> {
    match status {
        Ok(status) => status.code(),
        Err(e) => {
            error!(process = %label, "Error waiting for process: {}", e);
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use process_utils::tokio_command;

    fn sh(script: &str) -> Command {
        let mut cmd = tokio_command("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_natural_exit() {
        let process = EncoderProcess::spawn("exit", sh("exit 3"), SpawnOptions::default()).unwrap();
        let report = process.wait().await;
        assert_eq!(report.code, Some(3));
        assert!(!report.terminated);
        assert!(!process.is_running());
        assert_eq!(process.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let process =
            EncoderProcess::spawn("sleep", sh("exec sleep 30"), SpawnOptions::default()).unwrap();
        assert!(process.is_running());
        assert!(process.pid().is_some());

        let report = process.stop().await;
        assert!(report.terminated);
        assert!(!report.success());
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_stop_timeout_kills() {
        let options = SpawnOptions {
            stop_timeout: Some(Duration::from_millis(200)),
            forward_stderr: false,
        };
        let process =
            EncoderProcess::spawn("stubborn", sh("trap '' TERM; exec sleep 30"), options).unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = tokio::time::timeout(Duration::from_secs(5), process.stop())
            .await
            .expect("process should be killed after the stop timeout");
        assert!(report.terminated);
        assert_eq!(report.code, None);
    }

    #[tokio::test]
    async fn test_exit_watch_outlives_handle() {
        let process =
            EncoderProcess::spawn("sleep", sh("exec sleep 30"), SpawnOptions::default()).unwrap();
        let watch = process.exit_watch();
        drop(process);

        let report = tokio::time::timeout(Duration::from_secs(5), wait_for_exit(watch))
            .await
            .unwrap();
        assert!(report.terminated);
    }

    #[test]
    fn test_output_lines() {
        assert_eq!(
            output_lines(b"frame=1 fps=25\rframe=2 fps=25\r\n"),
            vec!["frame=1 fps=25", "frame=2 fps=25"]
        );
        assert_eq!(output_lines(b"\xff\xfe bad bytes\n"), vec!["\u{fffd}\u{fffd} bad bytes"]);
        assert!(output_lines(b"\r\n").is_empty());
    }

    #[tokio::test]
    async fn test_forward_stderr_survives_invalid_utf8() {
        let input: &[u8] = b"\xff\xfe\nstill read\r\n";
        tokio::time::timeout(Duration::from_secs(1), forward_stderr(input, "test".into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_noisy_stderr_is_drained() {
        let options = SpawnOptions {
            stop_timeout: None,
            forward_stderr: true,
        };
        // Far more than a pipe buffer, none of it valid UTF-8.
        let process = EncoderProcess::spawn(
            "noisy",
            sh("i=0; while [ $i -lt 10000 ]; do printf '\\377\\376 progress\\r' >&2; i=$((i+1)); done; exit 0"),
            options,
        )
        .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), process.wait())
            .await
            .unwrap();
        assert_eq!(report.code, Some(0));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = EncoderProcess::spawn(
            "missing",
            tokio_command("/nonexistent/encoder"),
            SpawnOptions::default(),
        );
        assert!(result.is_err());
    }
}
