//! Launching and supervising one external process run.

use crate::drain::{Drain, StreamName};
use crate::error::RunError;
use crate::feed::Feed;
use crate::result::RunResult;
use crate::signal;
use bytes::Bytes;
use jiff::Timestamp;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// How often the supervisor re-checks process liveness.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Wait after each shutdown signal before re-checking liveness.
const SIGNAL_GRACE: Duration = Duration::from_millis(500);

/// Extra wait after terminate while an output drain is still mid-stream,
/// giving buffered-but-unread output a chance to arrive.
const TERMINATE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Extra wait after kill while an output drain is still mid-stream.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Bound on waiting for the drains to observe end-of-stream once the process
/// has exited. The pipes close with the process, so under normal conditions
/// this is a matter of milliseconds.
const COLLECT_GRACE: Duration = Duration::from_secs(2);

/// Poll granularity when waiting for drains to finish.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for one external process run.
///
/// Launches the process with piped stdout/stderr, attaches a background drain
/// to each output stream (so the process can never deadlock on a full pipe),
/// optionally feeds a payload to its stdin in bounded chunks, and polls for
/// completion against an optional deadline. On timeout, shutdown escalates
/// from terminate to kill, each with a bounded grace period.
///
/// Each run is fully independent; concurrent runs do not interfere.
///
/// # Examples
///
/// ```no_run
/// use procrun::Run;
/// use std::time::Duration;
///
/// # async fn demo() -> Result<(), procrun::RunError> {
/// let result = Run::new(["wc", "-c"])
///     .timeout(Duration::from_secs(5))
///     .stdin(&b"some payload"[..])
///     .echo_stdout(false)
///     .execute()
///     .await?;
///
/// assert!(result.success());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Run {
    command: Vec<String>,
    timeout: Option<Duration>,
    stdin: Option<Bytes>,
    echo_stdout: bool,
    echo_stderr: bool,
    verbose: bool,
    simulate: bool,
}

impl Run {
    /// Creates a run configuration for the given argv.
    ///
    /// By default there is no deadline, no stdin payload, and both output
    /// streams are echoed live to this process' own stdout/stderr while
    /// being captured.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Run {
            command: command.into_iter().map(Into::into).collect(),
            timeout: None,
            stdin: None,
            echo_stdout: true,
            echo_stderr: true,
            verbose: false,
            simulate: false,
        }
    }

    /// Sets the wall-clock deadline, measured from process launch. When it
    /// elapses before the process exits, shutdown escalation begins and the
    /// result carries `timed_out == true`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Supplies a payload to feed into the process' stdin. The result will
    /// then carry a [`crate::StdinReport`].
    pub fn stdin(mut self, payload: impl Into<Bytes>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    /// Controls whether captured stdout is also mirrored live. Default: true.
    pub fn echo_stdout(mut self, echo: bool) -> Self {
        self.echo_stdout = echo;
        self
    }

    /// Controls whether captured stderr is also mirrored live. Default: true.
    pub fn echo_stderr(mut self, echo: bool) -> Self {
        self.echo_stderr = echo;
        self
    }

    /// Emits per-poll progress events at debug level. Default: false.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Simulate mode: do not spawn anything and return a canonical empty
    /// result (exit code 0, empty output, zero runtime). This is an explicit
    /// dry-run facility, never a fallback on error. Default: false.
    pub fn simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    /// Runs the process to its terminal state and assembles the result
    /// record.
    ///
    /// Blocks (asynchronously) until the process completed, was stopped by
    /// the escalation policy, or proved unkillable. Cancelling the returned
    /// future kills the child process; an interrupted supervisor never
    /// leaves an orphan behind.
    pub async fn execute(self) -> Result<RunResult, RunError> {
        if self.command.is_empty() {
            return Err(RunError::EmptyCommand);
        }
        let start_time = Timestamp::now();

        if self.simulate {
            tracing::debug!(command = ?self.command, "Simulate mode, not spawning anything");
            return Ok(RunResult {
                exit_code: Some(0),
                command: self.command,
                stdout: Bytes::new(),
                stderr: Bytes::new(),
                timed_out: false,
                runtime: Duration::ZERO,
                start_time,
                end_time: start_time,
                stdin: None,
            });
        }

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            // A cancelled supervisor must not leave the child behind.
            .kill_on_drop(true);

        tracing::debug!(command = ?self.command, "Starting external process");
        let mut child = cmd.spawn().map_err(|source| RunError::SpawnFailed {
            command: self.command_line(),
            source,
        })?;
        // The deadline clock starts here, at launch.
        let launched = Instant::now();
        let deadline = self.timeout.map(|timeout| launched + timeout);

        let stdout_drain = Drain::spawn(
            child.stdout.take().expect("stdout was piped"),
            StreamName::Stdout,
            self.echo_stdout,
        );
        let stderr_drain = Drain::spawn(
            child.stderr.take().expect("stderr was piped"),
            StreamName::Stderr,
            self.echo_stderr,
        );
        let feed = self
            .stdin
            .clone()
            .map(|payload| Feed::spawn(child.stdin.take().expect("stdin was piped"), payload));

        let natural_exit = loop {
            if let Some(status) = self.try_wait(&mut child)? {
                break Some(status);
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break None;
                }
                if self.verbose {
                    tracing::debug!(
                        command = ?self.command,
                        remaining = ?deadline.duration_since(now),
                        "Process still running"
                    );
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        let mut timed_out = false;
        let status = match natural_exit {
            Some(status) => status,
            None => {
                timed_out = true;
                self.escalate(&mut child, &stdout_drain, &stderr_drain)
                    .await?
            }
        };

        let runtime = launched.elapsed();
        tracing::debug!(
            command = ?self.command,
            ?runtime,
            exit_code = ?status.code(),
            timed_out,
            "Process reached its terminal state"
        );

        // The pipes deliver end-of-stream once the process is gone; give the
        // drains a bounded window to observe it.
        if !await_drains(&stdout_drain, &stderr_drain, COLLECT_GRACE).await {
            tracing::warn!(
                command = ?self.command,
                "Output streams still open after process exit; a spawned \
                 grandchild may be holding them"
            );
        }
        let stdout = self.collect(stdout_drain).await?;
        let stderr = self.collect(stderr_drain).await?;
        let stdin = feed.map(|feed| feed.report());

        Ok(RunResult {
            exit_code: status.code(),
            command: self.command,
            stdout,
            stderr,
            timed_out,
            runtime,
            start_time,
            end_time: Timestamp::now(),
            stdin,
        })
    }

    /// Convenience for synchronous callers: drives [`Run::execute`] to
    /// completion on a fresh current-thread runtime, blocking the calling
    /// thread.
    pub fn execute_blocking(self) -> Result<RunResult, RunError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| RunError::Runtime { source })?;
        runtime.block_on(self.execute())
    }

    /// Escalating shutdown after the deadline elapsed: terminate, grace
    /// period, re-check; then kill, grace period, re-check. A process that
    /// survives all of this is reported as unkillable. Each grace period is
    /// extended (bounded) while a drain is still mid-stream, so escalation
    /// never discards already-buffered output.
    async fn escalate(
        &self,
        child: &mut Child,
        stdout_drain: &Drain,
        stderr_drain: &Drain,
    ) -> Result<ExitStatus, RunError> {
        tracing::warn!(command = ?self.command, "Deadline exceeded, asking process to terminate");
        signal::send_terminate(child).map_err(|source| RunError::SignallingFailed {
            command: self.command_line(),
            signal: "terminate",
            source,
        })?;
        self.grace_wait(TERMINATE_DRAIN_GRACE, stdout_drain, stderr_drain)
            .await;
        if let Some(status) = self.try_wait(child)? {
            return Ok(status);
        }

        tracing::warn!(command = ?self.command, "Process survived terminate, killing it");
        child
            .start_kill()
            .map_err(|source| RunError::SignallingFailed {
                command: self.command_line(),
                signal: "kill",
                source,
            })?;
        self.grace_wait(KILL_DRAIN_GRACE, stdout_drain, stderr_drain)
            .await;
        match self.try_wait(child)? {
            Some(status) => Ok(status),
            None => Err(RunError::Unkillable {
                command: self.command_line(),
            }),
        }
    }

    /// Sleeps for the post-signal grace period, extending it up to
    /// `drain_extra` while either drain has not yet reached end-of-stream.
    async fn grace_wait(&self, drain_extra: Duration, stdout_drain: &Drain, stderr_drain: &Drain) {
        tokio::time::sleep(SIGNAL_GRACE).await;
        if !(stdout_drain.is_finished() && stderr_drain.is_finished()) {
            await_drains(stdout_drain, stderr_drain, drain_extra).await;
        }
    }

    fn try_wait(&self, child: &mut Child) -> Result<Option<ExitStatus>, RunError> {
        child.try_wait().map_err(|source| RunError::WaitFailed {
            command: self.command_line(),
            source,
        })
    }

    async fn collect(&self, mut drain: Drain) -> Result<Bytes, RunError> {
        drain
            .take_output()
            .await
            .map_err(|source| RunError::CollectFailed {
                command: self.command_line(),
                source,
            })
    }

    fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Polls both drains until each observed end-of-stream, bounded by `limit`.
/// Returns whether both finished within the bound.
async fn await_drains(stdout_drain: &Drain, stderr_drain: &Drain, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while !(stdout_drain.is_finished() && stderr_drain.is_finished()) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertr::prelude::*;

    #[test]
    fn builder_defaults_match_the_documented_behavior() {
        let run = Run::new(["ls", "-la"]);
        assert_that(&run.command).is_equal_to(&vec!["ls".to_string(), "-la".to_string()]);
        assert_that(run.timeout).is_none();
        assert_that(run.stdin.is_none()).is_true();
        assert_that(run.echo_stdout).is_true();
        assert_that(run.echo_stderr).is_true();
        assert_that(run.verbose).is_false();
        assert_that(run.simulate).is_false();
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = Run::new(Vec::<String>::new()).execute().await.unwrap_err();
        assert_that(matches!(err, RunError::EmptyCommand)).is_true();
    }

    #[tokio::test]
    async fn simulate_mode_returns_a_canonical_empty_result() {
        let result = Run::new(["some-tool", "--flag"])
            .simulate(true)
            .timeout(Duration::from_secs(1))
            .execute()
            .await
            .unwrap();

        assert_that(result.exit_code).is_some().is_equal_to(0);
        assert_that(result.stdout.is_empty()).is_true();
        assert_that(result.stderr.is_empty()).is_true();
        assert_that(result.timed_out).is_false();
        assert_that(result.runtime).is_equal_to(Duration::ZERO);
        assert_that(result.end_time).is_equal_to(result.start_time);
        assert_that(result.stdin.is_none()).is_true();
        assert_that(result.success()).is_true();
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_an_error() {
        let err = Run::new(["surely-not-an-installed-binary-2fa1"])
            .execute()
            .await
            .unwrap_err();
        assert_that(matches!(err, RunError::SpawnFailed { .. })).is_true();
    }
}
