//! The immutable summary record of one process run.

use bytes::Bytes;
use jiff::Timestamp;
use std::borrow::Cow;
use std::time::Duration;

/// How much of a supplied stdin payload made it into the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdinReport {
    /// Bytes actually written before the feed stopped.
    pub bytes_sent: usize,

    /// Bytes left unwritten, e.g. because the process exited without reading
    /// all of its input or was stopped by the deadline.
    ///
    /// `bytes_sent + bytes_remaining` always equals the payload length.
    pub bytes_remaining: usize,
}

/// Summary of one process run that reached a terminal state.
///
/// Constructed exactly once, never mutated afterwards. A non-zero exit status
/// and an exceeded deadline are both reported here rather than raised as
/// errors; callers are expected to branch on [`RunResult::exit_code`] and
/// [`RunResult::timed_out`].
///
/// `stdout` and `stderr` each preserve byte order exactly as the process
/// wrote it. There is no ordering guarantee *between* the two streams; they
/// are drained independently.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Exit status code. `None` when the process was stopped by a signal,
    /// which on unix leaves no code.
    pub exit_code: Option<i32>,

    /// The argv the process was launched with.
    pub command: Vec<String>,

    /// Everything the process wrote to stdout, in order, without loss.
    pub stdout: Bytes,

    /// Everything the process wrote to stderr, in order, without loss.
    pub stderr: Bytes,

    /// Whether the deadline elapsed before the process exited on its own.
    /// Implies the process was forcibly signalled.
    pub timed_out: bool,

    /// Wall-clock time from launch to the terminal state.
    pub runtime: Duration,

    /// When the process was launched.
    pub start_time: Timestamp,

    /// When the terminal state was reached.
    pub end_time: Timestamp,

    /// Present only when an input payload was supplied.
    pub stdin: Option<StdinReport>,
}

impl RunResult {
    /// True iff the process exited on its own with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Captured stdout as text, with invalid UTF-8 replaced.
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Captured stderr as text, with invalid UTF-8 replaced.
    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}
