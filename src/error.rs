//! Error types for process runs.

use crate::drain::StreamName;
use std::io;
use thiserror::Error;

/// Errors that can occur when retrieving a drain's captured output.
///
/// These are caller errors against the one-shot-after-finish contract, or a
/// failure to join the background task. They never carry partial data.
#[derive(Debug, Error)]
pub enum DrainError {
    /// The stream has not reached end-of-data yet; returning its buffer now
    /// would silently truncate the output.
    #[error("The {stream} drain has not reached end-of-stream yet")]
    StillActive {
        /// The stream the drain was attached to.
        stream: StreamName,
    },

    /// The buffer was already taken once.
    #[error("The {stream} drain's buffer was already consumed")]
    AlreadyConsumed {
        /// The stream the drain was attached to.
        stream: StreamName,
    },

    /// The drain task could not be joined.
    #[error("The {stream} drain task could not be joined: {source}")]
    TaskJoin {
        /// The stream the drain was attached to.
        stream: StreamName,
        /// The underlying join error.
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Errors that can occur when running a process.
///
/// A non-zero exit status and an exceeded deadline are not errors; they are
/// reported inside the result record. Only conditions that leave the caller
/// without a truthful record surface here.
#[derive(Debug, Error)]
pub enum RunError {
    /// The supplied argv was empty.
    #[error("Cannot run an empty command line")]
    EmptyCommand,

    /// The process could not be spawned.
    #[error("Failed to spawn process '{command}': {source}")]
    SpawnFailed {
        /// The command line that was being launched.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A shutdown signal could not be delivered.
    #[error("Failed to send '{signal}' to process '{command}': {source}")]
    SignallingFailed {
        /// The command line of the process.
        command: String,
        /// The signal that could not be sent.
        signal: &'static str,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Querying process liveness failed.
    #[error("Failed to query liveness of process '{command}': {source}")]
    WaitFailed {
        /// The command line of the process.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The process was still alive after the full terminate/kill escalation.
    /// Returning a normal result would misrepresent an orphaned, still
    /// running process.
    #[error("Process '{command}' is still alive after terminate and kill escalation")]
    Unkillable {
        /// The command line of the process.
        command: String,
    },

    /// Captured output could not be collected after the terminal state was
    /// reached.
    #[error("Failed to collect captured output of process '{command}': {source}")]
    CollectFailed {
        /// The command line of the process.
        command: String,
        /// The underlying drain error.
        #[source]
        source: DrainError,
    },

    /// A runtime for a blocking run could not be started.
    #[error("Failed to start a runtime for a blocking run: {source}")]
    Runtime {
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}
