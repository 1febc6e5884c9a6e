//! Run external processes with deadlock-free output capture, chunked stdin
//! feeding and an escalating terminate/kill timeout policy.
//!
//! The entry point is [`Run`]: configure a command line, execute it, and get
//! back an immutable [`RunResult`] describing everything that happened.

mod drain;
mod error;
mod feed;
mod result;
mod runner;
mod signal;

pub use drain::StreamName;
pub use error::{DrainError, RunError};
pub use result::{RunResult, StdinReport};
pub use runner::Run;
