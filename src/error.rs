//! Error type shared by the launcher, termination controller and event loop.
//!
//! None of these escape the public `Supervisor` entry points: they are folded
//! into a `CommandOutcome` and the session's `last_error` instead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Neither an isolated nor a system-wide interpreter could be resolved.
    #[error("no usable interpreter found (searched: {searched})")]
    InterpreterNotFound { searched: String },

    #[error("monitor entry point not found at {}", .0.display())]
    EntrypointNotFound(PathBuf),

    /// The OS refused to create the process.
    #[error("failed to spawn monitor process ({program}): {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("monitor process was spawned but reported no pid")]
    MissingPid,

    #[error("failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("process {pid} still alive after forceful termination")]
    Unkillable { pid: u32 },

    /// The event-loop task is gone (runtime shutting down).
    #[error("supervisor event loop is not running")]
    Disconnected,

    #[error("{0}")]
    Internal(String),
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
