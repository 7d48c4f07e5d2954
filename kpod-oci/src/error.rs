//! Error types for the container lifecycle core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Pipe or temporary file could not be set up.
    #[error("failed to set up {what} for container '{id}': {source}")]
    Pipe {
        id: String,
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Monitor binary could not be executed.
    #[error("failed to spawn {} for container '{id}': {source}", .program.display())]
    Spawn {
        id: String,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The monitor broke the sync pipe protocol.
    #[error("protocol error for container '{id}': {reason}")]
    Protocol { id: String, reason: String },

    /// The monitor reported that creation failed.
    #[error("container create failed for '{id}': {message}")]
    CreateFailed { id: String, message: String },

    /// The monitor did not report back in time.
    #[error("create container '{id}' timed out after {timeout:?}")]
    CreateTimeout { id: String, timeout: Duration },

    /// A runtime subcommand exited unsuccessfully.
    #[error("runtime {command} failed for container '{id}': {reason}")]
    RuntimeCommand {
        id: String,
        command: String,
        reason: String,
    },

    /// The caller cancelled the operation.
    #[error("operation on container '{id}' was cancelled")]
    Cancelled { id: String },

    /// The container process survived the forceful kill ceiling.
    #[error("container '{id}' still running {timeout:?} after SIGKILL")]
    StopTimeout { id: String, timeout: Duration },

    /// The synchronous exec could not produce a result.
    #[error(
        "command error in container '{id}': {reason}, stdout: {stdout}, stderr: {stderr}, exit code {exit_code}"
    )]
    ExecSync {
        id: String,
        reason: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
    },

    /// The runtime's state report could not be decoded.
    #[error("failed to decode container status for '{id}': {source}")]
    StatusDecode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// The exit notification file was present but unusable.
    #[error("exit file for container '{id}': {reason}")]
    ExitFile { id: String, reason: String },

    /// The monitor could not join one or more cgroups.
    #[error("cgroup placement for container '{id}': {reason}")]
    Cgroup { id: String, reason: String },

    /// Invalid runtime configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
