//! Error types shared by the store, the runner and the session.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while managing instances or running scripts
#[derive(Debug, Error)]
pub enum ShellError {
    /// A script or requirements file does not exist
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    /// A script wrote to stderr
    #[error("run failed: {0}")]
    RunFailed(String),
    /// `pip install` exited with a failure status
    #[error("requirement installation failed: {0}")]
    InstallRequireFailed(String),
    /// No instance with this name exists
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    /// The instance is leased by a running process
    #[error("instance in use: {0}")]
    InstanceInUse(String),
    /// The operation is not allowed on the reserved default instance
    #[error("instance is reserved: {0}")]
    ReservedInstance(String),
    /// The name cannot be used as an instance directory
    #[error("invalid instance name: {0:?}")]
    InvalidInstanceName(String),
    /// The isolation tool or the package manager failed during a build
    #[error("failed to create environment at {}: {reason}", .path.display())]
    EnvironmentCreationFailed {
        /// Environment root that was being built
        path: PathBuf,
        /// Captured failure output
        reason: String,
    },
    /// The base interpreter is missing
    #[error("interpreter not found: {}", .0.display())]
    InterpreterNotFound(PathBuf),
    /// A child process could not be started
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        /// Program that was being started
        program: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
    /// The task supervising a run panicked or was cancelled
    #[error("run supervisor failed: {0}")]
    Supervisor(String),
    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = ShellError> = std::result::Result<T, E>;
