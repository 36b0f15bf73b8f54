//! Pyshell: isolated Python instances and streamed script execution
//!
//! Pyshell manages named Python environments ("instances") under an app
//! directory and runs scripts or inline code inside them, streaming each line
//! of output to a listener and finishing every run with exactly one terminal
//! event. Instances used by a running process are leased, so they are never
//! deleted underneath it, and scratch files are removed exactly once.
//!
//! Most callers only need [`ShellSession`]; [`InstanceStore`] and
//! [`ProcessRunner`] are exposed for finer-grained control.

mod bootstrap;
mod config;
mod environment;
mod error;
mod runner;
mod scratch;
mod session;
mod store;


pub use bootstrap::{InterpreterBootstrap, SystemInterpreter};
pub use config::{DEFAULT_INSTANCE, DEFAULT_ISOLATION_MODULE, ShellConfig};
pub use environment::{Environment, EnvironmentBuilder, Requirements, VirtualenvBuilder};
pub use error::{Result, ShellError};
pub use runner::{
    InFlight, NoopListener, ProcessRunner, RunEvent, RunFailure, RunHandle, RunId, RunListener,
    RunOutcome, RunReport, RunRequest, RunState,
};
pub use session::{InstanceSelection, RunOptions, ShellSession, ShellSessionBuilder};
pub use store::{Instance, InstanceLease, InstanceStore, normalize_name};
