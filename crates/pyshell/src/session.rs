//! High-level API for running scripts in managed environments.
//!
//! A [`ShellSession`] ties the pieces together: it resolves the base
//! interpreter once, owns the [`InstanceStore`] rooted under the configured
//! app directory, and routes each run either to the shared default
//! environment or to an instance of its own.
//!
//! # Example
//!
//! ```rust,ignore
//! use pyshell::{RunEvent, RunOptions, ShellConfig, ShellSession};
//!
//! let session = ShellSession::builder()
//!     .config(ShellConfig::with_app_dir("/var/lib/pyshell"))
//!     .build()?;
//! session.initialize().await?;
//!
//! let report = session
//!     .run_string("print('ok')", RunOptions::shared(), |event: RunEvent| {
//!         if let RunEvent::Output(line) = event {
//!             println!("{line}");
//!         }
//!     })
//!     .await?;
//! assert!(report.is_success());
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::bootstrap::{InterpreterBootstrap, SystemInterpreter};
use crate::config::{DEFAULT_INSTANCE, ShellConfig};
use crate::environment::{EnvironmentBuilder, VirtualenvBuilder};
use crate::error::Result;
use crate::runner::{InFlight, ProcessRunner, RunHandle, RunListener, RunReport, RunRequest};
use crate::scratch::clear_dir;
use crate::store::InstanceStore;

/// Which environment a run uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InstanceSelection {
    /// The default instance's interpreter, or the base interpreter if the
    /// default instance has not been built
    #[default]
    Shared,
    /// A named instance, created on demand and deleted after the last run
    /// using it terminates
    Named(String),
    /// A freshly created anonymous instance, deleted after the run
    Fresh,
}

/// Per-run options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Environment selection
    pub instance: InstanceSelection,
    /// Working directory; falls back to the configured default, then to the
    /// current directory
    pub working_dir: Option<PathBuf>,
    /// Echo output to stdout; falls back to the configured default
    pub echo: Option<bool>,
}

impl RunOptions {
    /// Run in the shared environment.
    pub fn shared() -> Self {
        Self::default()
    }

    /// Run in the named instance.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            instance: InstanceSelection::Named(name.into()),
            ..Self::default()
        }
    }

    /// Run in a new throwaway instance.
    pub fn fresh() -> Self {
        Self {
            instance: InstanceSelection::Fresh,
            ..Self::default()
        }
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Override the configured echo setting.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = Some(echo);
        self
    }
}

/// Builder for constructing a [`ShellSession`].
///
/// Without explicit collaborators the session resolves
/// `config.base_interpreter` on the host with [`SystemInterpreter`] and builds
/// environments with [`VirtualenvBuilder::from_config`].
#[derive(Default)]
pub struct ShellSessionBuilder {
    config: Option<ShellConfig>,
    bootstrap: Option<Arc<dyn InterpreterBootstrap>>,
    environment_builder: Option<Arc<dyn EnvironmentBuilder>>,
}

impl std::fmt::Debug for ShellSessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSessionBuilder")
            .field("config", &self.config)
            .field("has_bootstrap", &self.bootstrap.is_some())
            .field("has_environment_builder", &self.environment_builder.is_some())
            .finish()
    }
}

impl ShellSessionBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of [`ShellConfig::default`].
    pub fn config(mut self, config: ShellConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the collaborator that provides the base interpreter.
    pub fn bootstrap(mut self, bootstrap: impl InterpreterBootstrap + 'static) -> Self {
        self.bootstrap = Some(Arc::new(bootstrap));
        self
    }

    /// Set the collaborator that builds environments.
    pub fn environment_builder(mut self, builder: impl EnvironmentBuilder + 'static) -> Self {
        self.environment_builder = Some(Arc::new(builder));
        self
    }

    /// Set the environment builder from an Arc.
    pub fn environment_builder_arc(mut self, builder: Arc<dyn EnvironmentBuilder>) -> Self {
        self.environment_builder = Some(builder);
        self
    }

    /// Build the session.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Config`](crate::ShellError::Config) if the
    /// configuration is invalid. Nothing is touched on disk until the session
    /// is first used.
    pub fn build(self) -> Result<ShellSession> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let bootstrap = self
            .bootstrap
            .unwrap_or_else(|| Arc::new(SystemInterpreter::new(config.base_interpreter.clone())));
        let builder = self
            .environment_builder
            .unwrap_or_else(|| Arc::new(VirtualenvBuilder::from_config(&config)));

        Ok(ShellSession {
            config,
            bootstrap,
            builder,
            store: OnceCell::new(),
            runner: ProcessRunner::with_in_flight(InFlight::new()),
        })
    }
}

/// Runs scripts in the shared environment or in isolated instances.
///
/// All operations prepare the app directory on first use, so calling
/// [`initialize`](Self::initialize) up front is only needed to build the
/// default instance eagerly or to surface setup errors early.
pub struct ShellSession {
    config: ShellConfig,
    bootstrap: Arc<dyn InterpreterBootstrap>,
    builder: Arc<dyn EnvironmentBuilder>,
    store: OnceCell<InstanceStore>,
    runner: ProcessRunner,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("app_dir", &self.config.app_dir)
            .field("initialized", &self.store.initialized())
            .field("in_flight", &self.runner.in_flight().len())
            .finish_non_exhaustive()
    }
}

impl ShellSession {
    /// Create a new session builder.
    pub fn builder() -> ShellSessionBuilder {
        ShellSessionBuilder::new()
    }

    /// The session configuration.
    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Prepare the app directory and, if configured, build the default instance.
    pub async fn initialize(&self) -> Result<()> {
        let store = self.instances().await?;
        if self.config.create_default_env {
            store.get_or_create(DEFAULT_INSTANCE).await?;
        }
        tracing::info!("Session ready at {}", self.config.app_dir.display());
        Ok(())
    }

    /// The instance store, preparing the app directory on first call.
    pub async fn instances(&self) -> Result<&InstanceStore> {
        self.store.get_or_try_init(|| self.open_store()).await
    }

    async fn open_store(&self) -> Result<InstanceStore> {
        tokio::fs::create_dir_all(self.config.temp_dir()).await?;
        tokio::fs::create_dir_all(self.config.instances_dir()).await?;
        let base = self.bootstrap.ensure_base_interpreter().await?;
        tracing::debug!(
            "Opening instance store at {} with base interpreter {}",
            self.config.instances_dir().display(),
            base.display()
        );
        Ok(InstanceStore::new(
            self.config.instances_dir(),
            base,
            Arc::clone(&self.builder),
        ))
    }

    /// True when no run started by this session is live.
    pub fn is_resolved(&self) -> bool {
        self.runner.is_resolved()
    }

    /// Number of live runs.
    pub fn in_flight(&self) -> usize {
        self.runner.in_flight().len()
    }

    /// Run a script file and wait for it to terminate.
    ///
    /// `Err` means the run could not be started; script failures are reported
    /// through the listener and the returned [`RunReport`].
    pub async fn run_file<L>(
        &self,
        script: impl AsRef<Path>,
        options: RunOptions,
        listener: L,
    ) -> Result<RunReport>
    where
        L: RunListener + 'static,
    {
        self.start_file(script, options, listener).await?.wait().await
    }

    /// Run inline code and wait for it to terminate.
    pub async fn run_string<L>(
        &self,
        code: &str,
        options: RunOptions,
        listener: L,
    ) -> Result<RunReport>
    where
        L: RunListener + 'static,
    {
        self.start_string(code, options, listener).await?.wait().await
    }

    /// Start a script file and return once it is running.
    pub async fn start_file<L>(
        &self,
        script: impl AsRef<Path>,
        options: RunOptions,
        listener: L,
    ) -> Result<RunHandle>
    where
        L: RunListener + 'static,
    {
        let (request, _) = self.prepare(&options).await?;
        self.runner.start(script, request, listener)
    }

    /// Write inline code to a scratch file, start it, and return once it is running.
    pub async fn start_string<L>(
        &self,
        code: &str,
        options: RunOptions,
        listener: L,
    ) -> Result<RunHandle>
    where
        L: RunListener + 'static,
    {
        let (request, scratch_dir) = self.prepare(&options).await?;
        self.runner
            .start_string(code, &scratch_dir, request, listener)
    }

    /// Resolve the interpreter and scratch directory for a run.
    async fn prepare(&self, options: &RunOptions) -> Result<(RunRequest, PathBuf)> {
        let store = self.instances().await?;
        let working_dir = options
            .working_dir
            .clone()
            .or_else(|| self.config.default_working_dir.clone());
        let echo = options.echo.unwrap_or(self.config.echo);

        let lease = match &options.instance {
            InstanceSelection::Shared => None,
            InstanceSelection::Named(name) => {
                Some(store.checkout(Some(name.as_str()), true).await?)
            }
            InstanceSelection::Fresh => Some(store.checkout(None, true).await?),
        };

        let Some(lease) = lease else {
            let request = RunRequest::new(shared_interpreter(store))
                .working_dir(working_dir)
                .echo(echo);
            return Ok((request, self.config.temp_dir()));
        };

        let instance = lease.instance();
        tracing::debug!("Run scoped to instance [{}]", instance.name());
        let scratch_dir = instance.temp_dir().to_path_buf();
        let request = RunRequest::new(instance.interpreter())
            .working_dir(working_dir)
            .echo(echo)
            .on_terminal(move || drop(lease));
        Ok((request, scratch_dir))
    }

    /// Remove every non-default instance that is not in use, and empty the
    /// shared scratch directory.
    ///
    /// Scratch files of runs that are still live are kept. Returns the names
    /// of the removed instances.
    pub async fn clear(&self) -> Result<Vec<String>> {
        let store = self.instances().await?;
        let removed = store.clear_all()?;
        let kept = clear_dir(&self.config.temp_dir())?;
        tracing::info!(
            "Cleared {} instance(s) and shared scratch files, kept {} in use",
            removed.len(),
            kept
        );
        Ok(removed)
    }
}

/// The default instance's interpreter once it is fully built, else the base.
fn shared_interpreter(store: &InstanceStore) -> PathBuf {
    match store.get(DEFAULT_INSTANCE) {
        Ok(instance) if instance.is_ready() => instance.interpreter().to_path_buf(),
        _ => store.base_interpreter().to_path_buf(),
    }
}
