//! Building isolated interpreter environments.
//!
//! An [`Environment`] is a directory holding a private interpreter and its
//! packages. [`EnvironmentBuilder`] is the seam for creating one; the shipped
//! [`VirtualenvBuilder`] runs `<base> -m virtualenv <root>` and then uses the
//! new interpreter's `pip` for everything else.
//!
//! Setup commands are awaited to completion. Their output is logged, not
//! streamed.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ShellConfig;
use crate::error::{Result, ShellError};
use crate::scratch::ScratchFile;

/// An isolated interpreter rooted at a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    root: PathBuf,
    interpreter: PathBuf,
}

impl Environment {
    /// Describe the environment rooted at `root` without touching disk.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let interpreter = interpreter_path(&root);
        Self { root, interpreter }
    }

    /// Environment root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The environment's private interpreter.
    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    /// Whether the interpreter binary is present.
    pub fn is_ready(&self) -> bool {
        self.interpreter.exists()
    }
}

#[cfg(windows)]
fn interpreter_path(root: &Path) -> PathBuf {
    root.join("Scripts").join("python.exe")
}

#[cfg(not(windows))]
fn interpreter_path(root: &Path) -> PathBuf {
    root.join("bin").join("python")
}

/// Packages to install into an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Requirements {
    /// Nothing beyond the package manager itself
    #[default]
    None,
    /// Requirement specifiers, one per line of a generated requirements file
    List(Vec<String>),
    /// An existing requirements file
    File(PathBuf),
}

impl Requirements {
    /// The requirements implied by a configuration.
    pub fn from_config(config: &ShellConfig) -> Self {
        if !config.requirements.is_empty() {
            Requirements::List(config.requirements.clone())
        } else if let Some(file) = &config.requirements_file {
            Requirements::File(file.clone())
        } else {
            Requirements::None
        }
    }

    /// Returns true if nothing would be installed.
    pub fn is_empty(&self) -> bool {
        match self {
            Requirements::None => true,
            Requirements::List(list) => list.iter().all(|r| r.trim().is_empty()),
            Requirements::File(_) => false,
        }
    }
}

/// Creates environments and installs packages into them.
#[async_trait]
pub trait EnvironmentBuilder: Send + Sync {
    /// Materialise an environment at `root` from the `base` interpreter.
    ///
    /// Generated files such as requirement lists go in `scratch_dir`, never
    /// inside `root`. Fails with [`ShellError::EnvironmentCreationFailed`]
    /// when any setup step exits unsuccessfully. Cleaning up `root` is left
    /// to the caller.
    async fn build(
        &self,
        base: &Path,
        root: &Path,
        scratch_dir: &Path,
        requirements: &Requirements,
    ) -> Result<Environment>;

    /// Install a requirements file into an existing environment.
    ///
    /// Fails with [`ShellError::InstallRequireFailed`] when the package
    /// manager exits unsuccessfully.
    async fn install(&self, env: &Environment, requirements_file: &Path) -> Result<()>;
}

/// Builds environments with `virtualenv` (or `venv`) and `pip`.
#[derive(Debug, Clone)]
pub struct VirtualenvBuilder {
    isolation_module: String,
    defaults: Requirements,
}

impl Default for VirtualenvBuilder {
    fn default() -> Self {
        Self {
            isolation_module: crate::config::DEFAULT_ISOLATION_MODULE.to_string(),
            defaults: Requirements::None,
        }
    }
}

impl VirtualenvBuilder {
    /// Create a builder using `virtualenv` and no default requirements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from the isolation module and default requirements in `config`.
    pub fn from_config(config: &ShellConfig) -> Self {
        Self {
            isolation_module: config.isolation_module.clone(),
            defaults: Requirements::from_config(config),
        }
    }

    /// Use a different isolation module, e.g. `venv`.
    pub fn isolation_module(mut self, module: impl Into<String>) -> Self {
        self.isolation_module = module.into();
        self
    }

    /// Requirements installed when a build asks for none.
    pub fn default_requirements(mut self, requirements: Requirements) -> Self {
        self.defaults = requirements;
        self
    }

    async fn pip_install(
        &self,
        env: &Environment,
        scratch_dir: &Path,
        requirements: &Requirements,
    ) -> Result<()> {
        let requirements = if requirements.is_empty() {
            &self.defaults
        } else {
            requirements
        };

        if requirements.is_empty() {
            return Ok(());
        }
        match requirements {
            Requirements::None => Ok(()),
            Requirements::List(list) => {
                let file = ScratchFile::create(scratch_dir, "txt", &list.join("\n"))?;
                self.install(env, file.path()).await
            }
            Requirements::File(path) => self.install(env, path).await,
        }
    }
}

#[async_trait]
impl EnvironmentBuilder for VirtualenvBuilder {
    async fn build(
        &self,
        base: &Path,
        root: &Path,
        scratch_dir: &Path,
        requirements: &Requirements,
    ) -> Result<Environment> {
        let creation_failed = |reason: String| ShellError::EnvironmentCreationFailed {
            path: root.to_path_buf(),
            reason,
        };

        tokio::fs::create_dir_all(root).await?;

        tracing::info!(
            "Creating environment at {} with {} -m {}",
            root.display(),
            base.display(),
            self.isolation_module
        );
        let output = run_setup(
            base,
            &[
                OsStr::new("-m"),
                OsStr::new(&self.isolation_module),
                root.as_os_str(),
            ],
        )
        .await?;
        if !output.status.success() {
            return Err(creation_failed(output.failure_reason()));
        }

        let env = Environment::at(root);
        if !env.is_ready() {
            return Err(creation_failed(format!(
                "interpreter missing after isolation step: {}",
                env.interpreter().display()
            )));
        }

        let output = run_setup(
            env.interpreter(),
            &[
                OsStr::new("-m"),
                OsStr::new("pip"),
                OsStr::new("install"),
                OsStr::new("pip"),
                OsStr::new("--upgrade"),
            ],
        )
        .await?;
        if !output.status.success() {
            return Err(creation_failed(output.failure_reason()));
        }

        self.pip_install(&env, scratch_dir, requirements)
            .await
            .map_err(|e| match e {
                ShellError::InstallRequireFailed(reason) => creation_failed(reason),
                other => other,
            })?;

        tracing::info!("Environment ready at {}", root.display());
        Ok(env)
    }

    async fn install(&self, env: &Environment, requirements_file: &Path) -> Result<()> {
        if !requirements_file.is_file() {
            return Err(ShellError::FileNotFound(requirements_file.to_path_buf()));
        }

        tracing::info!(
            "Installing requirements from {} into {}",
            requirements_file.display(),
            env.root().display()
        );
        let output = run_setup(
            env.interpreter(),
            &[
                OsStr::new("-m"),
                OsStr::new("pip"),
                OsStr::new("install"),
                OsStr::new("-r"),
                requirements_file.as_os_str(),
            ],
        )
        .await?;
        if !output.status.success() {
            return Err(ShellError::InstallRequireFailed(output.failure_reason()));
        }
        // pip reports notices such as outdated versions on stderr
        if !output.stderr.trim().is_empty() {
            tracing::warn!("pip install into {}: {}", env.root().display(), output.stderr.trim());
        }
        Ok(())
    }
}

/// Result of a setup command.
#[derive(Debug)]
struct SetupOutput {
    status: ExitStatus,
    stderr: String,
}

impl SetupOutput {
    fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.status.to_string()
        } else {
            format!("{}: {}", self.status, stderr)
        }
    }
}

async fn run_setup(program: &Path, args: &[&OsStr]) -> Result<SetupOutput> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| ShellError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        tracing::debug!("[{}] {}", program.display(), line);
    }

    Ok(SetupOutput {
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
