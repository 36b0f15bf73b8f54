//! Session configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShellError};

/// Name of the shared instance that bulk operations never delete.
pub const DEFAULT_INSTANCE: &str = "default";

/// Isolation tool used when none is configured.
pub const DEFAULT_ISOLATION_MODULE: &str = "virtualenv";

/// Configuration for a [`ShellSession`](crate::ShellSession) and its
/// [`InstanceStore`](crate::InstanceStore).
///
/// Every path the session touches is derived from `app_dir`:
///
/// ```text
/// <app_dir>/temp/                    - scratch files for shared runs
/// <app_dir>/instances/<name>/env/    - isolated interpreter
/// <app_dir>/instances/<name>/temp/   - scratch files for instance runs
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Root directory owned by the session
    pub app_dir: PathBuf,
    /// Interpreter used to build environments (bare names are looked up on `PATH`)
    pub base_interpreter: PathBuf,
    /// Module passed to `<base> -m` to create an environment
    pub isolation_module: String,
    /// Requirements installed into every newly built environment
    pub requirements: Vec<String>,
    /// Requirements file installed when `requirements` is empty
    pub requirements_file: Option<PathBuf>,
    /// Working directory used when a run does not name one
    pub default_working_dir: Option<PathBuf>,
    /// Whether `initialize` builds the default instance
    pub create_default_env: bool,
    /// Whether script output is echoed to stdout unless a run overrides it
    pub echo: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            app_dir: home.join(".pyshell"),
            base_interpreter: PathBuf::from("python3"),
            isolation_module: DEFAULT_ISOLATION_MODULE.to_string(),
            requirements: Vec::new(),
            requirements_file: None,
            default_working_dir: None,
            create_default_env: true,
            echo: true,
        }
    }
}

impl ShellConfig {
    /// Default configuration rooted at `app_dir`.
    pub fn with_app_dir(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ShellError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ShellError::FileNotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check the values that would otherwise fail late.
    pub fn validate(&self) -> Result<()> {
        if self.app_dir.as_os_str().is_empty() {
            return Err(ShellError::Config("app_dir must not be empty".to_string()));
        }
        if self.base_interpreter.as_os_str().is_empty() {
            return Err(ShellError::Config(
                "base_interpreter must not be empty".to_string(),
            ));
        }
        if self.isolation_module.trim().is_empty() {
            return Err(ShellError::Config(
                "isolation_module must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Scratch directory for shared runs.
    pub fn temp_dir(&self) -> PathBuf {
        self.app_dir.join("temp")
    }

    /// Directory holding one subdirectory per instance.
    pub fn instances_dir(&self) -> PathBuf {
        self.app_dir.join("instances")
    }
}
