//! Locating the base interpreter.
//!
//! Downloading or installing an interpreter is outside this crate. The session
//! only needs something that can answer "where is a usable interpreter", which
//! is the [`InterpreterBootstrap`] contract.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Result, ShellError};

/// Provides the interpreter that environments are built from.
#[async_trait]
pub trait InterpreterBootstrap: Send + Sync {
    /// Return the path of an interpreter with package-manager support.
    async fn ensure_base_interpreter(&self) -> Result<PathBuf>;
}

/// Uses an interpreter that is already installed on the host.
#[derive(Debug, Clone)]
pub struct SystemInterpreter {
    program: PathBuf,
}

impl SystemInterpreter {
    /// `program` may be a path or a bare name such as `python3`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Resolve the configured program to an existing file.
    ///
    /// Bare names are searched on `PATH`, then in `/usr/bin`.
    pub fn resolve(&self) -> Result<PathBuf> {
        if is_bare_name(&self.program) {
            let from_path = std::env::var_os("PATH")
                .map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
                .unwrap_or_default()
                .into_iter()
                .map(|dir| dir.join(&self.program))
                .find(|candidate| candidate.is_file());
            if let Some(found) = from_path {
                return Ok(found);
            }
            let fallback = Path::new("/usr/bin").join(&self.program);
            if fallback.is_file() {
                return Ok(fallback);
            }
            return Err(ShellError::InterpreterNotFound(self.program.clone()));
        }

        if self.program.is_file() {
            Ok(self.program.clone())
        } else {
            Err(ShellError::InterpreterNotFound(self.program.clone()))
        }
    }
}

#[async_trait]
impl InterpreterBootstrap for SystemInterpreter {
    async fn ensure_base_interpreter(&self) -> Result<PathBuf> {
        let path = self.resolve()?;
        tracing::debug!("Using base interpreter {}", path.display());
        Ok(path)
    }
}

fn is_bare_name(program: &Path) -> bool {
    program.components().count() == 1 && !program.is_absolute()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_detection() {
        assert!(is_bare_name(Path::new("python3")));
        assert!(!is_bare_name(Path::new("/usr/bin/python3")));
        assert!(!is_bare_name(Path::new("bin/python")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_absolute_path_must_exist() {
        let found = SystemInterpreter::new("/bin/sh")
            .ensure_base_interpreter()
            .await
            .unwrap();
        assert_eq!(found, PathBuf::from("/bin/sh"));

        let err = SystemInterpreter::new("/no/such/python")
            .ensure_base_interpreter()
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::InterpreterNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_bare_name_resolves_on_path() {
        let found = SystemInterpreter::new("sh").resolve().unwrap();
        assert!(found.is_absolute());
        assert!(found.ends_with("sh"));
    }

    #[test]
    fn test_unknown_bare_name() {
        let err = SystemInterpreter::new("pyshell-no-such-interpreter")
            .resolve()
            .unwrap_err();
        assert!(matches!(err, ShellError::InterpreterNotFound(_)));
    }
}
