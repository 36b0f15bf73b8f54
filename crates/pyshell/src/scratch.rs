//! Unique names and self-deleting scratch files.
//!
//! Every [`ScratchFile`] is recorded in a process-wide set while it is alive.
//! [`clear_dir`] leaves those files alone, so bulk cleanup never removes a
//! script that a run has yet to open, and each scratch file is deleted only by
//! its owner.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

static LIVE: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(Default::default);

fn live() -> MutexGuard<'static, HashSet<PathBuf>> {
    LIVE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A name that sorts by creation time and stays unique under concurrent calls.
///
/// Format: `<unix millis>-<pid>-<sequence>`.
pub(crate) fn unique_stamp() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{millis:013}-{}-{seq:06}", std::process::id())
}

/// A file that is removed when dropped.
#[derive(Debug)]
pub(crate) struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Write `contents` to a new uniquely named file in `dir`.
    pub(crate) fn create(dir: &Path, extension: &str, contents: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{extension}", unique_stamp()));
        // Registered before the file exists so a concurrent clear never sees it unprotected
        live().insert(path.clone());
        let file = Self { path };
        std::fs::write(&file.path, contents)?;
        Ok(file)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let mut live = live();
        live.remove(&self.path);
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed scratch file {}", self.path.display()),
            // The owning instance directory may already be gone
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove scratch file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Delete everything inside `dir` except live scratch files, creating `dir`
/// if it does not exist. Returns the number of live files kept.
pub(crate) fn clear_dir(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        std::fs::create_dir_all(dir)?;
        return Ok(0);
    }
    // Held for the whole sweep: no scratch file can be created or dropped meanwhile
    let live = live();
    let mut kept = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if live.contains(&path) {
            kept += 1;
            continue;
        }
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = removed
            && e.kind() != ErrorKind::NotFound
        {
            return Err(e.into());
        }
    }
    Ok(kept)
}
