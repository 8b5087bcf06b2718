//! Process-wide registry and convenience functions over it.
//!
//! Most programs want one cache for the whole process. The functions here
//! open through a lazily created global [`Registry`] with default settings.

use std::path::Path;
use std::sync::OnceLock;

use crate::dir::{self, DirEntryStat};
use crate::errors::Result;
use crate::file::FileHandle;
use crate::registry::Registry;

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// The global registry, created on first use.
pub fn registry() -> &'static Registry {
    GLOBAL.get_or_init(Registry::new)
}

/// Open `path` through the global registry.
///
/// # Errors
///
/// Returns errors from [`Registry::open`].
pub fn open<P: AsRef<Path>>(path: P, shared: bool) -> Result<FileHandle> {
    registry().open(path, shared)
}

/// Check the global registry for files still open.
///
/// # Errors
///
/// Returns `MmapCacheError::Leaked` if any file is still open.
pub fn shutdown() -> Result<()> {
    match GLOBAL.get() {
        Some(reg) => reg.shutdown(),
        None => Ok(()),
    }
}

/// Collect the typed, stat'ed entries of `dir` into a vector.
///
/// # Errors
///
/// Returns errors from [`dir::list_stat`].
pub fn read_dir_stat<P: AsRef<Path>>(dir: P) -> Result<Vec<DirEntryStat>> {
    Ok(dir::list_stat(dir)?.collect())
}

#[cfg(feature = "async")]
pub mod r#async {
    //! Async helpers (Tokio) that run blocking opens and directory scans on
    //! the blocking pool instead of the current task.
    use std::path::Path;

    use tokio::task;

    use crate::dir::DirEntryStat;
    use crate::errors::{MmapCacheError, Result};
    use crate::file::FileHandle;

    fn joined(err: task::JoinError) -> MmapCacheError {
        MmapCacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    }

    /// Open `path` through the global registry without blocking the runtime.
    ///
    /// # Errors
    ///
    /// Returns errors from [`crate::Registry::open`], or `Io` if the blocking
    /// task panicked.
    pub async fn open_async<P: AsRef<Path>>(path: P, shared: bool) -> Result<FileHandle> {
        let path = path.as_ref().to_path_buf();
        task::spawn_blocking(move || super::open(path, shared))
            .await
            .map_err(joined)?
    }

    /// List `dir` with stat info without blocking the runtime.
    ///
    /// # Errors
    ///
    /// Returns errors from [`crate::dir::list_stat`], or `Io` if the
    /// blocking task panicked.
    pub async fn list_stat_async<P: AsRef<Path>>(dir: P) -> Result<Vec<DirEntryStat>> {
        let dir = dir.as_ref().to_path_buf();
        task::spawn_blocking(move || super::read_dir_stat(dir))
            .await
            .map_err(joined)?
    }
}
