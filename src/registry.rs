//! Process-wide cache of open files keyed by canonical path.
//!
//! Lock order is always registry table first, then a file's own lock.
//! Nothing here holds the table lock across `open`/`fstat`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::Mutex;

use crate::advise::HUGE_PAGE;
use crate::errors::{MmapCacheError, Result};
use crate::file::{FileHandle, FileIdentity, FileInner};
use crate::path::{sanitize, CanonicalPath};
use crate::platform::Capabilities;

/// Tunables copied into every file opened through a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Try huge pages for mappings larger than `huge_page_threshold`.
    pub huge_pages: bool,
    /// Size in bytes above which huge pages are attempted.
    pub huge_page_threshold: u64,
    /// Install the SIGBUS trap on first mapping and let it record faults in
    /// this registry (feature `safety`).
    pub mmap_safety: bool,
    /// Platform facilities to use.
    pub capabilities: Capabilities,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            huge_pages: true,
            huge_page_threshold: HUGE_PAGE as u64,
            mmap_safety: cfg!(feature = "safety"),
            capabilities: Capabilities::detect(),
        }
    }
}

/// Builder for [`Registry`].
///
/// # Examples
///
/// ```no_run
/// use mmap_cache::Registry;
///
/// let registry = Registry::builder()
///     .huge_pages(true)
///     .huge_page_threshold(64 * 1024 * 1024)
///     .build();
/// let file = registry.open("/etc/hosts", false)?;
/// # Ok::<(), mmap_cache::MmapCacheError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    config: RegistryConfig,
}

impl RegistryBuilder {
    /// Enable or disable huge-page mappings.
    #[must_use]
    pub fn huge_pages(mut self, enabled: bool) -> Self {
        self.config.huge_pages = enabled;
        self
    }

    /// Mappings strictly larger than this many bytes try huge pages.
    #[must_use]
    pub fn huge_page_threshold(mut self, bytes: u64) -> Self {
        self.config.huge_page_threshold = bytes;
        self
    }

    /// Install the SIGBUS trap when mapping and absorb faults on this
    /// registry's mappings. Has no effect without the `safety` feature.
    #[must_use]
    pub fn mmap_safety(mut self, enabled: bool) -> Self {
        self.config.mmap_safety = enabled;
        self
    }

    /// Override detected platform capabilities.
    #[must_use]
    pub fn capabilities(mut self, caps: Capabilities) -> Self {
        self.config.capabilities = caps;
        self
    }

    /// Build the registry.
    #[must_use]
    pub fn build(self) -> Registry {
        let registry = Registry {
            shared: Arc::new(RegistryShared {
                config: self.config,
                files: Mutex::new(HashMap::new()),
            }),
        };
        #[cfg(feature = "safety")]
        {
            if registry.shared.config.mmap_safety {
                crate::safety::watch(&registry.shared);
            }
        }
        registry
    }
}

pub(crate) struct RegistryShared {
    config: RegistryConfig,
    pub(crate) files: Mutex<HashMap<CanonicalPath, Arc<FileInner>>>,
}

#[cfg(feature = "safety")]
impl Drop for RegistryShared {
    fn drop(&mut self) {
        crate::safety::unwatch(self);
    }
}

impl RegistryShared {
    /// Remove `inner` from the table if it is still the current entry for
    /// its path. A stale file already replaced by a fresh one is left alone.
    pub(crate) fn forget(&self, inner: &Arc<FileInner>) -> Option<Arc<FileInner>> {
        let mut files = self.files.lock();
        match files.get(&inner.path) {
            Some(current) if Arc::ptr_eq(current, inner) => files.remove(&inner.path),
            _ => None,
        }
    }
}

/// Cache of open files shared by every caller that opens the same path.
///
/// Cloning is cheap and yields another reference to the same cache.
///
/// # Examples
///
/// ```no_run
/// use mmap_cache::{MapHint, Registry};
///
/// let registry = Registry::new();
/// let a = registry.open("data.bin", false)?;
/// let b = registry.open("data.bin", false)?;
/// assert!(a.same_file(&b));
///
/// let m1 = a.map_window(MapHint::Random, 4096, 100)?;
/// let m2 = b.map_window(MapHint::Random, 4096, 100)?;
/// assert_eq!(m1.address(), m2.address());
/// # Ok::<(), mmap_cache::MmapCacheError>(())
/// ```
#[derive(Clone)]
pub struct Registry {
    pub(crate) shared: Arc<RegistryShared>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("open_files", &self.len())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        RegistryBuilder::default().build()
    }

    /// Start configuring a registry.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Configuration shared by files opened here.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Open `path` read-only, reusing the cached file if it is unchanged on disk.
    ///
    /// With `shared`, `path` names a POSIX shared memory object instead of a
    /// file. A cached entry whose stat snapshot no longer matches is replaced;
    /// existing holders keep the old file until they close it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty path, `NotFound` or
    /// `PermissionDenied` if the open fails for those reasons,
    /// `ResourceExhausted` when out of descriptors, and `NotSupported` for
    /// `shared` on platforms without shared memory objects. Nothing is
    /// registered on error.
    pub fn open<P: AsRef<Path>>(&self, path: P, shared: bool) -> Result<FileHandle> {
        let path = sanitize(path)?;
        let caps = self.shared.config.capabilities;

        let file = open_descriptor(&path, shared, &caps)?;
        let identity = file
            .metadata()
            .map(|m| FileIdentity::from_metadata(&m))
            .map_err(|e| MmapCacheError::from_io(e, path.as_path()))?;

        let mut files = self.shared.files.lock();
        if let Some(existing) = files.get(&path) {
            let mut st = existing.state.lock();
            // A zero count means the last holder is tearing it down.
            if st.open_refcount > 0 && existing.identity == identity && existing.shared == shared {
                st.open_refcount += 1;
                drop(st);
                let inner = Arc::clone(existing);
                drop(files);
                drop(file);
                debug!("cache hit for {path}");
                return Ok(FileHandle::adopt(inner, Arc::clone(&self.shared)));
            }
            debug!("evicting stale cache entry for {path}");
        } else {
            debug!("cache miss for {path}");
        }

        let inner = Arc::new(FileInner::new(
            path.clone(),
            file,
            identity,
            shared,
            caps,
            self.shared.config,
        ));
        let replaced = files.insert(path, Arc::clone(&inner));
        drop(files);
        drop(replaced);
        Ok(FileHandle::adopt(inner, Arc::clone(&self.shared)))
    }

    /// Number of files currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.files.lock().len()
    }

    /// Whether no file is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `path` currently has a cache entry.
    #[must_use]
    pub fn contains<P: AsRef<Path>>(&self, path: P) -> bool {
        match sanitize(path) {
            Ok(p) => self.shared.files.lock().contains_key(&p),
            Err(_) => false,
        }
    }

    // Sorted for stable shutdown reports.
    fn open_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .shared
            .files
            .lock()
            .keys()
            .map(|p| p.as_path().to_path_buf())
            .collect();
        paths.sort();
        paths
    }

    /// Check that every file has been closed.
    ///
    /// Files still open are caller leaks: each is logged and the call fails.
    /// Nothing is freed on their behalf.
    ///
    /// # Errors
    ///
    /// Returns `MmapCacheError::Leaked` listing the paths still open.
    pub fn shutdown(&self) -> Result<()> {
        let leaked = self.open_paths();
        if leaked.is_empty() {
            return Ok(());
        }
        for path in &leaked {
            error!("file {} still open at shutdown", path.display());
        }
        Err(MmapCacheError::Leaked(leaked))
    }
}

fn open_descriptor(path: &CanonicalPath, shared: bool, caps: &Capabilities) -> Result<File> {
    if shared {
        if !caps.shared_memory {
            return Err(MmapCacheError::NotSupported("shared memory objects"));
        }
        return shm::open_readonly(path.as_path());
    }
    OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| MmapCacheError::from_io(e, path.as_path()))
}

#[cfg(not(target_os = "android"))]
mod shm {
    use std::ffi::CString;
    use std::fs::File;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::io::FromRawFd;
    use std::path::Path;

    use crate::errors::{MmapCacheError, Result};

    pub(super) fn open_readonly(name: &Path) -> Result<File> {
        let c_name = CString::new(name.as_os_str().as_bytes())
            .map_err(|_| MmapCacheError::InvalidPath(name.display().to_string()))?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC, 0) };
        if fd < 0 {
            return Err(MmapCacheError::from_io(std::io::Error::last_os_error(), name));
        }
        // SAFETY: fd is a freshly opened descriptor owned by nobody else.
        Ok(unsafe { File::from_raw_fd(fd) })
    }
}

#[cfg(target_os = "android")]
mod shm {
    use std::fs::File;
    use std::path::Path;

    use crate::errors::{MmapCacheError, Result};

    pub(super) fn open_readonly(_name: &Path) -> Result<File> {
        Err(MmapCacheError::NotSupported("shared memory objects"))
    }
}
