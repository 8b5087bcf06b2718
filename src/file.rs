//! Open files, their whole-file mapping, and their windowed mappings.

use std::fmt;
use std::fs::{File, Metadata};
use std::ops::Deref;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use parking_lot::Mutex;

use crate::advise::{apply_hint, MapHint};
use crate::errors::{MmapCacheError, Result};
use crate::path::CanonicalPath;
use crate::platform::Capabilities;
use crate::region::{MappingRecord, RegionTable};
use crate::registry::{RegistryConfig, RegistryShared};
use crate::utils::{ensure_in_bounds, to_map_len};

// Error message constants
const ERR_ZERO_LENGTH_FILE: &str = "cannot map zero-length file";
const ERR_ZERO_LENGTH_WINDOW: &str = "cannot map zero-length window";
const ERR_CLOSED: &str = "file handle already destroyed";

/// Stat snapshot taken when a file is opened.
///
/// A cached handle is reused only while a fresh snapshot of its path is
/// equal to this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Device id.
    pub device: u64,
    /// Inode number.
    pub inode: u64,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub modified_time: i64,
    /// Nanosecond part of the modification time.
    pub modified_time_nsec: i64,
}

impl FileIdentity {
    pub(crate) fn from_metadata(meta: &Metadata) -> Self {
        Self {
            device: meta.dev(),
            inode: meta.ino(),
            size: meta.size(),
            modified_time: meta.mtime(),
            modified_time_nsec: meta.mtime_nsec(),
        }
    }
}

pub(crate) struct FileInner {
    pub(crate) path: CanonicalPath,
    pub(crate) identity: FileIdentity,
    pub(crate) shared: bool,
    caps: Capabilities,
    config: RegistryConfig,
    pub(crate) state: Mutex<FileState>,
}

pub(crate) struct FileState {
    file: Option<File>,
    pub(crate) open_refcount: usize,
    pub(crate) whole: Option<MappingRecord>,
    pub(crate) windows: RegionTable,
}

impl FileInner {
    pub(crate) fn new(
        path: CanonicalPath,
        file: File,
        identity: FileIdentity,
        shared: bool,
        caps: Capabilities,
        config: RegistryConfig,
    ) -> Self {
        Self {
            path,
            identity,
            shared,
            caps,
            config,
            state: Mutex::new(FileState {
                file: Some(file),
                open_refcount: 1,
                whole: None,
                windows: RegionTable::default(),
            }),
        }
    }

    /// Unmap everything and close the descriptor.
    fn destroy(&self) {
        let mut st = self.state.lock();
        let whole = st.whole.take();
        st.windows.clear();
        let file = st.file.take();
        drop(st);
        drop(whole);
        drop(file);
        debug!("closed {}", self.path);
    }

    fn wants_huge(&self, length: u64) -> bool {
        self.config.huge_pages && length > self.config.huge_page_threshold
    }
}

/// Counted reference to an open, cached file.
///
/// Cloning increments the file's open count; dropping (or [`FileHandle::close`])
/// decrements it. When the count reaches zero the file leaves the registry,
/// every mapping is unmapped and the descriptor is closed.
pub struct FileHandle {
    inner: Arc<FileInner>,
    registry: Arc<RegistryShared>,
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.inner.path)
            .field("size", &self.inner.identity.size)
            .field("shared", &self.inner.shared)
            .finish()
    }
}

impl Clone for FileHandle {
    fn clone(&self) -> Self {
        self.inner.state.lock().open_refcount += 1;
        Self {
            inner: Arc::clone(&self.inner),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let last = {
            let mut st = self.inner.state.lock();
            st.open_refcount = st.open_refcount.saturating_sub(1);
            st.open_refcount == 0
        };
        if !last {
            return;
        }
        // File lock is released before the registry lock is taken.
        let evicted = self.registry.forget(&self.inner);
        self.inner.destroy();
        drop(evicted);
    }
}

impl FileHandle {
    /// Wrap an inner whose open count already accounts for this handle.
    pub(crate) fn adopt(inner: Arc<FileInner>, registry: Arc<RegistryShared>) -> Self {
        Self { inner, registry }
    }

    /// Close this reference. Same as dropping it.
    pub fn close(self) {}

    /// Size of the file when it was opened.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.identity.size
    }

    /// Modification time when the file was opened.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn modified_time(&self) -> SystemTime {
        let id = &self.inner.identity;
        let nanos = Duration::from_nanos(id.modified_time_nsec.max(0) as u64);
        if id.modified_time >= 0 {
            UNIX_EPOCH + Duration::from_secs(id.modified_time as u64) + nanos
        } else {
            UNIX_EPOCH - Duration::from_secs(id.modified_time.unsigned_abs()) + nanos
        }
    }

    /// Nanosecond part of the modification time.
    #[must_use]
    pub fn modified_time_nsec(&self) -> i64 {
        self.inner.identity.modified_time_nsec
    }

    /// Canonical path the file was opened under.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path.as_path()
    }

    /// Stat snapshot taken at open time.
    #[must_use]
    pub fn identity(&self) -> FileIdentity {
        self.inner.identity
    }

    /// Whether the file is a POSIX shared memory object.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.inner.shared
    }

    /// Whether both handles refer to the same cached file.
    #[must_use]
    pub fn same_file(&self, other: &FileHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of open references to this file.
    #[must_use]
    pub fn open_refcount(&self) -> usize {
        self.inner.state.lock().open_refcount
    }

    /// Map the whole file read-only.
    ///
    /// While any whole-file [`Mapping`] is alive, every call returns a guard
    /// over the same address.
    ///
    /// # Errors
    ///
    /// Returns `MmapCacheError::InvalidArgument` for a zero-length file and
    /// `MmapCacheError::MapFailed` if the OS refuses the mapping.
    pub fn map_all(&self, hint: MapHint) -> Result<Mapping> {
        let size = self.inner.identity.size;
        if size == 0 {
            return Err(MmapCacheError::InvalidArgument(ERR_ZERO_LENGTH_FILE));
        }
        let len = to_map_len(size)?;
        self.arm_safety();

        let (address, uses_hugepages) = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            match st.whole.as_mut() {
                Some(rec) => {
                    rec.refcount += 1;
                    (rec.address(), rec.uses_hugepages)
                }
                None => {
                    let file = st.file.as_ref().ok_or(MmapCacheError::InvalidArgument(ERR_CLOSED))?;
                    let rec = MappingRecord::map(
                        file,
                        0,
                        len,
                        hint == MapHint::Populate,
                        self.inner.wants_huge(size),
                        &self.inner.caps,
                    )?;
                    let found = (rec.address(), rec.uses_hugepages);
                    debug!("mapped {} whole ({len} bytes) at {:#x}", self.inner.path, found.0);
                    st.whole = Some(rec);
                    found
                }
            }
        };

        Ok(self.guard(address, len, hint, uses_hugepages))
    }

    /// Map `length` bytes starting at `offset`, read-only.
    ///
    /// Requests for the same window share one mapping. A window covering
    /// the whole file is the whole-file mapping.
    ///
    /// # Errors
    ///
    /// Returns `MmapCacheError::OutOfRange` if the window exceeds the file,
    /// `MmapCacheError::InvalidArgument` for an empty window, and
    /// `MmapCacheError::MapFailed` if the OS refuses the mapping. On error
    /// the window table is unchanged.
    pub fn map_window(&self, hint: MapHint, offset: u64, length: u64) -> Result<Mapping> {
        let size = self.inner.identity.size;
        ensure_in_bounds(offset, length, size)?;
        if offset == 0 && length == size {
            return self.map_all(hint);
        }
        if length == 0 {
            return Err(MmapCacheError::InvalidArgument(ERR_ZERO_LENGTH_WINDOW));
        }
        let len = to_map_len(length)?;
        self.arm_safety();

        let (address, uses_hugepages) = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            if let Some(rec) = st.windows.get_mut((offset, len)) {
                rec.refcount += 1;
                (rec.address(), rec.uses_hugepages)
            } else {
                let file = st.file.as_ref().ok_or(MmapCacheError::InvalidArgument(ERR_CLOSED))?;
                let rec = MappingRecord::map(
                    file,
                    offset,
                    len,
                    hint == MapHint::Populate,
                    self.inner.wants_huge(length),
                    &self.inner.caps,
                )?;
                let huge = rec.uses_hugepages;
                let addr = st.windows.insert(rec);
                debug!("mapped {} window offset={offset} len={len} at {addr:#x}", self.inner.path);
                (addr, huge)
            }
        };

        Ok(self.guard(address, len, hint, uses_hugepages))
    }

    /// Release a mapping. Same as dropping it.
    pub fn unmap(&self, mapping: Mapping) {
        drop(mapping);
    }

    /// Whether a fault was recorded for the mapping at `address`.
    ///
    /// Unknown addresses report `false`.
    #[must_use]
    pub fn is_faulty(&self, address: usize) -> bool {
        let st = self.inner.state.lock();
        match st.whole.as_ref() {
            Some(rec) if rec.address() == address => rec.faulty,
            _ => st.windows.by_address(address).is_some_and(|rec| rec.faulty),
        }
    }

    /// Outstanding map calls on the mapping at `address`, 0 if unknown.
    #[must_use]
    pub fn map_refcount(&self, address: usize) -> usize {
        let st = self.inner.state.lock();
        match st.whole.as_ref() {
            Some(rec) if rec.address() == address => rec.refcount,
            _ => st.windows.by_address(address).map_or(0, |rec| rec.refcount),
        }
    }

    /// Number of distinct windowed mappings currently alive.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.inner.state.lock().windows.len()
    }

    /// Whether a whole-file mapping is currently alive.
    #[must_use]
    pub fn is_mapped_whole(&self) -> bool {
        self.inner.state.lock().whole.is_some()
    }

    fn guard(&self, address: usize, len: usize, hint: MapHint, uses_hugepages: bool) -> Mapping {
        let mapping = Mapping {
            file: self.clone(),
            address,
            len,
        };
        // Outside the file lock: populating may fault.
        apply_hint(mapping.as_slice(), hint, uses_hugepages, &self.inner.caps);
        mapping
    }

    fn arm_safety(&self) {
        #[cfg(feature = "safety")]
        {
            if self.inner.config.mmap_safety {
                if let Err(err) = crate::safety::enable() {
                    log::warn!("could not enable mmap safety: {err}");
                }
            }
        }
    }

    /// Drop one map reference on `address`, unmapping at zero.
    fn release(&self, address: usize) {
        let unmapped = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            match st.whole.as_mut() {
                Some(rec) if rec.address() == address => {
                    rec.refcount -= 1;
                    if rec.refcount == 0 {
                        st.whole.take()
                    } else {
                        None
                    }
                }
                _ => match st.windows.by_address_mut(address) {
                    Some(rec) => {
                        rec.refcount -= 1;
                        if rec.refcount == 0 {
                            st.windows.remove(address)
                        } else {
                            None
                        }
                    }
                    None => None,
                },
            }
        };
        if let Some(rec) = unmapped {
            debug!(
                "unmapping {} offset={} len={} at {address:#x}",
                self.inner.path, rec.offset, rec.length
            );
        }
    }
}

/// A live reference to a read-only mapping.
///
/// Dereferences to the mapped bytes. Dropping it releases one reference on
/// the mapping; the memory is unmapped when the last reference goes. The
/// guard keeps its file open.
pub struct Mapping {
    file: FileHandle,
    address: usize,
    len: usize,
}

impl Mapping {
    /// Address of the first mapped byte.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty. Mappings never are.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: this guard holds a map reference, so the region at
        // `address` stays mapped for at least as long as `self`.
        unsafe { std::slice::from_raw_parts(self.address as *const u8, self.len) }
    }

    /// Whether a fault was recorded on this mapping.
    #[must_use]
    pub fn is_faulty(&self) -> bool {
        self.file.is_faulty(self.address)
    }
}

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Mapping {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("path", &self.file.path())
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        self.file.release(self.address);
    }
}
