//! Mapping records and the per-file table of windowed mappings.
//!
//! The forward index dedups requests by `(offset, length)`. The reverse index
//! is ordered by mapped address so both exact lookups (unmap, fault queries)
//! and containment lookups (fault propagation) are logarithmic.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;

use log::debug;
use memmap2::{Mmap, MmapOptions};

use crate::errors::{MmapCacheError, Result};
use crate::platform::Capabilities;
use crate::utils::align_down;

/// Key of a windowed mapping.
pub(crate) type WindowKey = (u64, usize);

/// Memory backing one mapping. Dropping it unmaps.
pub(crate) enum Backing {
    Standard(Mmap),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Huge(huge::HugeMap),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Standard(m) => m,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backing::Huge(m) => m.as_slice(),
        }
    }
}

/// One distinct mapped region and its bookkeeping.
pub(crate) struct MappingRecord {
    backing: Backing,
    pub(crate) offset: u64,
    pub(crate) length: usize,
    pub(crate) refcount: usize,
    pub(crate) uses_hugepages: bool,
    pub(crate) faulty: bool,
}

impl MappingRecord {
    /// Map `length` bytes of `file` at `offset`, read-only and shared.
    ///
    /// A huge-page mapping is tried first when `want_huge` is set and the
    /// platform allows it; on refusal a normal mapping is made.
    pub(crate) fn map(
        file: &File,
        offset: u64,
        length: usize,
        populate: bool,
        want_huge: bool,
        caps: &Capabilities,
    ) -> Result<Self> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if want_huge && caps.huge_pages {
                match huge::HugeMap::map(file, offset, length, populate && caps.map_populate) {
                    Ok(m) => return Ok(Self::new(Backing::Huge(m), offset, length, true)),
                    Err(err) => {
                        debug!("huge page mapping of {length} bytes refused ({err}), using normal pages");
                    }
                }
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = want_huge;

        let mut opts = MmapOptions::new();
        opts.offset(offset).len(length);
        if populate && caps.map_populate {
            opts.populate();
        }
        // SAFETY: the mapping is read-only. Truncation by another process can
        // still fault; that case is what the fault tracking exists for.
        let map = unsafe { opts.map(file) }
            .map_err(|e| MmapCacheError::MapFailed(format!("offset={offset}, len={length}: {e}")))?;
        Ok(Self::new(Backing::Standard(map), offset, length, false))
    }

    fn new(backing: Backing, offset: u64, length: usize, uses_hugepages: bool) -> Self {
        Self {
            backing,
            offset,
            length,
            refcount: 1,
            uses_hugepages,
            faulty: false,
        }
    }

    /// Address of the first mapped byte.
    pub(crate) fn address(&self) -> usize {
        self.as_slice().as_ptr() as usize
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        self.backing.as_slice()
    }

    /// Whether `addr` falls in a page occupied by this mapping.
    pub(crate) fn covers(&self, addr: usize, page_size: usize) -> bool {
        let start = self.address();
        align_down(start, page_size) <= addr && addr < start + self.length
    }
}

/// Windowed mappings of one file, indexed by key and by address.
#[derive(Default)]
pub(crate) struct RegionTable {
    forward: HashMap<WindowKey, MappingRecord>,
    reverse: BTreeMap<usize, WindowKey>,
}

impl RegionTable {
    pub(crate) fn get_mut(&mut self, key: WindowKey) -> Option<&mut MappingRecord> {
        self.forward.get_mut(&key)
    }

    /// Insert a fresh record into both indices and return its address.
    pub(crate) fn insert(&mut self, record: MappingRecord) -> usize {
        let addr = record.address();
        let key = (record.offset, record.length);
        self.reverse.insert(addr, key);
        self.forward.insert(key, record);
        addr
    }

    pub(crate) fn by_address(&self, addr: usize) -> Option<&MappingRecord> {
        let key = self.reverse.get(&addr)?;
        self.forward.get(key)
    }

    pub(crate) fn by_address_mut(&mut self, addr: usize) -> Option<&mut MappingRecord> {
        let key = self.reverse.get(&addr)?;
        self.forward.get_mut(key)
    }

    /// Remove the record mapped at `addr` from both indices.
    pub(crate) fn remove(&mut self, addr: usize) -> Option<MappingRecord> {
        let key = self.reverse.remove(&addr)?;
        self.forward.remove(&key)
    }

    /// The record whose pages contain `addr`, if any. Does not allocate.
    pub(crate) fn containing_mut(&mut self, addr: usize, page_size: usize) -> Option<&mut MappingRecord> {
        let page_end = align_down(addr, page_size).saturating_add(page_size);
        let (_, key) = self.reverse.range(..page_end).next_back()?;
        let record = self.forward.get_mut(key)?;
        record.covers(addr, page_size).then_some(record)
    }

    pub(crate) fn len(&self) -> usize {
        self.forward.len()
    }

    /// Drop every record, unmapping them.
    pub(crate) fn clear(&mut self) {
        self.reverse.clear();
        self.forward.clear();
    }
}

impl Drop for RegionTable {
    fn drop(&mut self) {
        if !self.forward.is_empty() {
            debug!("unmapping {} window(s) of a closed file", self.forward.len());
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod huge {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::ptr::NonNull;

    use crate::utils::page_size;

    /// Raw `MAP_HUGETLB` file mapping. memmap2 only exposes huge pages for
    /// anonymous maps.
    pub(crate) struct HugeMap {
        ptr: NonNull<u8>,
        len: usize,
    }

    // SAFETY: the mapping is read-only and owned exclusively by this value.
    unsafe impl Send for HugeMap {}
    // SAFETY: shared access only reads.
    unsafe impl Sync for HugeMap {}

    impl HugeMap {
        pub(crate) fn map(file: &File, offset: u64, len: usize, populate: bool) -> io::Result<Self> {
            if len == 0 || offset % page_size() as u64 != 0 {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            let offset = libc::off_t::try_from(offset)
                .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
            let mut flags = libc::MAP_SHARED | libc::MAP_HUGETLB;
            if populate {
                flags |= libc::MAP_POPULATE;
            }
            // SAFETY: fresh read-only mapping of a descriptor we hold; the
            // kernel picks the address.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ,
                    flags,
                    file.as_raw_fd(),
                    offset,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            NonNull::new(ptr.cast::<u8>())
                .map(|ptr| Self { ptr, len })
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
        }

        pub(crate) fn as_slice(&self) -> &[u8] {
            // SAFETY: ptr/len describe a live PROT_READ mapping owned by self.
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
        }
    }

    impl Drop for HugeMap {
        fn drop(&mut self) {
            // SAFETY: unmapping exactly the region created in `map`.
            unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), self.len);
            }
        }
    }
}
