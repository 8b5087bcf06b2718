//! Access hints applied to fresh or reused mappings.
//!
//! Hints only affect performance. A failed `madvise` is logged and ignored.

use log::warn;

use crate::platform::Capabilities;
use crate::utils::{align_down, page_size};

/// Page stride used when touching a normal mapping.
pub(crate) const SMALL_PAGE: usize = 4096;
/// Page stride used when touching a huge-page mapping, and the default
/// size above which huge pages are attempted.
pub(crate) const HUGE_PAGE: usize = 16 * 1024 * 1024;

/// Expected access pattern for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapHint {
    /// Random access pattern.
    #[default]
    Random,
    /// Sequential access pattern.
    Sequential,
    /// The whole range will be needed soon.
    WillNeed,
    /// Fault every page in now rather than on first access.
    Populate,
}

impl MapHint {
    fn advice(self) -> libc::c_int {
        match self {
            MapHint::Random => libc::MADV_RANDOM,
            MapHint::Sequential => libc::MADV_SEQUENTIAL,
            MapHint::WillNeed | MapHint::Populate => libc::MADV_WILLNEED,
        }
    }
}

/// Apply `hint` to a mapped region.
///
/// When the platform cannot populate at map time, `Populate` reads one byte
/// per page (plus the last byte) so the OS faults everything in now.
pub(crate) fn apply_hint(region: &[u8], hint: MapHint, uses_hugepages: bool, caps: &Capabilities) {
    if region.is_empty() {
        return;
    }

    // madvise wants a page-aligned start; windows at odd offsets are not.
    let addr = region.as_ptr() as usize;
    let start = align_down(addr, page_size());
    let length = region.len() + (addr - start);

    // SAFETY: [start, start + length) lies within pages owned by the mapping
    // backing `region`, and madvise does not change its contents.
    let rc = unsafe { libc::madvise(start as *mut libc::c_void, length, hint.advice()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        warn!("madvise({hint:?}) on {length} bytes at {start:#x} failed: {err}");
    }

    if hint == MapHint::Populate && !caps.map_populate {
        std::hint::black_box(populate_by_touch(region, uses_hugepages));
    }
}

/// Read one byte per page and the final byte, returning their xor.
pub(crate) fn populate_by_touch(region: &[u8], uses_hugepages: bool) -> u8 {
    let stride = if uses_hugepages { HUGE_PAGE } else { SMALL_PAGE };
    let mut acc = 0u8;
    for i in (0..region.len()).step_by(stride) {
        // SAFETY: i < region.len(); volatile so the read is not elided.
        acc ^= unsafe { std::ptr::read_volatile(region.as_ptr().add(i)) };
    }
    if let Some(last) = region.last() {
        // SAFETY: reference into the region.
        acc ^= unsafe { std::ptr::read_volatile(last) };
    }
    acc
}
