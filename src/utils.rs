//! Utility helpers for page size, alignment, and range checks.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::{MmapCacheError, Result};

// Fallback used only if sysconf reports nonsense.
const DEFAULT_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Get the system page size in bytes.
///
/// The value is queried once and cached, so later calls are a single atomic
/// load and are safe to make from the fault path.
#[must_use]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let ps = unix_page_size();
    PAGE_SIZE.store(ps, Ordering::Relaxed);
    ps
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn unix_page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE is safe to call.
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps <= 0 {
        DEFAULT_PAGE_SIZE
    } else {
        ps as usize
    }
}

/// Align a value down to a multiple of `alignment`.
#[must_use]
pub fn align_down(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    if alignment.is_power_of_two() {
        value & !(alignment - 1)
    } else {
        value - value % alignment
    }
}

/// Ensure the requested [offset, offset+len) range is within [0, total).
///
/// # Errors
///
/// Returns `MmapCacheError::OutOfRange` if the range exceeds bounds.
pub fn ensure_in_bounds(offset: u64, len: u64, total: u64) -> Result<()> {
    if offset > total {
        return Err(MmapCacheError::OutOfRange { offset, len, total });
    }
    let end = offset.checked_add(len).ok_or(MmapCacheError::OutOfRange {
        offset,
        len,
        total,
    })?;
    if end > total {
        return Err(MmapCacheError::OutOfRange { offset, len, total });
    }
    Ok(())
}

/// Convert a file length to a mappable length.
///
/// # Errors
///
/// Returns `MmapCacheError::MapFailed` if the length does not fit the address space.
pub(crate) fn to_map_len(len: u64) -> Result<usize> {
    usize::try_from(len)
        .map_err(|_| MmapCacheError::MapFailed(format!("length {len} exceeds address space")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps >= 512);
        assert!(ps.is_power_of_two());
        assert_eq!(page_size(), ps);
    }

    #[test]
    fn alignment() {
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(4096, 4096), 4096);
        assert_eq!(align_down(10, 3), 9);
        assert_eq!(align_down(7, 0), 7);
    }

    #[test]
    fn bounds() {
        assert!(ensure_in_bounds(0, 10, 10).is_ok());
        assert!(ensure_in_bounds(10, 0, 10).is_ok());
        assert!(ensure_in_bounds(11, 0, 10).is_err());
        assert!(ensure_in_bounds(5, 6, 10).is_err());
        assert!(ensure_in_bounds(1, u64::MAX, 10).is_err());
    }
}
