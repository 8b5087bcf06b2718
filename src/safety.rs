//! SIGBUS trap for mapped files that shrink underneath their mappings.
//!
//! When enabled, a bus error on a page owned by a registry built with
//! `mmap_safety` is absorbed: the owning mapping is flagged faulty, a
//! zero-filled page replaces the unreadable one, and the faulting read
//! completes with zeros. Callers check [`crate::Mapping::is_faulty`] after
//! reading. Any other bus error, including one whose owner cannot be
//! determined in time, gets the default disposition and kills the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};

use crate::errors::{MmapCacheError, Result};
use crate::fault::FaultOutcome;
use crate::registry::RegistryShared;
use crate::utils::{align_down, page_size};

const MAX_WATCHED: usize = 64;
const CLAIM_WAIT: Duration = Duration::from_millis(10);

static INSTALLED: AtomicBool = AtomicBool::new(false);
static INSTALL_LOCK: Mutex<()> = const_mutex(());
// Addresses of live registries the handler may consult; 0 marks a free slot.
static WATCHED: RwLock<[usize; MAX_WATCHED]> = const_rwlock([0; MAX_WATCHED]);

/// Install the SIGBUS handler. Idempotent.
///
/// # Errors
///
/// Returns `MmapCacheError::Io` if `sigaction` fails.
pub fn enable() -> Result<()> {
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }
    let _guard = INSTALL_LOCK.lock();
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }
    // Resolve before any fault so the handler only reads a cached value.
    let _ = page_size();

    type Handler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);
    // SAFETY: a zeroed sigaction is a valid starting point; every field we
    // rely on is set below.
    let rc = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigbus as Handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut())
    };
    if rc != 0 {
        return Err(MmapCacheError::Io(std::io::Error::last_os_error()));
    }
    INSTALLED.store(true, Ordering::Release);
    debug!("SIGBUS trap installed");
    Ok(())
}

/// Restore the default SIGBUS disposition.
pub fn disable() {
    let _guard = INSTALL_LOCK.lock();
    if !INSTALLED.swap(false, Ordering::AcqRel) {
        return;
    }
    // SAFETY: resetting to SIG_DFL is always valid.
    unsafe {
        libc::signal(libc::SIGBUS, libc::SIG_DFL);
    }
    debug!("SIGBUS trap removed");
}

/// Whether the trap is currently installed.
#[must_use]
pub fn is_enabled() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

/// Let the handler search `shared` for faulting addresses.
///
/// `shared` must call [`unwatch`] before it is freed.
pub(crate) fn watch(shared: &RegistryShared) -> bool {
    let key = std::ptr::from_ref(shared) as usize;
    let mut slots = WATCHED.write();
    if slots.contains(&key) {
        return true;
    }
    match slots.iter_mut().find(|slot| **slot == 0) {
        Some(slot) => {
            *slot = key;
            true
        }
        None => {
            warn!("more than {MAX_WATCHED} registries with mmap safety; faults in this one will not be trapped");
            false
        }
    }
}

/// Stop searching `shared`. Waits for a handler currently reading the table.
pub(crate) fn unwatch(shared: &RegistryShared) {
    let key = std::ptr::from_ref(shared) as usize;
    let mut slots = WATCHED.write();
    for slot in slots.iter_mut().filter(|slot| **slot == key) {
        *slot = 0;
    }
}

/// Record a fault at `addr` in whichever watched registry owns it.
pub(crate) fn claim(addr: usize, page_size: usize) -> FaultOutcome {
    let Some(slots) = WATCHED.try_read_for(CLAIM_WAIT) else {
        return FaultOutcome::Contended;
    };
    let mut outcome = FaultOutcome::NotMapped;
    for &key in slots.iter().filter(|&&key| key != 0) {
        // SAFETY: registries unwatch themselves under the write lock before
        // they are freed, and the read lock is held here.
        let shared = unsafe { &*(key as *const RegistryShared) };
        match shared.on_fault(addr, page_size) {
            FaultOutcome::Marked => return FaultOutcome::Marked,
            FaultOutcome::Contended => outcome = FaultOutcome::Contended,
            FaultOutcome::NotMapped => {}
        }
    }
    outcome
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "hurd"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno_location()
        }
    } else if #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno()
        }
    } else if #[cfg(any(target_os = "solaris", target_os = "illumos"))] {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::___errno()
        }
    } else {
        unsafe fn errno_location() -> *mut libc::c_int {
            libc::__error()
        }
    }
}

unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            (*info).si_addr() as usize
        } else {
            (*info).si_addr as usize
        }
    }
}

// Crash the way the OS would have once the handler returns.
unsafe fn reraise() {
    libc::signal(libc::SIGBUS, libc::SIG_DFL);
    libc::raise(libc::SIGBUS);
}

extern "C" fn on_sigbus(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: errno is thread-local and always addressable.
    let saved_errno = unsafe { *errno_location() };
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    let (code, addr) = unsafe { ((*info).si_code, fault_address(info)) };

    let ps = page_size();
    let absorbed = code != libc::BUS_ADRALN && claim(addr, ps) == FaultOutcome::Marked && {
        // SAFETY: the page lies inside a live read-only mapping owned by a
        // watched registry; it is replaced with anonymous zeros.
        let zero = unsafe {
            libc::mmap(
                align_down(addr, ps) as *mut libc::c_void,
                ps,
                libc::PROT_READ,
                libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        zero != libc::MAP_FAILED
    };

    // SAFETY: only async-signal-safe calls; errno is restored last.
    unsafe {
        if !absorbed {
            reraise();
        }
        *errno_location() = saved_errno;
    }
}
