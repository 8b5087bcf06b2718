//! Recording memory faults against the mapping that owns the faulting page.
//!
//! [`Registry::on_fault`] runs from the SIGBUS handler, so it neither logs
//! nor allocates, and it only waits a bounded time for any lock.

use std::time::Duration;

use crate::file::FileState;
use crate::registry::{Registry, RegistryShared};

const LOCK_WAIT: Duration = Duration::from_millis(10);

/// Result of reporting a fault address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A mapping owning the address was found and flagged faulty.
    Marked,
    /// No mapping of this registry owns the address.
    NotMapped,
    /// A lock could not be acquired in time; some files were not checked.
    Contended,
}

impl FileState {
    /// Flag the mapping whose pages contain `address`, whole-file mapping first.
    pub(crate) fn mark_faulty(&mut self, address: usize, page_size: usize) -> bool {
        if let Some(rec) = self.whole.as_mut() {
            if rec.covers(address, page_size) {
                rec.faulty = true;
                return true;
            }
        }
        match self.windows.containing_mut(address, page_size) {
            Some(rec) => {
                rec.faulty = true;
                true
            }
            None => false,
        }
    }
}

impl Registry {
    /// Flag the mapping that contains `address` as faulty.
    ///
    /// An address belongs to a mapping when it lies between the start of the
    /// page holding the mapping's first byte and the mapping's end. Files
    /// evicted as stale but still held open are not searched.
    #[must_use]
    pub fn on_fault(&self, address: usize, page_size: usize) -> FaultOutcome {
        self.shared.on_fault(address, page_size)
    }
}

impl RegistryShared {
    pub(crate) fn on_fault(&self, address: usize, page_size: usize) -> FaultOutcome {
        let Some(files) = self.files.try_lock_for(LOCK_WAIT) else {
            return FaultOutcome::Contended;
        };
        let mut contended = false;
        for inner in files.values() {
            let Some(mut st) = inner.state.try_lock_for(LOCK_WAIT) else {
                contended = true;
                continue;
            };
            if st.mark_faulty(address, page_size) {
                return FaultOutcome::Marked;
            }
        }
        if contended {
            FaultOutcome::Contended
        } else {
            FaultOutcome::NotMapped
        }
    }
}
