//! Platform capability query, resolved once per file handle.

/// What the running platform can do for file mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `mmap` accepts `MAP_POPULATE`. Otherwise population is done by touching pages.
    pub map_populate: bool,
    /// `mmap` accepts `MAP_HUGETLB` for file mappings.
    pub huge_pages: bool,
    /// POSIX shared memory objects (`shm_open`) are available.
    pub shared_memory: bool,
    /// `fstatat` relative to a directory descriptor is available.
    pub fd_relative_stat: bool,
}

impl Capabilities {
    /// Capabilities of the current target.
    #[must_use]
    pub const fn detect() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                Self {
                    map_populate: true,
                    huge_pages: true,
                    shared_memory: !cfg!(target_os = "android"),
                    fd_relative_stat: true,
                }
            } else {
                Self {
                    map_populate: false,
                    huge_pages: false,
                    shared_memory: true,
                    fd_relative_stat: true,
                }
            }
        }
    }

    /// Capabilities with every optional facility turned off.
    ///
    /// Useful to exercise the portable fallbacks on any platform.
    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            map_populate: false,
            huge_pages: false,
            shared_memory: false,
            fd_relative_stat: false,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::detect()
    }
}
