//! # mmap-cache: A shared cache of read-only memory-mapped files
//!
//! This crate opens files once per process, shares whole-file and windowed
//! read-only mappings between every caller that asks for the same bytes, and
//! tracks which mappings have been hit by I/O faults.
//!
//! ## Features
//!
//! - **Deduplicated opens**: every path is canonicalized and opened once; a
//!   changed file on disk is detected and reopened
//! - **Shared mappings**: identical window requests return the same address,
//!   with independent reference counts per mapping
//! - **Fault tracking**: a faulting address is traced back to its mapping
//! - **Zero-copy lines**: iterate a file line by line straight from the mapping
//! - **Directory listings**: lazy listings with entry types and stat records
//!
//! ## Quick Start
//!
//! ```no_run
//! use mmap_cache::{MapHint, Registry};
//!
//! let registry = Registry::new();
//! let file = registry.open("data.log", false)?;
//!
//! // Map 4 KiB at offset 8192.
//! let window = file.map_window(MapHint::Random, 8192, 4096)?;
//! println!("first byte: {}", window[0]);
//!
//! for line in file.lines()? {
//!     println!("{}: {}", line.index(), String::from_utf8_lossy(&line));
//! }
//! # Ok::<(), mmap_cache::MmapCacheError>(())
//! ```
//!
//! ## Modules
//!
//! - [`errors`]: Error type and integer error codes
//! - [`utils`]: Page size, alignment and bounds checks
//! - [`path`]: Path canonicalization used for cache keys
//! - [`registry`]: The file cache
//! - [`file`]: Open files and their mappings
//! - [`iterator`]: Line iteration
//! - [`dir`]: Directory listings
//! - [`manager`]: Process-wide registry and convenience functions
//!
//! ## Feature Flags
//!
//! - `async`: Enables Tokio-based async helpers
//! - `safety`: Installs a SIGBUS trap so reads from truncated files return
//!   zeros and flag the mapping faulty instead of crashing

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![deny(missing_docs)]
#![doc(html_root_url = "https://docs.rs/mmap-cache")]

#[cfg(not(unix))]
compile_error!("mmap-cache supports Unix targets only");

pub mod advise;
pub mod dir;
pub mod errors;
pub mod fault;
pub mod file;
pub mod iterator;
pub mod manager;
pub mod path;
pub mod platform;
mod region;
pub mod registry;
#[cfg(feature = "safety")]
pub mod safety;
pub mod utils;

pub use advise::MapHint;
pub use dir::{DirEntryStat, DirectInfo, FileType, Stat};
pub use errors::{MmapCacheError, Result};
pub use fault::FaultOutcome;
pub use file::{FileHandle, FileIdentity, Mapping};
pub use iterator::{LineSpan, Lines};
pub use manager::{open, registry, shutdown};
pub use path::{sanitize, CanonicalPath};
pub use platform::Capabilities;
pub use registry::{Registry, RegistryBuilder, RegistryConfig};
