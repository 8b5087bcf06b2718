//! Crate-specific error types for mmap-cache.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result alias for mmap-cache operations.
pub type Result<T> = std::result::Result<T, MmapCacheError>;

/// Error type covering path, filesystem, mapping and lifecycle issues.
#[derive(Debug, Error)]
pub enum MmapCacheError {
    /// Wrapper for `std::io::Error` that has no more specific variant.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A required argument was empty or otherwise unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The path could not be turned into a canonical path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The file or directory does not exist.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The caller lacks permission to open or list the path.
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// A requested window does not fit inside the file.
    #[error("range out of bounds: offset={offset}, len={len}, total={total}")]
    OutOfRange {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Size of the file.
        total: u64,
    },

    /// The OS refused to create a mapping, huge-page retry included.
    #[error("mmap failed: {0}")]
    MapFailed(String),

    /// Descriptor or memory exhaustion.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The platform lacks the requested facility.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Files were still open when the registry was shut down.
    #[error("{} file(s) still open at shutdown", .0.len())]
    Leaked(Vec<PathBuf>),
}

/// Integer codes for each error kind, stable across releases.
const CODES: &[(i32, &str)] = &[
    (1, "I/O error"),
    (2, "invalid argument"),
    (3, "invalid path"),
    (4, "file or directory not found"),
    (5, "permission denied"),
    (6, "window out of range"),
    (7, "memory mapping failed"),
    (8, "resource exhausted"),
    (9, "operation not supported on this platform"),
    (10, "files leaked at shutdown"),
];

impl MmapCacheError {
    /// Integer code of this error kind. See [`describe`].
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Io(_) => 1,
            Self::InvalidArgument(_) => 2,
            Self::InvalidPath(_) => 3,
            Self::NotFound(_) => 4,
            Self::PermissionDenied(_) => 5,
            Self::OutOfRange { .. } => 6,
            Self::MapFailed(_) => 7,
            Self::ResourceExhausted(_) => 8,
            Self::NotSupported(_) => 9,
            Self::Leaked(_) => 10,
        }
    }

    /// Classify an OS error raised while operating on `path`.
    pub(crate) fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => match err.raw_os_error() {
                Some(libc::EMFILE | libc::ENFILE | libc::ENOMEM) => {
                    Self::ResourceExhausted(format!("{}: {err}", path.display()))
                }
                _ => Self::Io(err),
            },
        }
    }
}

/// Human-readable description registered for an error code.
///
/// Unknown codes yield `"unknown error"`.
#[must_use]
pub fn describe(code: i32) -> &'static str {
    CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map_or("unknown error", |(_, msg)| msg)
}
