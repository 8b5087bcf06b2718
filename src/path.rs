//! Path canonicalization used for cache keys, plus component splitting.
//!
//! This is a textual transform: symlinks are not resolved and the filesystem
//! is only consulted for the current working directory.

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use crate::errors::{MmapCacheError, Result};

const SEPARATOR: u8 = b'/';

/// Absolute, normalized path identifying a file for caching purposes.
///
/// Contains no empty, `.` or `..` segments and never ends in a separator
/// (except the root itself).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalPath(PathBuf);

impl CanonicalPath {
    /// Borrow as a `Path`.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Consume into a `PathBuf`.
    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

/// Canonicalize `path`.
///
/// Relative paths are resolved against the current working directory. Runs
/// of separators collapse into one, `.` segments are dropped, and each `..`
/// removes the closest preceding segment. A `..` at the root is dropped.
///
/// # Errors
///
/// Returns `MmapCacheError::InvalidArgument` for an empty path, or
/// `MmapCacheError::InvalidPath` if the working directory cannot be read.
pub fn sanitize<P: AsRef<Path>>(path: P) -> Result<CanonicalPath> {
    let raw = path.as_ref().as_os_str().as_bytes();
    if raw.is_empty() {
        return Err(MmapCacheError::InvalidArgument("empty path"));
    }

    let mut absolute;
    let full: &[u8] = if raw[0] == SEPARATOR {
        raw
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| MmapCacheError::InvalidPath(format!("cannot read working directory: {e}")))?;
        absolute = cwd.into_os_string().into_vec();
        absolute.push(SEPARATOR);
        absolute.extend_from_slice(raw);
        &absolute
    };

    Ok(CanonicalPath(PathBuf::from(OsStr::from_bytes(&normalize(full)))))
}

// Segment-wise normalization of an absolute byte path.
fn normalize(full: &[u8]) -> Vec<u8> {
    let mut kept: Vec<&[u8]> = Vec::new();
    for segment in full.split(|&b| b == SEPARATOR) {
        match segment {
            b"" | b"." => {}
            b".." => {
                kept.pop();
            }
            other => kept.push(other),
        }
    }

    let mut out = Vec::with_capacity(full.len());
    for segment in &kept {
        out.push(SEPARATOR);
        out.extend_from_slice(segment);
    }
    if out.is_empty() {
        out.push(SEPARATOR);
    }
    out
}

/// Split `path` into its components on the separator.
///
/// Runs of separators count as one, and leading or trailing separators
/// produce no empty components. Everything else is preserved verbatim.
///
/// ```
/// let parts = mmap_cache::path::split("this//is///a /more/complex///case///");
/// assert_eq!(parts, ["this", "is", "a ", "more", "complex", "case"]);
/// ```
#[must_use]
pub fn split(path: &str) -> Vec<&str> {
    path.split(SEPARATOR as char)
        .filter(|c| !c.is_empty())
        .collect()
}
