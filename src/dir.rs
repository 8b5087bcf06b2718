//! Lazy directory listings at three levels of detail.
//!
//! Entries are read with `readdir_r` into a buffer sized once per directory
//! from the filesystem's name limit. `.` and `..` are never yielded, and
//! every yielded path is absolute.

use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use log::warn;

use crate::errors::{MmapCacheError, Result};
use crate::path::{sanitize, CanonicalPath};
use crate::platform::Capabilities;

const FALLBACK_NAME_MAX: usize = 255;
// Not exported by libc on every target.
const DT_WHT: u8 = 14;

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileType {
    /// Not reported by the directory and not stat'ed.
    #[default]
    Unknown,
    /// Named pipe.
    Fifo,
    /// Character device.
    CharDevice,
    /// Directory.
    Directory,
    /// Block device.
    BlockDevice,
    /// Regular file.
    Regular,
    /// Symbolic link.
    Link,
    /// Unix domain socket.
    Socket,
    /// Union-mount whiteout.
    Whiteout,
}

impl FileType {
    #[allow(unreachable_patterns)]
    fn from_dirent(d_type: u8) -> Self {
        match d_type {
            libc::DT_FIFO => FileType::Fifo,
            libc::DT_CHR => FileType::CharDevice,
            libc::DT_DIR => FileType::Directory,
            libc::DT_BLK => FileType::BlockDevice,
            libc::DT_REG => FileType::Regular,
            libc::DT_LNK => FileType::Link,
            libc::DT_SOCK => FileType::Socket,
            DT_WHT => FileType::Whiteout,
            _ => FileType::Unknown,
        }
    }

    #[allow(clippy::unnecessary_cast)]
    fn from_mode(mode: u32) -> Self {
        const IFMT: u32 = libc::S_IFMT as u32;
        const IFIFO: u32 = libc::S_IFIFO as u32;
        const IFCHR: u32 = libc::S_IFCHR as u32;
        const IFDIR: u32 = libc::S_IFDIR as u32;
        const IFBLK: u32 = libc::S_IFBLK as u32;
        const IFREG: u32 = libc::S_IFREG as u32;
        const IFLNK: u32 = libc::S_IFLNK as u32;
        const IFSOCK: u32 = libc::S_IFSOCK as u32;
        match mode & IFMT {
            IFIFO => FileType::Fifo,
            IFCHR => FileType::CharDevice,
            IFDIR => FileType::Directory,
            IFBLK => FileType::BlockDevice,
            IFREG => FileType::Regular,
            IFLNK => FileType::Link,
            IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }
}

/// Full stat record of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: i64,
    pub atimensec: i64,
    pub mtime: i64,
    pub mtimensec: i64,
    pub ctime: i64,
    pub ctimensec: i64,
}

impl Stat {
    fn from_metadata(m: &std::fs::Metadata) -> Self {
        Self {
            dev: m.dev(),
            ino: m.ino(),
            mode: m.mode(),
            nlink: m.nlink(),
            uid: m.uid(),
            gid: m.gid(),
            rdev: m.rdev(),
            size: m.size(),
            blksize: m.blksize(),
            blocks: m.blocks(),
            atime: m.atime(),
            atimensec: m.atime_nsec(),
            mtime: m.mtime(),
            mtimensec: m.mtime_nsec(),
            ctime: m.ctime(),
            ctimensec: m.ctime_nsec(),
        }
    }

    // Field widths vary by platform.
    #[allow(clippy::unnecessary_cast, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    fn from_raw(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as u64,
            size: st.st_size as u64,
            blksize: st.st_blksize as u64,
            blocks: st.st_blocks as u64,
            atime: st.st_atime as i64,
            atimensec: st.st_atime_nsec as i64,
            mtime: st.st_mtime as i64,
            mtimensec: st.st_mtime_nsec as i64,
            ctime: st.st_ctime as i64,
            ctimensec: st.st_ctime_nsec as i64,
        }
    }

    /// Kind of file described by `mode`.
    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }
}

/// Stat `path`, following symbolic links.
///
/// # Errors
///
/// Returns `NotFound` or `PermissionDenied` when the path cannot be stat'ed
/// for those reasons, `Io` otherwise.
pub fn stat<P: AsRef<Path>>(path: P) -> Result<Stat> {
    let path = path.as_ref();
    std::fs::metadata(path)
        .map(|m| Stat::from_metadata(&m))
        .map_err(|e| MmapCacheError::from_io(e, path))
}

/// A directory entry with its type.
#[derive(Clone, PartialEq, Eq)]
pub struct DirectInfo {
    path: Arc<Path>,
    name_start: usize,
    name_length: usize,
    file_type: FileType,
}

impl DirectInfo {
    /// Absolute path of the entry.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the entry name within [`DirectInfo::path`].
    #[must_use]
    pub fn name_start(&self) -> usize {
        self.name_start
    }

    /// Length in bytes of the entry name.
    #[must_use]
    pub fn name_length(&self) -> usize {
        self.name_length
    }

    /// The entry name.
    #[must_use]
    pub fn name(&self) -> &OsStr {
        let bytes = self.path.as_os_str().as_bytes();
        OsStr::from_bytes(&bytes[self.name_start..self.name_start + self.name_length])
    }

    /// Entry type as reported by the directory, or refined by stat.
    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.file_type
    }
}

impl fmt::Debug for DirectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectInfo")
            .field("path", &self.path)
            .field("type", &self.file_type)
            .finish()
    }
}

/// A directory entry with its type and, when stat succeeded, its stat record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryStat {
    /// Path and type.
    pub info: DirectInfo,
    /// Stat record, `None` if the entry could not be stat'ed.
    pub stat: Option<Stat>,
}

impl std::ops::Deref for DirEntryStat {
    type Target = DirectInfo;

    fn deref(&self) -> &DirectInfo {
        &self.info
    }
}

struct DirStream {
    dir: NonNull<libc::DIR>,
    // dirent storage, u64 for alignment.
    buf: Vec<u64>,
    base: CanonicalPath,
    caps: Capabilities,
    done: bool,
}

impl DirStream {
    fn open(dir: &Path) -> Result<Self> {
        let base = sanitize(dir)?;
        let c_dir = CString::new(base.as_path().as_os_str().as_bytes())
            .map_err(|_| MmapCacheError::InvalidPath(base.to_string()))?;
        // SAFETY: c_dir is NUL-terminated.
        let raw = unsafe { libc::opendir(c_dir.as_ptr()) };
        let Some(dir) = NonNull::new(raw) else {
            return Err(MmapCacheError::from_io(std::io::Error::last_os_error(), base.as_path()));
        };

        // SAFETY: dir is a live stream; dirfd does not take ownership.
        let name_max = unsafe { libc::fpathconf(libc::dirfd(dir.as_ptr()), libc::_PC_NAME_MAX) };
        let name_max = usize::try_from(name_max).ok().filter(|&n| n > 0).unwrap_or(FALLBACK_NAME_MAX);
        let bytes = (std::mem::offset_of!(libc::dirent, d_name) + name_max + 1)
            .max(std::mem::size_of::<libc::dirent>());
        let words = bytes.div_ceil(std::mem::size_of::<u64>());

        Ok(Self {
            dir,
            buf: vec![0u64; words],
            base,
            caps: Capabilities::detect(),
            done: false,
        })
    }

    /// Next raw entry name and d_type, skipping `.` and `..`.
    #[allow(deprecated)]
    fn next_raw(&mut self) -> Option<(Vec<u8>, u8)> {
        while !self.done {
            let entry = self.buf.as_mut_ptr().cast::<libc::dirent>();
            let mut result: *mut libc::dirent = std::ptr::null_mut();
            // SAFETY: entry points to a buffer large enough for any name on
            // this filesystem; the stream is live and used by one thread.
            let rc = unsafe { libc::readdir_r(self.dir.as_ptr(), entry, &mut result) };
            if rc != 0 {
                let err = std::io::Error::from_raw_os_error(rc);
                warn!("reading directory {} failed: {err}", self.base);
                self.done = true;
                return None;
            }
            if result.is_null() {
                self.done = true;
                return None;
            }
            // SAFETY: readdir_r filled `entry` with a NUL-terminated name.
            let name = unsafe { CStr::from_ptr((*result).d_name.as_ptr()) }.to_bytes();
            if name == b"." || name == b".." {
                continue;
            }
            // SAFETY: as above.
            let d_type = unsafe { entry_type(result) };
            return Some((name.to_vec(), d_type));
        }
        None
    }

    /// Next entry with its full path, skipping names that overflow `PATH_MAX`.
    fn next_info(&mut self) -> Option<(DirectInfo, Vec<u8>)> {
        loop {
            let (name, d_type) = self.next_raw()?;
            let base = self.base.as_path().as_os_str().as_bytes();
            let mut full = Vec::with_capacity(base.len() + 1 + name.len());
            full.extend_from_slice(base);
            if base != b"/" {
                full.push(b'/');
            }
            let name_start = full.len();
            full.extend_from_slice(&name);
            if full.len() >= libc::PATH_MAX as usize {
                warn!(
                    "skipping {} entry {:?}: path too long",
                    self.base,
                    String::from_utf8_lossy(&name)
                );
                continue;
            }
            let info = DirectInfo {
                path: Arc::from(Path::new(OsStr::from_bytes(&full))),
                name_start,
                name_length: name.len(),
                file_type: FileType::from_dirent(d_type),
            };
            return Some((info, name));
        }
    }

    /// Stat the entry itself; symbolic links are not followed.
    fn stat_entry(&self, info: &DirectInfo, name: &[u8]) -> Option<Stat> {
        if !self.caps.fd_relative_stat {
            return std::fs::symlink_metadata(info.path())
                .ok()
                .map(|m| Stat::from_metadata(&m));
        }
        let c_name = CString::new(name).ok()?;
        let mut raw = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: the stream is live, c_name is NUL-terminated and raw is a
        // valid out pointer.
        let rc = unsafe {
            libc::fstatat(
                libc::dirfd(self.dir.as_ptr()),
                c_name.as_ptr(),
                raw.as_mut_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return None;
        }
        // SAFETY: fstatat succeeded and initialized raw.
        Some(Stat::from_raw(unsafe { raw.assume_init_ref() }))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        // SAFETY: closing the stream opened in `open`, exactly once.
        unsafe {
            libc::closedir(self.dir.as_ptr());
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "solaris", target_os = "illumos", target_os = "haiku"))] {
        unsafe fn entry_type(_entry: *const libc::dirent) -> u8 {
            libc::DT_UNKNOWN
        }
    } else {
        unsafe fn entry_type(entry: *const libc::dirent) -> u8 {
            (*entry).d_type
        }
    }
}

/// Absolute paths of the entries of a directory.
pub struct List(DirStream);

/// Entries of a directory with their types.
pub struct ListTyped(DirStream);

/// Entries of a directory with types and stat records.
pub struct ListStat(DirStream);

impl Iterator for List {
    type Item = Arc<Path>;

    fn next(&mut self) -> Option<Arc<Path>> {
        self.0.next_info().map(|(info, _)| info.path)
    }
}

impl Iterator for ListTyped {
    type Item = DirectInfo;

    fn next(&mut self) -> Option<DirectInfo> {
        self.0.next_info().map(|(info, _)| info)
    }
}

impl Iterator for ListStat {
    type Item = DirEntryStat;

    fn next(&mut self) -> Option<DirEntryStat> {
        let (mut info, name) = self.0.next_info()?;
        let stat = self.0.stat_entry(&info, &name);
        if let Some(st) = stat.filter(|_| info.file_type == FileType::Unknown) {
            info.file_type = st.file_type();
        }
        Some(DirEntryStat { info, stat })
    }
}

/// List the entries of `dir` by path.
///
/// # Errors
///
/// Returns `NotFound`, `PermissionDenied` or `Io` if the directory cannot be
/// opened, and `InvalidArgument` for an empty path.
pub fn list<P: AsRef<Path>>(dir: P) -> Result<List> {
    DirStream::open(dir.as_ref()).map(List)
}

/// List the entries of `dir` with the type the directory reports.
///
/// # Errors
///
/// Same as [`list`].
pub fn list_typed<P: AsRef<Path>>(dir: P) -> Result<ListTyped> {
    DirStream::open(dir.as_ref()).map(ListTyped)
}

/// List the entries of `dir`, stat'ing each one.
///
/// The stat describes the entry itself, so a symbolic link reports as a link.
/// A type the directory did not report is filled in from the stat record;
/// a reported type is kept even if the stat fails.
///
/// # Errors
///
/// Same as [`list`].
pub fn list_stat<P: AsRef<Path>>(dir: P) -> Result<ListStat> {
    DirStream::open(dir.as_ref()).map(ListStat)
}

/// Call `cb(name, parent)` for each entry of `dir`, descending into
/// subdirectories when `recursive` is set.
///
/// Symbolic links to directories are reported as links and not followed.
/// A subdirectory that cannot be opened is logged and skipped.
///
/// # Errors
///
/// Fails only if `dir` itself cannot be listed.
pub fn dir_list<P, F>(dir: P, recursive: bool, mut cb: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnMut(&OsStr, &Path),
{
    walk(dir.as_ref(), recursive, &mut cb)
}

fn walk<F: FnMut(&OsStr, &Path)>(dir: &Path, recursive: bool, cb: &mut F) -> Result<()> {
    let entries = list_stat(dir)?;
    let parent = sanitize(dir)?;
    for entry in entries {
        cb(entry.name(), parent.as_path());
        if recursive && entry.file_type() == FileType::Directory {
            if let Err(err) = walk(entry.path(), true, cb) {
                warn!("skipping {}: {err}", entry.path().display());
            }
        }
    }
    Ok(())
}
