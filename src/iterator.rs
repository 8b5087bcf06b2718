//! Line iteration over a whole-file mapping.

use std::fmt;
use std::iter::FusedIterator;
use std::ops::Deref;
use std::sync::Arc;

use crate::advise::{MapHint, SMALL_PAGE};
use crate::errors::Result;
use crate::file::{FileHandle, Mapping};

fn is_terminator(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

/// One line of a mapped file, without its terminator.
///
/// Keeps the underlying mapping alive, so spans may outlive the iterator.
#[derive(Clone)]
pub struct LineSpan {
    map: Arc<Mapping>,
    start: usize,
    end: usize,
    index: usize,
}

impl LineSpan {
    /// One-based line number. Blank lines are counted.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset of the line within the file.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.start
    }

    /// The line's bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.map[self.start..self.end]
    }
}

impl Deref for LineSpan {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for LineSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineSpan")
            .field("index", &self.index)
            .field("offset", &self.start)
            .field("text", &String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

enum State {
    Positioned(usize),
    Exhausted,
}

/// Iterator over the lines of a file.
///
/// `\n` and `\r` both end a line. A run of terminators between two lines is
/// skipped, and every repeat of the run's first terminator counts as one
/// blank line for numbering, so `"\r\n"` advances by one and `"\n\n"` by two.
///
/// # Examples
///
/// ```no_run
/// let file = mmap_cache::open("/etc/hosts", false)?;
/// for line in file.lines()? {
///     println!("{:>4}: {}", line.index(), String::from_utf8_lossy(&line));
/// }
/// # Ok::<(), mmap_cache::MmapCacheError>(())
/// ```
pub struct Lines {
    map: Option<Arc<Mapping>>,
    state: State,
    pending: usize,
    index: usize,
}

impl Lines {
    fn new(map: Option<Mapping>) -> Self {
        let state = if map.is_some() { State::Positioned(0) } else { State::Exhausted };
        Self {
            map: map.map(Arc::new),
            state,
            pending: 1,
            index: 0,
        }
    }
}

// Position of the next terminator at or after `from`, scanning a page at a time.
fn find_terminator(data: &[u8], from: usize) -> Option<usize> {
    let base = data.as_ptr() as usize;
    let mut pos = from;
    while pos < data.len() {
        let boundary = (base + pos + SMALL_PAGE) & !(SMALL_PAGE - 1);
        let stop = (boundary - base).min(data.len());
        if let Some(i) = data[pos..stop].iter().position(|&b| is_terminator(b)) {
            return Some(pos + i);
        }
        pos = stop;
    }
    None
}

impl Iterator for Lines {
    type Item = LineSpan;

    fn next(&mut self) -> Option<LineSpan> {
        let State::Positioned(mut cursor) = self.state else {
            return None;
        };
        let Some(map) = self.map.as_ref() else {
            self.state = State::Exhausted;
            return None;
        };
        let data = map.as_slice();

        let mut blank = 0;
        if let Some(&marker) = data.get(cursor).filter(|&&b| is_terminator(b)) {
            while cursor < data.len() && is_terminator(data[cursor]) {
                if data[cursor] == marker {
                    blank += 1;
                }
                cursor += 1;
            }
        }
        if cursor >= data.len() {
            self.state = State::Exhausted;
            return None;
        }

        self.index += self.pending + blank;
        self.pending = 0;
        let end = find_terminator(data, cursor).unwrap_or(data.len());
        self.state = State::Positioned(end);

        Some(LineSpan {
            map: Arc::clone(map),
            start: cursor,
            end,
            index: self.index,
        })
    }
}

impl FusedIterator for Lines {}

impl FileHandle {
    /// Iterate over the lines of the file through a whole-file mapping.
    ///
    /// An empty file yields nothing.
    ///
    /// # Errors
    ///
    /// Returns errors from [`FileHandle::map_all`].
    pub fn lines(&self) -> Result<Lines> {
        if self.size() == 0 {
            return Ok(Lines::new(None));
        }
        Ok(Lines::new(Some(self.map_all(MapHint::Sequential)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::fs;
    use tempfile::tempdir;

    fn collect(content: &[u8]) -> Vec<(usize, Vec<u8>)> {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("lines.txt");
        fs::write(&path, content).expect("write");
        let reg = Registry::new();
        let file = reg.open(&path, false).expect("open");
        file.lines()
            .expect("lines")
            .map(|l| (l.index(), l.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn mixed_terminators() {
        let got = collect(b"a\nb\r\nc\rd");
        assert_eq!(
            got,
            vec![
                (1, b"a".to_vec()),
                (2, b"b".to_vec()),
                (3, b"c".to_vec()),
                (4, b"d".to_vec()),
            ]
        );
    }

    #[test]
    fn blank_lines_advance_the_index() {
        let got = collect(b"first\n\n\nfourth\n");
        assert_eq!(got, vec![(1, b"first".to_vec()), (4, b"fourth".to_vec())]);

        let got = collect(b"\n\nthird");
        assert_eq!(got, vec![(3, b"third".to_vec())]);
    }

    #[test]
    fn last_line_without_terminator_is_complete() {
        let got = collect(b"one\ntwo");
        assert_eq!(got.last().map(|(_, b)| b.as_slice()), Some(&b"two"[..]));
    }

    #[test]
    fn only_terminators_yield_nothing() {
        assert!(collect(b"\r\n\r\n").is_empty());
    }

    #[test]
    fn fused_after_exhaustion() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("f.txt");
        fs::write(&path, b"x\ny").expect("write");
        let reg = Registry::new();
        let file = reg.open(&path, false).expect("open");
        let mut it = file.lines().expect("lines");
        assert!(it.next().is_some());
        assert!(it.next().is_some());
        assert!(it.next().is_none());
        assert!(it.next().is_none());
    }

    #[test]
    fn empty_file_is_immediately_exhausted() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("empty.txt");
        fs::write(&path, b"").expect("write");
        let reg = Registry::new();
        let file = reg.open(&path, false).expect("open");
        assert_eq!(file.lines().expect("lines").count(), 0);
    }

    #[test]
    fn lines_spanning_page_boundaries() {
        let mut content = vec![b'x'; SMALL_PAGE + 100];
        content.push(b'\n');
        content.extend_from_slice(b"tail");
        let got = collect(&content);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].1.len(), SMALL_PAGE + 100);
        assert_eq!(got[1], (2, b"tail".to_vec()));
    }

    #[test]
    fn spans_outlive_the_iterator() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("keep.txt");
        fs::write(&path, b"keep\nme").expect("write");
        let reg = Registry::new();
        let file = reg.open(&path, false).expect("open");
        let spans: Vec<LineSpan> = file.lines().expect("lines").collect();
        drop(file);
        assert_eq!(&*spans[1], b"me");
        assert_eq!(spans[1].offset(), 5);
    }
}
