//! Line iteration and path handling through the public API.

use mmap_cache::{path::split, sanitize, MapHint, Registry};
use std::fs;
use tempfile::tempdir;

#[test]
fn lines_with_mixed_terminators() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mixed.txt");
    fs::write(&path, b"a\nb\r\nc\rd").unwrap();

    let reg = Registry::new();
    let file = reg.open(&path, false).unwrap();
    let mut lines = file.lines().unwrap();
    let texts: Vec<Vec<u8>> = lines.by_ref().map(|l| l.to_vec()).collect();
    assert_eq!(texts, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    assert!(lines.next().is_none());
}

#[test]
fn lines_share_the_whole_file_mapping() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.txt");
    fs::write(&path, b"x\ny\n").unwrap();

    let reg = Registry::new();
    let file = reg.open(&path, false).unwrap();
    let whole = file.map_all(MapHint::Random).unwrap();
    let lines = file.lines().unwrap();
    assert_eq!(file.map_refcount(whole.address()), 2);

    drop(lines);
    assert_eq!(file.map_refcount(whole.address()), 1);
}

#[test]
fn lines_keep_the_file_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("open.txt");
    fs::write(&path, b"one\ntwo\nthree").unwrap();

    let reg = Registry::new();
    let lines = reg.open(&path, false).unwrap().lines().unwrap();
    assert!(reg.contains(&path));
    let last = lines.last().unwrap();
    assert_eq!(last.index(), 3);
    assert_eq!(&*last, b"three");
    drop(last);
    assert!(reg.is_empty());
}

#[test]
fn split_drops_empty_components() {
    assert_eq!(
        split("this//is///a /more/complex///case///"),
        ["this", "is", "a ", "more", "complex", "case"]
    );
}

#[test]
fn sanitize_twice_is_sanitize_once() {
    let cases = [
        "/usr/../usr//local/./bin/",
        "relative/../../up",
        "/a/b/c/../../../../..",
        "//leading",
        ".",
        "..",
    ];
    for p in cases {
        let once = sanitize(p).unwrap();
        assert_eq!(sanitize(once.as_path()).unwrap(), once, "{p}");
        assert!(once.as_path().is_absolute());
    }
}
