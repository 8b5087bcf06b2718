//! Integration tests for the file cache and its mappings.

use mmap_cache::{utils::page_size, Capabilities, FaultOutcome, MapHint, MmapCacheError, Registry};
use std::fs::{self, OpenOptions};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn same_window_from_two_opens_shares_one_mapping() {
    let ps = page_size();
    let dir = tempdir().unwrap();
    let path = dir.path().join("dedup.bin");
    fs::write(&path, pattern(ps * 4)).unwrap();

    let reg = Registry::new();
    let a = reg.open(&path, false).unwrap();
    let b = reg.open(&path, false).unwrap();
    assert!(a.same_file(&b));
    assert_eq!(a.identity(), b.identity());

    let m1 = a.map_window(MapHint::Random, ps as u64, 100).unwrap();
    let m2 = b.map_window(MapHint::Random, ps as u64, 100).unwrap();
    assert_eq!(m1.address(), m2.address());
    assert_eq!(a.map_refcount(m1.address()), 2);
    assert_eq!(a.window_count(), 1);
    assert_eq!(&m1[..], &pattern(ps * 4)[ps..ps + 100]);
}

#[test]
fn changed_file_is_reopened() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stale.bin");
    fs::write(&path, b"0123456789").unwrap();

    let reg = Registry::new();
    let first = reg.open(&path, false).unwrap();

    let f = OpenOptions::new().write(true).open(&path).unwrap();
    f.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();
    drop(f);

    let second = reg.open(&path, false).unwrap();
    assert!(!first.same_file(&second));
    assert_ne!(first.modified_time(), second.modified_time());
    assert_eq!(reg.len(), 1);

    let third = reg.open(&path, false).unwrap();
    assert!(third.same_file(&second));
}

#[test]
fn paired_map_unmap_creates_and_destroys_once() {
    let ps = page_size();
    let dir = tempdir().unwrap();
    let path = dir.path().join("pairs.bin");
    fs::write(&path, pattern(ps * 2)).unwrap();

    let reg = Registry::new();
    let file = reg.open(&path, false).unwrap();

    let mut guards = Vec::new();
    for _ in 0..5 {
        guards.push(file.map_window(MapHint::Random, 10, 20).unwrap());
    }
    let addr = guards[0].address();
    assert!(guards.iter().all(|g| g.address() == addr));
    assert_eq!(file.window_count(), 1);
    assert_eq!(file.map_refcount(addr), 5);

    // Release out of order, interleaved with a fresh request.
    file.unmap(guards.remove(2));
    guards.push(file.map_window(MapHint::Random, 10, 20).unwrap());
    assert_eq!(file.map_refcount(addr), 5);
    while let Some(g) = guards.pop() {
        drop(g);
    }
    assert_eq!(file.window_count(), 0);
    assert_eq!(file.map_refcount(addr), 0);
}

#[test]
fn whole_file_mapping_is_shared_until_last_release() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("whole.bin");
    fs::write(&path, b"the whole file").unwrap();

    let reg = Registry::new();
    let file = reg.open(&path, false).unwrap();
    let maps: Vec<_> = (0..3).map(|_| file.map_all(MapHint::WillNeed).unwrap()).collect();
    let addr = maps[0].address();
    assert!(maps.iter().all(|m| m.address() == addr));
    assert_eq!(file.map_refcount(addr), 3);

    // A window spanning the file is the whole-file mapping.
    let same = file.map_window(MapHint::Random, 0, file.size()).unwrap();
    assert_eq!(same.address(), addr);
    assert_eq!(file.window_count(), 0);

    drop(same);
    drop(maps);
    assert!(!file.is_mapped_whole());
    assert!(!file.is_faulty(addr));
}

#[test]
fn bad_windows_leave_the_table_unchanged() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bounds.bin");
    fs::write(&path, vec![0u8; 100]).unwrap();

    let reg = Registry::new();
    let file = reg.open(&path, false).unwrap();
    let _keep = file.map_window(MapHint::Random, 0, 10).unwrap();

    assert!(matches!(
        file.map_window(MapHint::Random, 99, 2),
        Err(MmapCacheError::OutOfRange { offset: 99, len: 2, total: 100 })
    ));
    assert!(matches!(
        file.map_window(MapHint::Random, u64::MAX, 2),
        Err(MmapCacheError::OutOfRange { .. })
    ));
    assert!(matches!(
        file.map_window(MapHint::Random, 5, 0),
        Err(MmapCacheError::InvalidArgument(_))
    ));
    assert_eq!(file.window_count(), 1);
}

#[test]
fn empty_file_opens_but_does_not_map() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.bin");
    fs::write(&path, b"").unwrap();

    let reg = Registry::new();
    let file = reg.open(&path, false).unwrap();
    assert_eq!(file.size(), 0);
    assert!(matches!(file.map_all(MapHint::Random), Err(MmapCacheError::InvalidArgument(_))));
}

#[test]
fn fault_on_one_window_spares_the_rest() {
    let ps = page_size();
    let dir = tempdir().unwrap();
    let p1 = dir.path().join("one.bin");
    let p2 = dir.path().join("two.bin");
    fs::write(&p1, pattern(ps * 4)).unwrap();
    fs::write(&p2, pattern(ps * 4)).unwrap();

    let reg = Registry::new();
    let f1 = reg.open(&p1, false).unwrap();
    let f2 = reg.open(&p2, false).unwrap();
    let w1 = f1.map_window(MapHint::Random, 0, ps as u64).unwrap();
    let w2 = f1.map_window(MapHint::Random, ps as u64 * 2, ps as u64).unwrap();
    let whole1 = f1.map_all(MapHint::Random).unwrap();
    let other = f2.map_window(MapHint::Random, 0, ps as u64).unwrap();

    assert_eq!(reg.on_fault(w2.address(), ps), FaultOutcome::Marked);
    assert!(w2.is_faulty());
    assert!(!w1.is_faulty());
    assert!(!whole1.is_faulty());
    assert!(!other.is_faulty());

    // Faulty until unmapped; a fresh mapping starts clean.
    drop(w2);
    let again = f1.map_window(MapHint::Random, ps as u64 * 2, ps as u64).unwrap();
    assert!(!again.is_faulty());
}

#[test]
fn concurrent_opens_share_handles_and_windows() {
    let ps = page_size();
    let dir = tempdir().unwrap();
    let path = Arc::new(dir.path().join("threads.bin"));
    fs::write(&*path, pattern(ps * 8)).unwrap();

    let reg = Registry::new();
    let anchor = reg.open(&*path, false).unwrap();
    let held = anchor.map_window(MapHint::Random, ps as u64, ps as u64).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let reg = reg.clone();
            let path = Arc::clone(&path);
            std::thread::spawn(move || {
                let mut addrs = Vec::new();
                for _ in 0..50 {
                    let file = reg.open(&*path, false).unwrap();
                    let m = file.map_window(MapHint::Random, ps as u64, ps as u64).unwrap();
                    addrs.push(m.address());
                }
                addrs
            })
        })
        .collect();

    for h in handles {
        assert!(h.join().unwrap().iter().all(|&a| a == held.address()));
    }
    assert_eq!(anchor.open_refcount(), 2);
    assert_eq!(anchor.map_refcount(held.address()), 1);
    drop(held);
    drop(anchor);
    assert!(reg.is_empty());
    reg.shutdown().unwrap();
}

#[test]
fn populate_without_map_populate_touches_pages() {
    let ps = page_size();
    let dir = tempdir().unwrap();
    let path = dir.path().join("touch.bin");
    fs::write(&path, pattern(ps * 3 + 7)).unwrap();

    let reg = Registry::builder()
        .capabilities(Capabilities::minimal())
        .huge_pages(false)
        .build();
    let file = reg.open(&path, false).unwrap();
    let m = file.map_all(MapHint::Populate).unwrap();
    assert_eq!(m.len(), ps * 3 + 7);
    assert_eq!(m[ps * 3 + 6], ((ps * 3 + 6) % 251) as u8);
}

#[test]
fn huge_page_requests_fall_back_to_normal_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("huge.bin");
    fs::write(&path, pattern(64 * 1024)).unwrap();

    let reg = Registry::builder().huge_pages(true).huge_page_threshold(4096).build();
    assert_eq!(reg.config().huge_page_threshold, 4096);
    let file = reg.open(&path, false).unwrap();
    let m = file.map_all(MapHint::Sequential).unwrap();
    assert_eq!(&m[..], &pattern(64 * 1024)[..]);
}

#[cfg(target_os = "linux")]
#[test]
fn shared_memory_objects_open_by_name() {
    use std::ffi::CString;

    let name = format!("/mmap-cache-test-{}", std::process::id());
    let c_name = CString::new(name.clone()).unwrap();
    unsafe {
        let fd = libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600);
        assert!(fd >= 0);
        assert_eq!(libc::ftruncate(fd, 4096), 0);
        libc::close(fd);
    }

    let reg = Registry::new();
    let shm = reg.open(&name, true).unwrap();
    assert!(shm.is_shared());
    assert_eq!(shm.size(), 4096);
    assert!(shm.map_all(MapHint::Random).unwrap().iter().all(|&b| b == 0));

    drop(shm);
    unsafe {
        libc::shm_unlink(c_name.as_ptr());
    }
}
