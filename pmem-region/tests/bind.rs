#![cfg(target_family = "unix")]
use std::path::Path;

use pmem_region::{BindError, Field, Layout, Mapper, Persistent, Store, Transient, VTable};

struct Demo {
    counter: Field<i32, Persistent>,
    scratch: Field<i32, Transient>,
}

fn demo_layout() -> (Layout, Demo) {
    let mut builder = Layout::builder();
    let counter = builder.persistent("counter", 23i32);
    let scratch = builder.transient("scratch", 42i32);
    let layout = builder.finish().expect("valid layout");
    (layout, Demo { counter, scratch })
}

/// One simulated process start: reserve, bind, read and increment both fields.
fn run_once(path: &Path) -> (i32, i32) {
    let (layout, demo) = demo_layout();
    let mut store = Store::new(layout).unwrap();
    store.bind(path).unwrap();

    let counter = store.update(&demo.counter, |v| v + 1);
    let scratch = store.update(&demo.scratch, |v| v + 1);
    (counter, scratch)
}

#[test]
fn fresh_file_has_initial_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fresh.persistent");

    let (layout, demo) = demo_layout();
    let mut store = Store::new(layout).unwrap();
    store.bind(&path).unwrap();

    assert!(store.region().is_bound());
    assert_eq!(store.region().backing(), Some(path.as_path()));
    assert_eq!(store.get(&demo.counter), 23);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), store.region().size());
    assert_eq!(demo.counter.read_from(&bytes), Some(23));
}

#[test]
fn counter_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mmap.persistent");
    let (_, demo) = demo_layout();

    assert_eq!(run_once(&path), (23, 42));
    assert_eq!(demo.counter.read_from(&std::fs::read(&path).unwrap()), Some(24));

    assert_eq!(run_once(&path), (24, 42));
    assert_eq!(demo.counter.read_from(&std::fs::read(&path).unwrap()), Some(25));

    std::fs::remove_file(&path).unwrap();
    assert_eq!(run_once(&path), (23, 42));
}

#[test]
fn last_write_survives() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.persistent");

    let mut builder = Layout::builder();
    let values = builder.persistent::<[u64; 4]>("values", [0; 4]);
    let layout = builder.finish().unwrap();

    {
        let mut store = Store::new(layout.clone()).unwrap();
        store.bind(&path).unwrap();
        store.set(&values, [1, 2, 3, 4]);
        store.set(&values, [5, 6, 7, 8]);
        store.flush().unwrap();
    }

    let mut store = Store::new(layout).unwrap();
    store.bind(&path).unwrap();
    assert_eq!(store.get(&values), [5, 6, 7, 8]);
}

#[test]
fn empty_layout_binds_one_page() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.persistent");

    let mut store = Store::new(Layout::builder().finish().unwrap()).unwrap();
    let page = Mapper::new().page_size();
    assert_eq!(store.region().size(), page);

    store.bind(&path).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), page as u64);
}

#[test]
fn larger_file_is_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("large.persistent");

    let (layout, demo) = demo_layout();
    let page = Mapper::new().page_size();
    let mut content = vec![0xab; 3 * page];
    content[..4].copy_from_slice(&7i32.to_ne_bytes());
    std::fs::write(&path, &content).unwrap();

    let mut store = Store::new(layout).unwrap();
    store.bind(&path).unwrap();
    assert_eq!(store.get(&demo.counter), 7);
    drop(store);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), page);
    assert_eq!(&bytes[..], &content[..page]);
}

#[test]
fn shorter_file_is_extended_with_zeros() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.persistent");
    std::fs::write(&path, [1u8, 0]).unwrap();

    let mut builder = Layout::builder();
    let low = builder.persistent::<u16>("low", 0xffff);
    let high = builder.persistent::<u16>("high", 0xffff);
    let mut store = Store::new(builder.finish().unwrap()).unwrap();
    store.bind(&path).unwrap();

    // Only an empty file is initialized, existing bytes win and new ones are zero.
    assert_eq!(store.get(&low), u16::from_ne_bytes([1, 0]));
    assert_eq!(store.get(&high), 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), store.region().size() as u64);
}

#[test]
fn transient_field_resets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transient.persistent");

    for _ in 0..3 {
        let (layout, demo) = demo_layout();
        let mut store = Store::new(layout).unwrap();
        store.bind(&path).unwrap();
        assert_eq!(store.get(&demo.scratch), 42);
        store.set(&demo.scratch, 0);
        assert!(!store.region().contains(store.address_of(&demo.scratch)));
    }
}

#[test]
fn missing_directory_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("file.persistent");

    let (layout, demo) = demo_layout();
    let mut store = Store::new(layout).unwrap();
    let err = store.bind(&path).unwrap_err();
    assert!(matches!(err, BindError::OpenFailed(_)), "{err:?}");
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

    // Still usable without persistence.
    assert!(!store.region().is_bound());
    assert_eq!(store.get(&demo.counter), 23);
}

#[test]
fn path_below_a_file_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("plain");
    std::fs::write(&file, b"").unwrap();

    let (layout, _) = demo_layout();
    let mut store = Store::new(layout).unwrap();
    let err = store.bind(file.join("child")).unwrap_err();
    assert!(matches!(err, BindError::OpenFailed(_)), "{err:?}");
    assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
}

#[test]
fn read_only_directory_fails_open() {
    use std::os::unix::fs::PermissionsExt;

    // Permission checks do not apply to root.
    if unsafe { libc::geteuid() } == 0 {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let locked = dir.path().join("locked");
    std::fs::create_dir(&locked).unwrap();
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

    let (layout, _) = demo_layout();
    let mut store = Store::new(layout).unwrap();
    let err = store.bind(locked.join("file.persistent")).unwrap_err();

    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
    assert!(matches!(err, BindError::OpenFailed(_)), "{err:?}");
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));
}

#[test]
fn device_fails_resize() {
    let (layout, _) = demo_layout();
    let mut store = Store::new(layout).unwrap();
    let err = store.bind("/dev/null").unwrap_err();
    assert!(matches!(err, BindError::ResizeFailed(_)), "{err:?}");
    assert_eq!(err.step(), "resize");
}

#[test]
fn second_bind_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (layout, _) = demo_layout();
    let mut store = Store::new(layout).unwrap();

    store.bind(dir.path().join("first")).unwrap();
    let err = store.bind(dir.path().join("second")).unwrap_err();
    assert!(matches!(err, BindError::AlreadyBound));
    assert!(!dir.path().join("second").exists());
}

#[test]
fn map_failure_keeps_resize() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unmappable.persistent");
    let page = Mapper::new().page_size();
    std::fs::write(&path, vec![1u8; 2 * page]).unwrap();

    let mut vtable = VTable::new_libc();
    vtable.mmap_fixed = |_, _, _| libc::MAP_FAILED;
    vtable.errno = || libc::ENODEV;
    let mapper = unsafe { Mapper::new_unchecked(vtable) };

    let (layout, demo) = demo_layout();
    let mut store = Store::with_mapper(layout, &mapper).unwrap();
    let err = store.bind(&path).unwrap_err();

    assert!(matches!(err, BindError::MapFailed(_)), "{err:?}");
    assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
    assert!(!store.region().is_bound());
    assert_eq!(store.get(&demo.counter), 23);

    // The resize is not rolled back.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), page as u64);
}

#[test]
fn map_failure_after_unmapping_keeps_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unmapped.persistent");

    // The kernel may tear down the old pages before a MAP_FIXED fails.
    let mut vtable = VTable::new_libc();
    vtable.mmap_fixed = |addr, len, _| {
        unsafe { libc::munmap(addr, len) };
        libc::MAP_FAILED
    };
    vtable.errno = || libc::ENOMEM;
    let mapper = unsafe { Mapper::new_unchecked(vtable) };

    let (layout, demo) = demo_layout();
    let mut store = Store::with_mapper(layout, &mapper).unwrap();
    store.set(&demo.counter, 99);

    let err = store.bind(&path).unwrap_err();
    assert!(matches!(err, BindError::MapFailed(_)), "{err:?}");
    assert!(!store.region().is_bound());
    assert_eq!(store.get(&demo.counter), 99);
    assert_eq!(store.update(&demo.counter, |v| v + 1), 99);
    assert_eq!(store.get(&demo.counter), 100);
}

#[test]
fn interrupted_first_bind_keeps_initial_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("interrupted.persistent");

    let mut vtable = VTable::new_libc();
    vtable.mmap_fixed = |_, _, _| libc::MAP_FAILED;
    vtable.errno = || libc::ENODEV;
    let failing = unsafe { Mapper::new_unchecked(vtable) };

    let (layout, _) = demo_layout();
    let mut store = Store::with_mapper(layout, &failing).unwrap();
    store.bind(&path).unwrap_err();
    drop(store);

    // The file was sized by the failed attempt, yet holds the initial values rather than zeros.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), Mapper::new().page_size() as u64);
    assert_eq!(run_once(&path), (23, 42));
    assert_eq!(run_once(&path), (24, 42));
}

#[cfg(target_os = "linux")]
#[test]
fn proc_directory_fails_open() {
    // procfs refuses new files for every user, root included.
    let (layout, _) = demo_layout();
    let mut store = Store::new(layout).unwrap();
    let err = store.bind("/proc/self/counter.persistent").unwrap_err();

    assert!(matches!(err, BindError::OpenFailed(_)), "{err:?}");
    assert_eq!(err.step(), "open");
    assert!(err.raw_os_error().is_some());
    assert!(!store.region().is_bound());
}

#[cfg(target_os = "linux")]
#[test]
fn bound_region_is_shared_file_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("maps.persistent");

    let (layout, _) = demo_layout();
    let mut store = Store::new(layout).unwrap();
    store.bind(&path).unwrap();

    let maps = pmem_region::maps::self_maps().unwrap();
    let entry = maps
        .iter()
        .find(|entry| entry.overlaps(store.region()))
        .expect("region to be mapped");

    assert!(entry.is_shared(), "{entry}");
    assert_eq!(entry.start, store.region().start());
    assert!(entry.path.as_deref().unwrap_or("").ends_with("maps.persistent"), "{entry}");
}
