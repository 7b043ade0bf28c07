#![cfg(target_family = "unix")]
use std::path::Path;

use assert_cmd::Command;

fn counter() -> Command {
    let mut cmd = Command::cargo_bin("pmem-counter").expect("binary to be built");
    cmd.env_remove("PMEM_FILE").env_remove("RUST_LOG");
    cmd
}

/// Run once and return the reported `(counter, scratch)` values.
fn run(path: &Path) -> (i32, i32) {
    let assert = counter().arg("run").arg("--file").arg(path).assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    (value(&stdout, "counter"), value(&stdout, "scratch"))
}

fn value(stdout: &str, name: &str) -> i32 {
    stdout
        .lines()
        .find(|line| line.starts_with(&format!("{name}(")))
        .and_then(|line| line.rsplit_once(" = "))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or_else(|| panic!("no value for {name} in {stdout:?}"))
}

#[test]
fn counts_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mmap.persistent");

    assert_eq!(run(&path), (23, 42));
    assert_eq!(run(&path), (24, 42));
    assert_eq!(run(&path), (25, 42));

    std::fs::remove_file(&path).unwrap();
    assert_eq!(run(&path), (23, 42));
}

#[test]
fn file_from_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("from-env.persistent");

    counter().arg("run").env("PMEM_FILE", &path).assert().success();
    assert!(path.exists());
    assert_eq!(run(&path).0, 24);
}

#[test]
fn inspect_reads_without_binding() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inspect.persistent");

    run(&path);
    run(&path);

    let assert = counter().arg("inspect").arg(&path).assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(stdout.lines().any(|line| line == "counter = 25"), "{stdout}");

    // The file has exactly the size a bind gives it.
    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    assert!(!stderr.contains("file size differs"), "{stderr}");

    // Inspecting does not modify the file.
    assert_eq!(run(&path).0, 25);
}

#[test]
fn inspect_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty");
    std::fs::write(&path, b"").unwrap();

    let assert = counter().arg("inspect").arg(&path).assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(stdout.contains("counter = <missing>"), "{stdout}");

    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    assert!(stderr.contains("file size differs"), "{stderr}");
}

#[test]
fn bind_failure_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("mmap.persistent");

    let assert = counter().arg("run").arg("--file").arg(&path).assert().failure();
    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    assert!(stderr.contains("failed to open backing file"), "{stderr}");
    assert!(stderr.contains("os error"), "{stderr}");
}

#[cfg(target_os = "linux")]
#[test]
fn maps_mark_the_region() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("maps.persistent");

    let assert = counter()
        .arg("run")
        .arg("--maps")
        .arg("--file")
        .arg(&path)
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    let marked: Vec<_> = stdout.lines().filter(|line| line.starts_with('*')).collect();
    assert_eq!(marked.len(), 1, "{stdout}");
    assert!(marked[0].contains("rw-s") && marked[0].ends_with("maps.persistent"), "{stdout}");
}
