//! Inspect the memory map of the current process.
//!
//! This is a debugging aid to verify that a bound region is in fact a shared file mapping. It
//! reads `/proc/self/maps` and is unsupported where no such file exists.
use alloc::{string::String, vec::Vec};
use std::io;

use crate::Region;

/// One line of `/proc/self/maps`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    /// Permissions such as `rw-s`, the last character is `s` for shared and `p` for private.
    pub perms: String,
    pub offset: u64,
    pub path: Option<String>,
}

/// Read all mappings of the current process.
pub fn self_maps() -> io::Result<Vec<MapEntry>> {
    let text = match std::fs::read_to_string("/proc/self/maps") {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no /proc/self/maps on this platform",
            ))
        }
        other => other?,
    };

    Ok(text.lines().filter_map(MapEntry::parse).collect())
}

impl MapEntry {
    /// Parse a line like `7f00c0000000-7f00c0001000 rw-s 00000000 fd:01 1234  /tmp/file`.
    pub fn parse(line: &str) -> Option<Self> {
        let (range, rest) = token(line)?;
        let (perms, rest) = token(rest)?;
        let (offset, rest) = token(rest)?;
        let (_device, rest) = token(rest)?;
        let (_inode, rest) = token(rest)?;
        let path = rest.trim();

        let (start, end) = range.split_once('-')?;

        Some(MapEntry {
            start: usize::from_str_radix(start, 16).ok()?,
            end: usize::from_str_radix(end, 16).ok()?,
            perms: perms.into(),
            offset: u64::from_str_radix(offset, 16).ok()?,
            path: (!path.is_empty()).then(|| path.into()),
        })
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_shared(&self) -> bool {
        self.perms.as_bytes().get(3) == Some(&b's')
    }

    pub fn overlaps(&self, region: &Region) -> bool {
        self.start < region.end() && region.start() < self.end
    }
}

fn token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }

    Some(s.split_once(' ').unwrap_or((s, "")))
}

impl core::fmt::Display for MapEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:016x} {:>8}K {} {}",
            self.start,
            self.len() / 1024,
            self.perms,
            self.path.as_deref().unwrap_or("[ anon ]"),
        )
    }
}

#[test]
fn parse_file_mapping() {
    let line = "7f3e5c000000-7f3e5c001000 rw-s 00000000 fd:01 393228                     /tmp/with space/mmap.persistent";
    let entry = MapEntry::parse(line).unwrap();
    assert_eq!(entry.start, 0x7f3e5c000000);
    assert_eq!(entry.end, 0x7f3e5c001000);
    assert_eq!(entry.len(), 0x1000);
    assert_eq!(entry.perms, "rw-s");
    assert_eq!(entry.offset, 0);
    assert!(entry.is_shared());
    assert_eq!(entry.path.as_deref(), Some("/tmp/with space/mmap.persistent"));
}

#[test]
fn parse_anonymous_mapping() {
    let line = "7ffd1a2b3000-7ffd1a2b5000 rw-p 00000000 00:00 0 ";
    let entry = MapEntry::parse(line).unwrap();
    assert!(!entry.is_shared());
    assert_eq!(entry.path, None);
    assert!(entry.to_string().ends_with("[ anon ]"));

    assert_eq!(MapEntry::parse(""), None);
    assert_eq!(MapEntry::parse("zzzz-0000 rw-p 0 00:00 0"), None);
}

#[cfg(target_os = "linux")]
#[test]
fn own_region_is_listed() {
    let mapper = crate::Mapper::new();
    let region = Region::reserve(0, &mapper).unwrap();
    let maps = self_maps().unwrap();
    assert!(maps.iter().any(|entry| entry.overlaps(&region)));
}
