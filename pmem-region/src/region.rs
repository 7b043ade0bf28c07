//! The reserved, page-aligned span of address space.
use core::ptr::NonNull;
use std::path::{Path, PathBuf};

use crate::{MapError, Mapper};

/// A contiguous, page-aligned span of process memory.
///
/// Initially the span is private anonymous memory. After a successful [`Region::bind`] the same
/// addresses are backed by a file instead. The bounds never move while the region exists.
///
/// There is no way to clone a region and binding requires a unique borrow, so the owner of this
/// value is the only party in the process deciding what the span is backed by.
pub struct Region {
    start: NonNull<u8>,
    end: NonNull<u8>,
    mapper: Mapper,
    backing: Option<PathBuf>,
}

/// Human readable description of the region bounds.
pub struct Report<'lt> {
    start: usize,
    end: usize,
    page_size: usize,
    backing: Option<&'lt Path>,
}

/// The size of a region covering `len` bytes: whole pages, at least one.
///
/// This is also the size every bound backing file snaps to. `None` if the size is not
/// addressable.
pub fn region_len(len: usize, page_size: usize) -> Option<usize> {
    len.max(1)
        .checked_next_multiple_of(page_size)
        .filter(|&size| size <= isize::MAX as usize)
}

impl Region {
    /// Reserve a region covering at least `len` bytes.
    ///
    /// The size is rounded up to whole pages and is never smaller than one page.
    pub fn reserve(len: usize, mapper: &Mapper) -> Result<Self, MapError> {
        let page_size = mapper.page_size();
        let size = region_len(len, page_size).ok_or(MapError(libc::ENOMEM))?;

        let start = mapper.reserve(size)?;

        if start.as_ptr() as usize % page_size != 0 {
            // Safety: we just created this mapping and nothing refers to it.
            let _ = unsafe { mapper.unmap(start, size) };
            return Err(MapError(libc::EINVAL));
        }

        // Safety: the reservation is `size` bytes long, one-past-the-end is in bounds.
        let end = unsafe { NonNull::new_unchecked(start.as_ptr().add(size)) };

        tracing::debug!(start = ?start.as_ptr(), size, "reserved region");

        Ok(Region {
            start,
            end,
            mapper: mapper.clone(),
            backing: None,
        })
    }

    pub fn start(&self) -> usize {
        self.start.as_ptr() as usize
    }

    pub fn end(&self) -> usize {
        self.end.as_ptr() as usize
    }

    /// The size in bytes, always a whole number of pages.
    pub fn size(&self) -> usize {
        self.end() - self.start()
    }

    pub fn page_size(&self) -> usize {
        self.mapper.page_size()
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.start()..self.end()).contains(&addr)
    }

    /// The file backing this region, if it was bound.
    pub fn backing(&self) -> Option<&Path> {
        self.backing.as_deref()
    }

    pub fn is_bound(&self) -> bool {
        self.backing.is_some()
    }

    pub fn bytes(&self) -> &[u8] {
        // Safety: the whole span is mapped readable for as long as `self` lives.
        unsafe { core::slice::from_raw_parts(self.start.as_ptr(), self.size()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: the whole span is mapped writable and `self` is borrowed uniquely.
        unsafe { core::slice::from_raw_parts_mut(self.start.as_ptr(), self.size()) }
    }

    /// Write all modified pages to the backing file and wait for the write to complete.
    ///
    /// Without this, writes reach the file whenever the page cache decides to flush them.
    pub fn flush(&self) -> Result<(), MapError> {
        self.mapper.sync(self.start, self.size())
    }

    pub fn report(&self) -> Report<'_> {
        Report {
            start: self.start(),
            end: self.end(),
            page_size: self.page_size(),
            backing: self.backing(),
        }
    }

    pub(crate) fn start_ptr(&self) -> NonNull<u8> {
        self.start
    }

    pub(crate) fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub(crate) fn set_backing(&mut self, path: &Path) {
        self.backing = Some(path.to_owned());
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let size = self.size();
        // Safety: no more references to this region of memory.
        if let Err(err) = unsafe { self.mapper.unmap(self.start, size) } {
            tracing::warn!(%err, "failed to unmap region");
        }
    }
}

impl core::fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let size = self.end - self.start;
        write!(
            f,
            "region persistent: {:#x}--{:#x} ({} bytes, {} pages)",
            self.start,
            self.end,
            size,
            size / self.page_size,
        )?;

        match self.backing {
            Some(path) => write!(f, " backed by {}", path.display()),
            None => write!(f, " unbound"),
        }
    }
}

#[test]
fn empty_region_is_one_page() {
    let mapper = Mapper::new();
    let region = Region::reserve(0, &mapper).unwrap();
    assert_eq!(region.size(), mapper.page_size());
    assert_eq!(region.start() % mapper.page_size(), 0);
    assert_eq!(region.end() % mapper.page_size(), 0);
    assert!(!region.is_bound());
}

#[test]
fn size_rounds_to_pages() {
    let mapper = Mapper::new();
    let page = mapper.page_size();

    for (len, pages) in [(1, 1), (page, 1), (page + 1, 2), (3 * page - 1, 3)] {
        let region = Region::reserve(len, &mapper).unwrap();
        assert_eq!(region.size(), pages * page, "for length {len}");
        assert_eq!(region.size() % page, 0);
        assert_eq!(region.start() % page, 0);
        assert!(region.contains(region.start()));
        assert!(!region.contains(region.end()));
    }
}

#[test]
fn region_len_matches_reservation() {
    let mapper = Mapper::new();
    let page = mapper.page_size();

    for len in [0, 1, page, page + 1] {
        let region = Region::reserve(len, &mapper).unwrap();
        assert_eq!(region_len(len, page), Some(region.size()), "for length {len}");
    }

    assert_eq!(region_len(usize::MAX, page), None);
}

#[test]
fn report_names_bounds() {
    let mapper = Mapper::new();
    let region = Region::reserve(0, &mapper).unwrap();
    let text = region.report().to_string();
    assert!(text.contains(&format!("{:#x}--{:#x}", region.start(), region.end())), "{text}");
    assert!(text.contains("1 pages") && text.ends_with("unbound"), "{text}");
}
