//! Replace the memory of a region with a file mapping.
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::{MapError, Region};

/// The reason a [`Region::bind`] did not succeed.
#[derive(Debug)]
pub enum BindError {
    /// The backing file could not be opened or created.
    OpenFailed(io::Error),
    /// The backing file could not be sized to the region, or is not a regular file.
    ResizeFailed(io::Error),
    /// The file could not be mapped at the region's address.
    ///
    /// Note that the file has already been resized when this is returned. The region keeps its
    /// previous contents in private memory and stays usable.
    MapFailed(MapError),
    /// The region is already backed by a file.
    AlreadyBound,
}

impl Region {
    /// Back this region with the file at `path`.
    ///
    /// The file is created if missing and then always resized to exactly [`Region::size`]. Bytes
    /// beyond that size are discarded, missing bytes read as zero. The file size snaps to the
    /// region size on every bind, so a build whose layout differs from the one that wrote the file
    /// silently reinterprets (or truncates) the persisted bytes.
    ///
    /// A file that was empty before the resize is initialized with the current contents of the
    /// region, i.e. the initial values of all declared fields.
    ///
    /// On success every access to the region is an access to the file through the page cache. The
    /// file descriptor is closed before returning; the mapping stays valid until the region is
    /// dropped.
    ///
    /// Nothing coordinates with other processes binding the same file. Their writes race.
    pub fn bind(&mut self, path: impl AsRef<Path>) -> Result<(), BindError> {
        let path = path.as_ref();

        if self.is_bound() {
            return Err(BindError::AlreadyBound);
        }

        let size = self.size();
        if size == 0 || self.start() % self.page_size() != 0 {
            return Err(BindError::MapFailed(MapError(libc::EINVAL)));
        }

        // Closed on every path out of this function.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o666)
            .open(path)
            .map_err(BindError::OpenFailed)?;

        tracing::debug!(path = %path.display(), "opened backing file");

        let metadata = file.metadata().map_err(BindError::ResizeFailed)?;
        if !metadata.is_file() {
            return Err(BindError::ResizeFailed(io::Error::from_raw_os_error(libc::EINVAL)));
        }

        let previous = metadata.len();
        let target = u64::try_from(size)
            .map_err(|_| BindError::ResizeFailed(io::Error::from_raw_os_error(libc::EFBIG)))?;

        if previous != 0 && previous != target {
            tracing::warn!(
                path = %path.display(),
                previous,
                size = target,
                "backing file size differs from the region, persisted bytes may be reinterpreted"
            );
        }

        if previous == 0 {
            seed(&file, self.bytes()).map_err(BindError::ResizeFailed)?;
            tracing::debug!(size, "initialized fresh backing file");
        }

        file.set_len(target).map_err(BindError::ResizeFailed)?;

        // A failed MAP_FIXED may already have removed the old pages.
        let image = self.bytes().to_vec();

        // Safety: we own the reservation and hold `self` uniquely, no reference into it is alive.
        let mapped = unsafe { self.mapper().map_fixed(self.start_ptr(), size, file.as_raw_fd()) };
        if let Err(err) = mapped {
            self.restore(&image);
            return Err(BindError::MapFailed(err));
        }

        tracing::debug!(start = ?self.start_ptr(), size, "mapped backing file");
        self.set_backing(path);
        Ok(())
    }
}

impl Region {
    /// Put private memory holding `image` back in place of the region's pages.
    fn restore(&mut self, image: &[u8]) {
        // Safety: the range is ours and, after a failed map, possibly unmapped.
        let reserved = unsafe { self.mapper().reserve_fixed(self.start_ptr(), image.len()) };
        if let Err(err) = reserved {
            // The bounds must stay mapped while the region exists.
            panic!("lost the region at {:#x} after a failed map: {err}", self.start());
        }

        self.bytes_mut().copy_from_slice(image);
        tracing::debug!(start = ?self.start_ptr(), "restored private region after failed map");
    }
}

/// Write the initial image into an empty file.
///
/// On failure the file is emptied again and the next bind seeds it anew.
fn seed(file: &File, image: &[u8]) -> io::Result<()> {
    if let Err(err) = file.write_all_at(image, 0) {
        if let Err(truncate) = file.set_len(0) {
            tracing::warn!(%truncate, "failed to empty partially initialized backing file");
        }
        return Err(err);
    }

    Ok(())
}

impl BindError {
    /// The step of the bind that failed.
    pub fn step(&self) -> &'static str {
        match self {
            BindError::OpenFailed(_) => "open",
            BindError::ResizeFailed(_) => "resize",
            BindError::MapFailed(_) => "map",
            BindError::AlreadyBound => "bind",
        }
    }

    /// The OS error code of the failing call, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            BindError::OpenFailed(err) | BindError::ResizeFailed(err) => err.raw_os_error(),
            BindError::MapFailed(err) => Some(err.errno()),
            BindError::AlreadyBound => None,
        }
    }
}

impl core::fmt::Display for BindError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BindError::OpenFailed(err) => write!(f, "failed to open backing file: {err}"),
            BindError::ResizeFailed(err) => write!(f, "failed to resize backing file: {err}"),
            BindError::MapFailed(err) => write!(f, "failed to map backing file at the region: {err}"),
            BindError::AlreadyBound => write!(f, "region is already bound to a file"),
        }
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BindError::OpenFailed(err) | BindError::ResizeFailed(err) => Some(err),
            BindError::MapFailed(err) => Some(err),
            BindError::AlreadyBound => None,
        }
    }
}

#[test]
fn error_names_step() {
    let err = BindError::OpenFailed(io::Error::from_raw_os_error(libc::ENOENT));
    assert_eq!(err.step(), "open");
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    assert!(err.to_string().starts_with("failed to open backing file: "));

    let err = BindError::MapFailed(MapError(libc::EINVAL));
    assert_eq!(err.step(), "map");
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

    assert_eq!(BindError::AlreadyBound.raw_os_error(), None);
}

#[test]
fn failed_seed_leaves_file_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seed.persistent");
    std::fs::write(&path, b"").unwrap();

    // Writing through a read-only handle fails before any byte lands.
    let read_only = File::open(&path).unwrap();
    let err = seed(&read_only, &[23; 16]).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    drop(read_only);

    // So the next bind still sees a fresh file and initializes it.
    let mapper = crate::Mapper::new();
    let mut region = Region::reserve(4, &mapper).unwrap();
    region.bytes_mut()[0] = 23;
    region.bind(&path).unwrap();
    assert_eq!(region.bytes()[0], 23);
}

#[test]
fn seed_fills_an_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seed.persistent");
    let file = OpenOptions::new().create(true).read(true).write(true).open(&path).unwrap();

    seed(&file, &[7; 32]).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), [7; 32]);
}
