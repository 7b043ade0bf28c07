use alloc::sync::Arc;
use core::ffi::{c_int, c_void};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A table of OS functions.
///
/// Every function must behave like the correspondingly named POSIX call with the flags noted on
/// the field. [`Mapper::new`] fills the table from `libc`. You're encouraged to provide your own
/// table instead of hooking the functions themselves with linker tricks, for instance to observe
/// mapping failures in a test.
#[non_exhaustive]
pub struct VTable {
    /// `mmap(NULL, len, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0)`.
    pub mmap_anonymous: fn(len: usize) -> *mut c_void,
    /// `mmap(addr, len, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED, -1, 0)`.
    pub mmap_anonymous_fixed: fn(addr: *mut c_void, len: usize) -> *mut c_void,
    /// `mmap(addr, len, PROT_READ | PROT_WRITE, MAP_SHARED | MAP_FIXED, file, 0)`.
    pub mmap_fixed: fn(addr: *mut c_void, len: usize, file: c_int) -> *mut c_void,
    pub munmap: fn(*mut c_void, usize) -> c_int,
    /// `msync(addr, len, MS_SYNC)`.
    pub msync: fn(*mut c_void, usize) -> c_int,
    pub page_size: fn() -> usize,
    pub errno: fn() -> c_int,

    pub map_failed: *mut c_void,
}

/// Shared handle to a [`VTable`].
#[derive(Clone)]
pub struct Mapper {
    inner: Arc<Inner>,
}

/// An OS error returned while creating, replacing or syncing a mapping.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MapError(pub(crate) c_int);

struct Inner {
    vtable: VTable,
}

impl Mapper {
    /// Create a `Mapper` from a customized vtable.
    ///
    /// # Safety
    ///
    /// The VTable must contain functions that implement the `mmap` interface as documented on
    /// each of its fields. In particular `mmap_anonymous` must return page-aligned memory that is
    /// not used by anything else.
    pub unsafe fn new_unchecked(vtable: VTable) -> Self {
        Mapper {
            inner: Arc::new(Inner { vtable }),
        }
    }

    pub fn new() -> Self {
        unsafe { Self::new_unchecked(VTable::new_libc()) }
    }

    pub fn page_size(&self) -> usize {
        (self.inner.vtable.page_size)()
    }

    /// Reserve `len` bytes of zeroed, private memory.
    ///
    /// The caller owns the returned range and must release it with [`Mapper::unmap`].
    pub fn reserve(&self, len: usize) -> Result<NonNull<u8>, MapError> {
        let ptr = (self.inner.vtable.mmap_anonymous)(len);

        if ptr == self.inner.vtable.map_failed {
            return Err(self.last_error());
        }

        NonNull::new(ptr as *mut u8).ok_or(MapError(libc::ENOMEM))
    }

    /// Replace the pages at `addr` with zeroed, private memory.
    ///
    /// # Safety
    ///
    /// The caller must own the address range `addr..addr+len`, mapped or not, and no reference
    /// into it may be alive.
    pub unsafe fn reserve_fixed(&self, addr: NonNull<u8>, len: usize) -> Result<(), MapError> {
        let want = addr.as_ptr() as *mut c_void;
        let ptr = (self.inner.vtable.mmap_anonymous_fixed)(want, len);

        if ptr == self.inner.vtable.map_failed {
            return Err(self.last_error());
        }

        debug_assert_eq!(ptr, want);
        Ok(())
    }

    /// Replace the pages at `addr` with a shared mapping of the first `len` bytes of `file`.
    ///
    /// # Safety
    ///
    /// The caller must own the mapping `addr..addr+len` and no reference into it may be alive.
    /// The previous contents of the pages are discarded.
    pub unsafe fn map_fixed(&self, addr: NonNull<u8>, len: usize, file: c_int) -> Result<(), MapError> {
        let want = addr.as_ptr() as *mut c_void;
        let ptr = (self.inner.vtable.mmap_fixed)(want, len, file);

        if ptr == self.inner.vtable.map_failed {
            return Err(self.last_error());
        }

        // MAP_FIXED either places the mapping where asked or fails.
        debug_assert_eq!(ptr, want);
        Ok(())
    }

    /// Flush the pages `addr..addr+len` to their backing file and wait for completion.
    pub fn sync(&self, addr: NonNull<u8>, len: usize) -> Result<(), MapError> {
        let ret = (self.inner.vtable.msync)(addr.as_ptr() as *mut c_void, len);

        if ret < 0 {
            return Err(self.last_error());
        }

        Ok(())
    }

    /// Release a mapping.
    ///
    /// # Safety
    ///
    /// The caller must own the mapping `addr..addr+len` and not use it afterwards.
    pub unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> Result<(), MapError> {
        let ret = (self.inner.vtable.munmap)(addr.as_ptr() as *mut c_void, len);

        if ret < 0 {
            return Err(self.last_error());
        }

        Ok(())
    }

    fn last_error(&self) -> MapError {
        MapError((self.inner.vtable.errno)())
    }
}

impl Default for Mapper {
    fn default() -> Self {
        Mapper::new()
    }
}

impl VTable {
    pub fn new_libc() -> Self {
        fn _mmap_anonymous(len: usize) -> *mut c_void {
            unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            }
        }

        fn _mmap_anonymous_fixed(addr: *mut c_void, len: usize) -> *mut c_void {
            unsafe {
                libc::mmap(
                    addr,
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                )
            }
        }

        fn _mmap_fixed(addr: *mut c_void, len: usize, file: c_int) -> *mut c_void {
            unsafe {
                libc::mmap(
                    addr,
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    file,
                    0,
                )
            }
        }

        fn _munmap(addr: *mut c_void, len: usize) -> c_int {
            unsafe { libc::munmap(addr, len) }
        }

        fn _msync(addr: *mut c_void, len: usize) -> c_int {
            unsafe { libc::msync(addr, len, libc::MS_SYNC) }
        }

        fn _page_size() -> usize {
            static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

            let mut size = PAGE_SIZE.load(Ordering::Relaxed);
            if size == 0 {
                let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                // POSIX requires the value to exist, fall back to the common one regardless.
                size = usize::try_from(ret).ok().filter(|v| v.is_power_of_two()).unwrap_or(4096);
                PAGE_SIZE.store(size, Ordering::Relaxed);
            }

            size
        }

        fn _errno() -> c_int {
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
        }

        VTable {
            mmap_anonymous: _mmap_anonymous,
            mmap_anonymous_fixed: _mmap_anonymous_fixed,
            mmap_fixed: _mmap_fixed,
            munmap: _munmap,
            msync: _msync,
            page_size: _page_size,
            errno: _errno,
            map_failed: libc::MAP_FAILED,
        }
    }
}

impl MapError {
    /// The `errno` reported by the failing call.
    pub fn errno(&self) -> c_int {
        self.0
    }
}

impl core::fmt::Debug for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("MapError").field(&self.0).finish()
    }
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        std::io::Error::from_raw_os_error(self.0).fmt(f)
    }
}

impl std::error::Error for MapError {}

impl From<MapError> for std::io::Error {
    fn from(err: MapError) -> Self {
        std::io::Error::from_raw_os_error(err.0)
    }
}

#[test]
fn reserve_is_page_aligned() {
    let mapper = Mapper::new();
    let page = mapper.page_size();
    assert!(page.is_power_of_two());

    let ptr = mapper.reserve(3 * page).unwrap();
    assert_eq!(ptr.as_ptr() as usize % page, 0);

    // Fresh anonymous memory is zeroed.
    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 3 * page) };
    assert!(bytes.iter().all(|&b| b == 0));

    let unmapped = unsafe { mapper.unmap(ptr, 3 * page) };
    unmapped.unwrap();
}

#[test]
fn reserve_fixed_zeroes_in_place() {
    let mapper = Mapper::new();
    let page = mapper.page_size();

    let ptr = mapper.reserve(page).unwrap();
    unsafe { ptr.as_ptr().write(0xab) };

    let replaced = unsafe { mapper.reserve_fixed(ptr, page) };
    replaced.unwrap();
    assert_eq!(unsafe { ptr.as_ptr().read() }, 0);

    let unmapped = unsafe { mapper.unmap(ptr, page) };
    unmapped.unwrap();
}

#[test]
fn map_error_names_os_error() {
    let err = MapError(libc::EINVAL);
    assert_eq!(err.errno(), libc::EINVAL);
    let io: std::io::Error = err.into();
    assert_eq!(io.raw_os_error(), Some(libc::EINVAL));
}
