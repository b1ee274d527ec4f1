use std::ffi::{CStr, CString};
use std::io;
use std::ptr::NonNull;

/// Which stage of a segment operation failed. Lets attachment report
/// open failures, mapping failures, and undersized objects as distinct
/// error kinds.
#[derive(Debug)]
pub(crate) enum SegmentError {
    Open(io::Error),
    Map(io::Error),
    TooSmall(usize),
}

/// An owned `mmap` of a POSIX shared-memory object.
///
/// The backing file descriptor is closed as soon as the mapping exists;
/// the mapping stays valid until dropped, and keeps the underlying object
/// alive even after `shm_unlink`.
#[derive(Debug)]
pub(crate) struct ShmMapping {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}

impl ShmMapping {
    #[inline]
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for ShmMapping {
    /// Unmaps the region.
    ///
    /// # Panics
    ///
    /// Panics if `munmap` fails. Leaking or corrupting a shared mapping can
    /// break other processes attached to the same segment, so this is
    /// treated as unrecoverable.
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.ptr.as_ptr().cast(), self.len) == -1 {
                panic!(
                    "ShmMapping::drop failed: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }
}

/// Normalizes a topic into a POSIX shared-memory object name.
///
/// A leading `'/'` is prepended when missing. Names must contain no other
/// `'/'` and no NUL bytes.
pub(crate) fn segment_name(topic: &str) -> io::Result<CString> {
    let bare = topic.strip_prefix('/').unwrap_or(topic);
    if bare.is_empty() || bare.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid topic name {topic:?}"),
        ));
    }
    CString::new(format!("/{bare}"))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "topic name contains NUL"))
}

/// Creates a fresh shared-memory object of exactly `len` bytes and maps it
/// read-write.
///
/// Any stale object with the same name is unlinked first; `O_EXCL` then
/// guarantees this process is the sole creator, so a racing second producer
/// fails with [`SegmentError::Open`]. `ftruncate` on the new object
/// zero-fills it.
pub(crate) fn create_segment(name: &CStr, len: usize) -> Result<ShmMapping, SegmentError> {
    unsafe {
        libc::shm_unlink(name.as_ptr());

        let fd = libc::shm_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        );
        if fd == -1 {
            return Err(SegmentError::Open(io::Error::last_os_error()));
        }

        if libc::ftruncate(fd, len as libc::off_t) == -1 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            libc::shm_unlink(name.as_ptr());
            return Err(SegmentError::Open(err));
        }

        map_fd(fd, len).map_err(|err| {
            libc::shm_unlink(name.as_ptr());
            err
        })
    }
}

/// Opens an existing shared-memory object and maps its full reported size.
///
/// Returns the mapping together with the object's actual size so callers
/// can validate geometry. Fails with [`SegmentError::TooSmall`] before
/// mapping if the object cannot even hold `min_len` bytes; mapping past the
/// end of the object would make later accesses fault.
pub(crate) fn open_segment(
    name: &CStr,
    min_len: usize,
) -> Result<(ShmMapping, usize), SegmentError> {
    unsafe {
        let fd = libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o600);
        if fd == -1 {
            return Err(SegmentError::Open(io::Error::last_os_error()));
        }

        let mut st: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut st) == -1 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(SegmentError::Open(err));
        }
        let actual = st.st_size as usize;
        if actual < min_len {
            libc::close(fd);
            return Err(SegmentError::TooSmall(actual));
        }

        let map = map_fd(fd, actual)?;
        Ok((map, actual))
    }
}

/// Removes a shared-memory object by name. Succeeds if the object does not
/// exist.
pub(crate) fn unlink_segment(name: &CStr) -> io::Result<()> {
    unsafe {
        if libc::shm_unlink(name.as_ptr()) == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Maps `len` bytes of `fd` read-write and closes the descriptor.
unsafe fn map_fd(fd: libc::c_int, len: usize) -> Result<ShmMapping, SegmentError> {
    unsafe {
        let addr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(SegmentError::Map(err));
        }
        libc::close(fd); // mapping stays valid

        Ok(ShmMapping {
            ptr: NonNull::new_unchecked(addr.cast()),
            len,
        })
    }
}
