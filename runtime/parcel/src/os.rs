//! OS shim - Descriptor duplication/closing and shared-memory regions
//!
//! Thin wrappers over libc so the rest of the crate deals in `Result`s and
//! `OwnedFd`s. Descriptors received over the wire are arbitrary integers,
//! so none of these helpers assume the number is valid.

use std::ffi::CStr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::{ParcelError, Result};

/// Name shown in /proc for blob regions
const REGION_NAME: &CStr = match CStr::from_bytes_with_nul(b"Parcel Blob\0") {
    Ok(name) => name,
    Err(_) => panic!("region name must be nul terminated"),
};

// F_SEAL_FUTURE_WRITE (Linux 5.1)
const F_SEAL_FUTURE_WRITE: libc::c_int = 0x0010;

/// Duplicate `fd` with close-on-exec set
pub fn dup_fd(fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: fcntl has no memory-safety preconditions; an invalid fd
    // yields EBADF
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        let err = ParcelError::last_os_error("dup");
        log::error!("Failed to duplicate fd {}: {}", fd, err);
        return Err(err);
    }
    // SAFETY: `dup` is a fresh descriptor nobody else owns
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Close a descriptor the caller owns; negative values are ignored
pub fn close_fd(fd: RawFd) {
    if fd < 0 {
        return;
    }
    // SAFETY: the caller owns `fd` and never uses it again
    if unsafe { libc::close(fd) } != 0 {
        log::warn!("close({}) failed: {}", fd, ParcelError::last_os_error("close"));
    }
}

/// Whether `fd` names an open descriptor
pub fn is_valid_fd(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only queries descriptor flags
    fd >= 0 && unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1
}

/// Size of the file behind `fd`
pub fn fd_size(fd: RawFd) -> Result<usize> {
    // SAFETY: `stat` is plain data; fstat fills it or fails
    let mut stat: libc::stat = unsafe { core::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(ParcelError::last_os_error("fstat"));
    }
    usize::try_from(stat.st_size).map_err(|_| ParcelError::InvalidArgument { what: "region size" })
}

/// Create an anonymous shared-memory region of `len` bytes
///
/// The region is sealed against resizing so a peer cannot truncate it
/// underneath a mapping.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn create_shared_region(len: usize) -> Result<OwnedFd> {
    // SAFETY: REGION_NAME is a valid nul-terminated string
    let raw = unsafe {
        libc::memfd_create(
            REGION_NAME.as_ptr(),
            libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
        )
    };
    if raw < 0 {
        return Err(ParcelError::last_os_error("memfd_create"));
    }
    // SAFETY: `raw` was just created and is owned here
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let size = libc::off_t::try_from(len)
        .map_err(|_| ParcelError::ResourceExhausted { requested: len })?;
    if unsafe { libc::ftruncate(raw, size) } != 0 {
        return Err(ParcelError::last_os_error("ftruncate"));
    }
    if unsafe { libc::fcntl(raw, libc::F_ADD_SEALS, libc::F_SEAL_SHRINK | libc::F_SEAL_GROW) } != 0 {
        return Err(ParcelError::last_os_error("seal"));
    }
    Ok(fd)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn create_shared_region(_len: usize) -> Result<OwnedFd> {
    Err(ParcelError::Os {
        op: "memfd_create",
        errno: libc::ENOSYS,
    })
}

/// Forbid new writable mappings of a region
///
/// Kernels without F_SEAL_FUTURE_WRITE leave the region writable; that is
/// logged, not treated as a failure.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn seal_future_write(fd: RawFd) {
    // SAFETY: fcntl has no memory-safety preconditions
    if unsafe { libc::fcntl(fd, libc::F_ADD_SEALS, F_SEAL_FUTURE_WRITE) } != 0 {
        log::warn!(
            "Could not seal blob region read-only: {}",
            ParcelError::last_os_error("seal")
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn seal_future_write(_fd: RawFd) {}

/// Write all of `bytes` to `fd`, retrying on EINTR
pub fn write_all(fd: RawFd, bytes: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        let rest = &bytes[written..];
        // SAFETY: `rest` is a valid readable slice
        let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ParcelError::Os {
                op: "write",
                errno: err.raw_os_error().unwrap_or(libc::EIO),
            });
        }
        written += n as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn dev_null() -> OwnedFd {
        std::fs::File::open("/dev/null").unwrap().into()
    }

    #[test]
    fn test_dup_produces_distinct_descriptor() {
        let fd = dev_null();
        let dup = dup_fd(fd.as_raw_fd()).unwrap();
        assert_ne!(dup.as_raw_fd(), fd.as_raw_fd());
        assert!(is_valid_fd(dup.as_raw_fd()));
    }

    #[test]
    fn test_dup_invalid_descriptor() {
        assert!(matches!(
            dup_fd(-1),
            Err(ParcelError::Os { op: "dup", errno }) if errno == libc::EBADF
        ));
    }

    #[test]
    fn test_close_negative_is_noop() {
        close_fd(-1);
        assert!(!is_valid_fd(-1));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_shared_region_size() {
        let fd = create_shared_region(8192).unwrap();
        assert_eq!(fd_size(fd.as_raw_fd()).unwrap(), 8192);
    }
}
