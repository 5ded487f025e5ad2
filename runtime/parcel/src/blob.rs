//! Blob Path - Large payloads inline or through shared memory
//!
//! A blob is a discriminant word followed by either the bytes themselves
//! or a descriptor for an anonymous shared-memory region. Small blobs, and
//! every blob in a parcel that disallows descriptors, are written inline.
//! Mappings are unmapped when the blob value is dropped.

use std::os::fd::AsRawFd;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::arena::check_len;
use crate::parcel::Parcel;
use crate::{os, ParcelError, Result};

/// Blob discriminants
pub const BLOB_INPLACE: i32 = 0;
pub const BLOB_SHARED_IMMUTABLE: i32 = 1;
pub const BLOB_SHARED_MUTABLE: i32 = 2;

/// Destination returned by [`Parcel::write_blob`]
#[derive(Debug)]
pub enum WritableBlob<'a> {
    /// Bytes reserved inside the parcel
    Inplace(&'a mut [u8]),
    /// Read-write mapping of a shared region; `mutable` says whether the
    /// receiver may map it writable too
    Shared { map: MmapMut, mutable: bool },
}

impl WritableBlob<'_> {
    pub fn data(&mut self) -> &mut [u8] {
        match self {
            WritableBlob::Inplace(data) => data,
            WritableBlob::Shared { map, .. } => &mut map[..],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WritableBlob::Inplace(data) => data.len(),
            WritableBlob::Shared { map, .. } => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, WritableBlob::Shared { .. })
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self, WritableBlob::Shared { mutable: true, .. })
    }
}

/// Source returned by [`Parcel::read_blob`]
#[derive(Debug)]
pub enum ReadableBlob<'a> {
    Inplace(&'a [u8]),
    Shared(Mmap),
    /// Region the writer shared as mutable; writes are seen by the peer
    SharedMut(MmapMut),
}

impl ReadableBlob<'_> {
    pub fn data(&self) -> &[u8] {
        match self {
            ReadableBlob::Inplace(data) => data,
            ReadableBlob::Shared(map) => &map[..],
            ReadableBlob::SharedMut(map) => &map[..],
        }
    }

    /// Writable view, only for regions shared as mutable
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            ReadableBlob::SharedMut(map) => Some(&mut map[..]),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self, ReadableBlob::SharedMut(_))
    }
}

fn map_failed(len: usize, err: std::io::Error) -> ParcelError {
    log::error!("Failed to map {} byte blob region: {}", len, err);
    ParcelError::ResourceExhausted { requested: len }
}

impl Parcel {
    /// Reserve a `len` byte blob at the cursor
    ///
    /// Blobs above the configured inline limit go to a fresh shared region
    /// when descriptors are allowed. With `mutable_copy` false the region
    /// is sealed so the receiver can only map it read-only.
    ///
    /// # Errors
    /// - `InvalidArgument` if `len` exceeds `i32::MAX`.
    /// - `ResourceExhausted` if the region cannot be mapped.
    /// - `Os` if the region cannot be created.
    pub fn write_blob(&mut self, len: usize, mutable_copy: bool) -> Result<WritableBlob<'_>> {
        check_len(len, "blob length")?;

        if !self.allow_fds || len <= self.config.blob_inplace_limit {
            log::trace!("{:?}: writing {} byte blob in place", self.owner, len);
            self.write_i32(BLOB_INPLACE)?;
            return Ok(WritableBlob::Inplace(self.write_inplace(len)?));
        }

        log::trace!("{:?}: writing {} byte blob to shared memory", self.owner, len);
        let fd = os::create_shared_region(len)?;
        // SAFETY: the region was just created and is only resized through
        // seals that forbid it
        let map = unsafe { MmapOptions::new().len(len).map_mut(&fd) }
            .map_err(|err| map_failed(len, err))?;
        if !mutable_copy {
            os::seal_future_write(fd.as_raw_fd());
        }

        self.write_i32(if mutable_copy {
            BLOB_SHARED_MUTABLE
        } else {
            BLOB_SHARED_IMMUTABLE
        })?;
        self.write_owned_file_descriptor(fd)?;
        Ok(WritableBlob::Shared {
            map,
            mutable: mutable_copy,
        })
    }

    /// Read a blob of `len` bytes written by [`Parcel::write_blob`]
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown discriminant, a missing or invalid
    /// descriptor, or a shared region smaller than `len`.
    pub fn read_blob(&mut self, len: usize) -> Result<ReadableBlob<'_>> {
        let kind = self.read_i32()?;
        let mutable = match kind {
            BLOB_INPLACE => return Ok(ReadableBlob::Inplace(self.read_inplace(len)?)),
            BLOB_SHARED_IMMUTABLE => false,
            BLOB_SHARED_MUTABLE => true,
            other => {
                log::error!("Unknown blob type {}", other);
                return Err(ParcelError::InvalidArgument { what: "blob type" });
            }
        };

        let fd = self
            .read_file_descriptor()
            .map_err(|_| ParcelError::InvalidArgument {
                what: "blob descriptor",
            })?;
        if !os::is_valid_fd(fd) {
            log::error!("Blob descriptor {} is not open", fd);
            return Err(ParcelError::InvalidArgument {
                what: "blob descriptor",
            });
        }
        let size = os::fd_size(fd)?;
        if size < len {
            log::error!("Requested blob size {} exceeds region size {}", len, size);
            return Err(ParcelError::InvalidArgument { what: "blob size" });
        }

        let mut options = MmapOptions::new();
        options.len(len);
        // SAFETY: the region is sealed against shrinking, so the mapping
        // never extends past its end
        if mutable {
            let map = unsafe { options.map_mut(fd) }.map_err(|err| map_failed(len, err))?;
            Ok(ReadableBlob::SharedMut(map))
        } else {
            let map = unsafe { options.map(fd) }.map_err(|err| map_failed(len, err))?;
            Ok(ReadableBlob::Shared(map))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParcelConfig;

    #[test]
    fn test_small_blob_inline() {
        let mut parcel = Parcel::new();
        {
            let mut blob = parcel.write_blob(6, false).unwrap();
            assert!(!blob.is_shared());
            blob.data().copy_from_slice(b"abcdef");
        }
        assert_eq!(parcel.data_size(), 4 + 8);
        parcel.set_data_position(0);
        let blob = parcel.read_blob(6).unwrap();
        assert_eq!(blob.data(), b"abcdef");
    }

    #[test]
    fn test_large_blob_inline_without_fds() {
        let mut parcel = Parcel::with_config(ParcelConfig::default().with_blob_inplace_limit(16));
        parcel.set_allow_fds(false);
        let blob = parcel.write_blob(64, true).unwrap();
        assert!(!blob.is_shared());
        assert_eq!(blob.len(), 64);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_shared_blob_round_trip() {
        let mut parcel = Parcel::with_config(ParcelConfig::default().with_blob_inplace_limit(16));
        {
            let mut blob = parcel.write_blob(4096, false).unwrap();
            assert!(blob.is_shared());
            assert!(!blob.is_mutable());
            blob.data()[..5].copy_from_slice(b"hello");
        }
        assert!(parcel.has_file_descriptors());

        parcel.set_data_position(0);
        let blob = parcel.read_blob(4096).unwrap();
        assert!(!blob.is_mutable());
        assert_eq!(&blob.data()[..5], b"hello");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_shared_blob_too_small() {
        let mut parcel = Parcel::with_config(ParcelConfig::default().with_blob_inplace_limit(16));
        parcel.write_blob(4096, true).unwrap();
        parcel.set_data_position(0);
        assert!(matches!(
            parcel.read_blob(8192),
            Err(ParcelError::InvalidArgument { what: "blob size" })
        ));
    }

    #[test]
    fn test_unknown_blob_type() {
        let mut parcel = Parcel::new();
        parcel.write_i32(7).unwrap();
        parcel.set_data_position(0);
        assert!(matches!(
            parcel.read_blob(4),
            Err(ParcelError::InvalidArgument { what: "blob type" })
        ));
    }
}
