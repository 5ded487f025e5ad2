//! Buffer Arena - Byte region with an external-ownership handoff
//!
//! The arena owns (or borrows) the parcel's data bytes and tracks the
//! logical size and cursor. It knows nothing about special objects; the
//! parcel layers object bookkeeping on top of the resize primitives here.
//!
//! Owned storage is a `Vec<u8>` whose length is the capacity. Bytes past
//! the logical size are always initialized (zero or stale payload), so any
//! slice up to the capacity is safe to hand out.

use core::sync::atomic::{compiler_fence, AtomicUsize, Ordering};

use crate::{ParcelError, Result};

/// Smallest capacity ever allocated by tail growth
pub const MIN_CAPACITY: usize = 128;

/// Lengths above this are negative values reinterpreted as unsigned
pub(crate) const MAX_LEN: usize = i32::MAX as usize;

static GLOBAL_ALLOC_COUNT: AtomicUsize = AtomicUsize::new(0);
static GLOBAL_ALLOC_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Number of live internally-owned parcel buffers in this process
pub fn global_alloc_count() -> usize {
    GLOBAL_ALLOC_COUNT.load(Ordering::Relaxed)
}

/// Total bytes held by internally-owned parcel buffers in this process
pub fn global_alloc_size() -> usize {
    GLOBAL_ALLOC_SIZE.load(Ordering::Relaxed)
}

/// Buffer handed back to an external owner when the parcel lets go of it
#[derive(Debug)]
pub struct ReleasedBuffer {
    /// The bytes originally adopted by the parcel
    pub data: Box<[u8]>,

    /// Object offsets (kernel) or positions (RPC) that were recorded
    pub objects: Vec<u64>,
}

/// Callback that returns a borrowed buffer to its owner
pub type ReleaseFn = Box<dyn FnOnce(ReleasedBuffer) + Send>;

pub(crate) enum Storage {
    Owned(Vec<u8>),
    Borrowed { data: Box<[u8]>, release: ReleaseFn },
}

pub(crate) struct Arena {
    storage: Storage,
    /// Logical end of written data
    pub(crate) size: usize,
    /// Read/write cursor
    pub(crate) pos: usize,
    /// Zero memory before it is discarded
    pub(crate) sensitive: bool,
}

impl Arena {
    pub(crate) fn new() -> Self {
        Self {
            storage: Storage::Owned(Vec::new()),
            size: 0,
            pos: 0,
            sensitive: false,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Owned(buf) => buf.len(),
            Storage::Borrowed { data, .. } => data.len(),
        }
    }

    /// Every byte up to the capacity
    pub(crate) fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(buf) => buf,
            Storage::Borrowed { data, .. } => data,
        }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Owned(buf) => buf,
            Storage::Borrowed { data, .. } => data,
        }
    }

    pub(crate) fn is_borrowed(&self) -> bool {
        matches!(self.storage, Storage::Borrowed { .. })
    }

    /// Owned storage that has never been allocated (or was freed)
    pub(crate) fn is_unallocated(&self) -> bool {
        matches!(&self.storage, Storage::Owned(buf) if buf.is_empty())
    }

    pub(crate) fn data_size(&self) -> usize {
        self.size.max(self.pos)
    }

    /// Take over an externally owned buffer
    ///
    /// The caller must have freed the previous storage first.
    pub(crate) fn adopt(&mut self, data: Box<[u8]>, release: ReleaseFn) {
        self.size = data.len();
        self.pos = 0;
        self.storage = Storage::Borrowed { data, release };
    }

    /// Detach a borrowed buffer, leaving the arena unallocated
    pub(crate) fn take_borrowed(&mut self) -> Option<(Box<[u8]>, ReleaseFn)> {
        match core::mem::replace(&mut self.storage, Storage::Owned(Vec::new())) {
            Storage::Borrowed { data, release } => Some((data, release)),
            owned => {
                self.storage = owned;
                None
            }
        }
    }

    /// Install a freshly allocated buffer as owned storage
    pub(crate) fn install_owned(&mut self, buf: Vec<u8>) {
        record_resize(0, buf.len());
        self.storage = Storage::Owned(buf);
    }

    /// Resize owned storage to exactly `desired` bytes
    ///
    /// Sensitive buffers are moved into a fresh allocation so the old
    /// region can be zeroed before it is returned to the allocator.
    pub(crate) fn resize_owned(&mut self, desired: usize) -> Result<()> {
        let sensitive = self.sensitive;
        let Storage::Owned(buf) = &mut self.storage else {
            return Err(ParcelError::PermissionDenied {
                reason: "resize of externally owned buffer",
            });
        };

        let old = buf.len();
        if desired == old {
            return Ok(());
        }

        if sensitive {
            let mut fresh = alloc_zeroed(desired)?;
            let keep = old.min(desired);
            fresh[..keep].copy_from_slice(&buf[..keep]);
            zero_bytes(buf);
            *buf = fresh;
        } else if desired > old {
            buf.try_reserve_exact(desired - old)
                .map_err(|_| ParcelError::ResourceExhausted { requested: desired })?;
            buf.resize(desired, 0);
        } else {
            buf.truncate(desired);
            buf.shrink_to_fit();
        }

        log::trace!("Parcel buffer resized {} -> {} bytes", old, desired);
        record_resize(old, desired);
        Ok(())
    }

    /// Drop owned storage (zeroing it first if sensitive)
    pub(crate) fn free_owned(&mut self) {
        if let Storage::Owned(buf) = &mut self.storage {
            if self.sensitive {
                zero_bytes(buf);
            }
            record_resize(buf.len(), 0);
            *buf = Vec::new();
        }
        self.size = 0;
        self.pos = 0;
    }
}

fn record_resize(old: usize, new: usize) {
    if old == 0 && new > 0 {
        GLOBAL_ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
    } else if old > 0 && new == 0 {
        GLOBAL_ALLOC_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
    if new > old {
        GLOBAL_ALLOC_SIZE.fetch_add(new - old, Ordering::Relaxed);
    } else {
        GLOBAL_ALLOC_SIZE.fetch_sub(old - new, Ordering::Relaxed);
    }
}

/// Allocate `len` zeroed bytes, reporting failure instead of aborting
pub(crate) fn alloc_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ParcelError::ResourceExhausted { requested: len })?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Bytes zeroed by [`zero_bytes`] so far
#[cfg(test)]
pub(crate) static ZEROED_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Zero a region in a way the optimizer may not elide
pub(crate) fn zero_bytes(buf: &mut [u8]) {
    #[cfg(test)]
    ZEROED_BYTES.fetch_add(buf.len(), Ordering::Relaxed);
    for byte in buf.iter_mut() {
        // SAFETY: `byte` is a valid, aligned, exclusive reference
        unsafe { core::ptr::write_volatile(byte, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

/// Round `len` up to the next multiple of four
///
/// # Panics
/// Panics if the rounded value does not fit in `usize`. Callers validate
/// lengths against `i32::MAX` first, so reaching this is an invariant break.
pub fn pad_size(len: usize) -> usize {
    if len > usize::MAX - 3 {
        panic!("pad_size overflow: {len}");
    }
    (len + 3) & !3
}

/// Reject lengths that only make sense as a negative `i32`
pub(crate) fn check_len(len: usize, what: &'static str) -> Result<()> {
    if len > MAX_LEN {
        log::error!("Parcel {} {} exceeds i32::MAX", what, len);
        return Err(ParcelError::InvalidArgument { what });
    }
    Ok(())
}

/// Capacity to request when `additional` bytes must fit after `size`
pub(crate) fn growth_target(size: usize, additional: usize) -> Result<usize> {
    let needed = size
        .checked_add(additional)
        .ok_or(ParcelError::ResourceExhausted { requested: usize::MAX })?;
    let target = needed
        .checked_mul(3)
        .map(|n| n / 2)
        .ok_or(ParcelError::ResourceExhausted { requested: needed })?;
    if target <= size {
        return Err(ParcelError::ResourceExhausted { requested: target });
    }
    Ok(target.max(MIN_CAPACITY))
}

/// Object-table capacity after room for `extra` more entries is requested
pub(crate) fn table_growth_target(count: usize, extra: usize) -> Result<usize> {
    count
        .checked_add(extra)
        .and_then(|n| n.checked_mul(3))
        .map(|n| n / 2)
        .filter(|n| *n > count)
        .ok_or(ParcelError::ResourceExhausted { requested: count })
}
