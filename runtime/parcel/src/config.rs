//! Parcel Configuration
//!
//! Tunables that are fixed per parcel: blob threshold, header magic, the
//! scheduling hint stamped on local references, and read-side size limits.

use static_assertions::const_assert_eq;

/// Pack four characters into a big-endian word
pub const fn pack_chars(c1: u8, c2: u8, c3: u8, c4: u8) -> u32 {
    ((c1 as u32) << 24) | ((c2 as u32) << 16) | ((c3 as u32) << 8) | (c4 as u32)
}

const_assert_eq!(pack_chars(b'S', b'Y', b'S', b'T'), 0x5359_5354);

/// Payloads up to this size are written inline rather than via shared memory
pub const BLOB_INPLACE_LIMIT: usize = 16 * 1024;

/// Upper bound on descriptors accepted in a single vector read
pub const MAX_FDS: usize = 1024;

/// Upper bound (element count * element size) accepted when reading vectors
pub const MAX_VECTOR_BYTES: usize = 1_000_000;

/// Build variant recorded in interface-token headers
///
/// Both ends of a kernel transport must agree; a receiver rejects any
/// other magic unless it is in fuzzing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderVariant {
    System,
    Vendor,
    Recovery,
    #[default]
    Unknown,
}

impl HeaderVariant {
    /// Magic word written after the work-source field
    pub const fn magic(self) -> u32 {
        match self {
            HeaderVariant::System => pack_chars(b'S', b'Y', b'S', b'T'),
            HeaderVariant::Vendor => pack_chars(b'V', b'N', b'D', b'R'),
            HeaderVariant::Recovery => pack_chars(b'R', b'E', b'C', b'O'),
            HeaderVariant::Unknown => pack_chars(b'U', b'N', b'K', b'N'),
        }
    }
}

/// Per-parcel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelConfig {
    /// Blobs up to this many bytes are written inline
    pub blob_inplace_limit: usize,

    /// Header magic used by interface tokens
    pub header: HeaderVariant,

    /// When false, local reference records carry the default
    /// SCHED_NORMAL / priority 19 minimum scheduling hint
    pub background_scheduling_disabled: bool,

    /// Limit for `element_count * size_of::<T>()` on vector reads
    pub max_vector_bytes: usize,

    /// Limit on descriptor-vector reads
    pub max_fds: usize,
}

impl Default for ParcelConfig {
    fn default() -> Self {
        Self {
            blob_inplace_limit: BLOB_INPLACE_LIMIT,
            header: HeaderVariant::default(),
            background_scheduling_disabled: false,
            max_vector_bytes: MAX_VECTOR_BYTES,
            max_fds: MAX_FDS,
        }
    }
}

impl ParcelConfig {
    pub fn with_blob_inplace_limit(mut self, limit: usize) -> Self {
        self.blob_inplace_limit = limit;
        self
    }

    pub fn with_header(mut self, header: HeaderVariant) -> Self {
        self.header = header;
        self
    }

    pub fn with_background_scheduling_disabled(mut self, disabled: bool) -> Self {
        self.background_scheduling_disabled = disabled;
        self
    }

    pub fn with_max_vector_bytes(mut self, max: usize) -> Self {
        self.max_vector_bytes = max;
        self
    }

    pub fn with_max_fds(mut self, max: usize) -> Self {
        self.max_fds = max;
        self
    }
}
