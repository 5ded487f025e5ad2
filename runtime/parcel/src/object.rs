//! Special Object Records - Wire layout of embedded references and descriptors
//!
//! The kernel transport embeds fixed 24-byte records in the data buffer and
//! lists their offsets alongside the payload. The RPC transport writes a
//! 4-byte tag followed by a tag-dependent payload and tracks positions only.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::config::pack_chars;

/// Size of a kernel special-object record
pub const FLAT_OBJECT_SIZE: usize = 24;

const_assert_eq!(FLAT_OBJECT_SIZE, 4 + 4 + 8 + 8);

/// Kernel record type tags (`B_PACK_CHARS(c1, c2, '*', 0x85)`)
pub const BINDER_TYPE_BINDER: u32 = pack_chars(b's', b'b', b'*', 0x85);
pub const BINDER_TYPE_WEAK_BINDER: u32 = pack_chars(b'w', b'b', b'*', 0x85);
pub const BINDER_TYPE_HANDLE: u32 = pack_chars(b's', b'h', b'*', 0x85);
pub const BINDER_TYPE_WEAK_HANDLE: u32 = pack_chars(b'w', b'h', b'*', 0x85);
pub const BINDER_TYPE_FD: u32 = pack_chars(b'f', b'd', b'*', 0x85);

const_assert_eq!(BINDER_TYPE_BINDER, 0x7362_2a85);
const_assert_eq!(BINDER_TYPE_HANDLE, 0x7368_2a85);
const_assert_eq!(BINDER_TYPE_FD, 0x6664_2a85);

/// RPC record type tags
pub const RPC_TYPE_BINDER_NULL: i32 = 0;
pub const RPC_TYPE_BINDER: i32 = 1;
pub const RPC_TYPE_NATIVE_FILE_DESCRIPTOR: i32 = 2;

/// Scheduler policy used for the default minimum-priority hint
pub const SCHED_NORMAL: u32 = 0;

bitflags! {
    /// Flags word of a kernel record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjectFlags: u32 {
        /// Minimum priority the receiving thread runs at
        const PRIORITY_MASK      = 0xff;

        /// The referenced object accepts file descriptors
        const ACCEPTS_FDS        = 0x100;

        /// Minimum scheduler policy (two bits)
        const SCHED_POLICY_MASK  = 3 << 9;

        /// Receiving thread inherits the caller's real-time priority
        const INHERIT_RT         = 0x800;

        /// Caller's security context is requested with each transaction
        const TXN_SECURITY_CTX   = 0x1000;
    }
}

const SCHED_POLICY_SHIFT: u32 = 9;

impl ObjectFlags {
    /// Encode a minimum scheduling policy and priority
    pub fn sched_policy(policy: u32, priority: u32) -> Self {
        Self::from_bits_retain(
            (priority & Self::PRIORITY_MASK.bits())
                | ((policy << SCHED_POLICY_SHIFT) & Self::SCHED_POLICY_MASK.bits()),
        )
    }
}

/// Kind of a kernel record, decoded from its type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Binder,
    WeakBinder,
    Handle,
    WeakHandle,
    Fd,
    Unknown(u32),
}

impl ObjectKind {
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            BINDER_TYPE_BINDER => ObjectKind::Binder,
            BINDER_TYPE_WEAK_BINDER => ObjectKind::WeakBinder,
            BINDER_TYPE_HANDLE => ObjectKind::Handle,
            BINDER_TYPE_WEAK_HANDLE => ObjectKind::WeakHandle,
            BINDER_TYPE_FD => ObjectKind::Fd,
            other => ObjectKind::Unknown(other),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            ObjectKind::Binder => BINDER_TYPE_BINDER,
            ObjectKind::WeakBinder => BINDER_TYPE_WEAK_BINDER,
            ObjectKind::Handle => BINDER_TYPE_HANDLE,
            ObjectKind::WeakHandle => BINDER_TYPE_WEAK_HANDLE,
            ObjectKind::Fd => BINDER_TYPE_FD,
            ObjectKind::Unknown(tag) => tag,
        }
    }
}

/// Kernel special-object record
///
/// `binder` doubles as the handle (remote references) or the descriptor
/// number (fd records). `cookie` holds the local object identity, or `1`
/// on fd records whose descriptor is owned by the parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatObject {
    pub kind: ObjectKind,
    pub flags: ObjectFlags,
    pub binder: u64,
    pub cookie: u64,
}

impl FlatObject {
    /// Null reference placeholder (all fields zero)
    pub fn null_binder() -> Self {
        Self {
            kind: ObjectKind::Binder,
            flags: ObjectFlags::empty(),
            binder: 0,
            cookie: 0,
        }
    }

    /// Descriptor record; `owned` marks the descriptor for closing on release
    pub fn fd(fd: i32, owned: bool) -> Self {
        Self {
            kind: ObjectKind::Fd,
            flags: ObjectFlags::empty(),
            binder: fd as u32 as u64,
            cookie: owned as u64,
        }
    }

    pub fn handle(&self) -> u32 {
        self.binder as u32
    }

    pub fn fd_number(&self) -> i32 {
        self.binder as u32 as i32
    }

    pub fn owns_fd(&self) -> bool {
        self.cookie != 0
    }

    /// Decode the record stored at `offset`
    ///
    /// # Panics
    /// Panics if the record is out of bounds; recorded offsets always
    /// address complete records.
    pub fn read_at(data: &[u8], offset: usize) -> Self {
        let tag = u32::from_ne_bytes(field(data, offset));
        let flags = u32::from_ne_bytes(field(data, offset + 4));
        Self {
            kind: ObjectKind::from_tag(tag),
            flags: ObjectFlags::from_bits_retain(flags),
            binder: u64::from_ne_bytes(field(data, offset + 8)),
            cookie: u64::from_ne_bytes(field(data, offset + 16)),
        }
    }

    /// Encode the record at `offset`
    pub fn write_at(&self, data: &mut [u8], offset: usize) {
        data[offset..offset + 4].copy_from_slice(&self.kind.tag().to_ne_bytes());
        data[offset + 4..offset + 8].copy_from_slice(&self.flags.bits().to_ne_bytes());
        data[offset + 8..offset + 16].copy_from_slice(&self.binder.to_ne_bytes());
        data[offset + 16..offset + 24].copy_from_slice(&self.cookie.to_ne_bytes());
    }
}

fn field<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[at..at + N]);
    out
}

/// Reference to an IPC endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Binder {
    /// Object living in this process, identified by a non-zero id
    Local(u64),

    /// Proxy for an object in another process, by kernel handle
    Remote(u32),
}
