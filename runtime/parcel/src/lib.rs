//! KaaL Parcel - Marshalling buffer for binder-style IPC
//!
//! # Purpose
//! A `Parcel` carries one IPC message: a growable byte buffer with a read
//! cursor, plus a table of the special objects (endpoint references and
//! file descriptors) embedded in it. The table lets the transport translate
//! references and duplicate descriptors, and lets the parcel refuse ordinary
//! reads and writes that would clobber them.
//!
//! # Integration Points
//! - Depends on: an [`ObjectRegistry`] for reference counts, an
//!   [`RpcSession`] for socket transports, libc for descriptors and memfd
//! - Provides to: IPC transports (kernel driver or socket RPC)
//! - Buffers received from a transport are adopted without copying and
//!   handed back through a release callback
//!
//! # Architecture
//! ```text
//! ┌───────────────────────────────────────────┐
//! │ Typed primitives / references / blobs     │
//! ├───────────────────────────────────────────┤
//! │ Parcel: growth, truncation, append        │
//! ├─────────────────────┬─────────────────────┤
//! │ Kernel object table │ RPC object table    │
//! │ (24-byte records)   │ (positions + fds)   │
//! ├─────────────────────┴─────────────────────┤
//! │ Buffer arena (owned or borrowed)          │
//! └───────────────────────────────────────────┘
//! ```
//! The encoding is chosen once, before any data is written, and cannot be
//! mixed: appending between parcels of different encodings or sessions is
//! rejected.
//!
//! # Testing Strategy
//! - Unit tests: arena growth, table search and sorting, record layout
//! - Integration tests: round trips, append, overlap rejection, RPC fds
//! - Benchmarks: primitive write/read throughput

extern crate alloc;

mod arena;
mod binder;
mod blob;
mod config;
pub mod error;
mod interface;
mod kernel;
mod object;
pub mod os;
mod parcel;
mod primitives;
mod registry;
mod rpc;
mod session;

pub use arena::{global_alloc_count, global_alloc_size, pad_size, ReleasedBuffer, MIN_CAPACITY};
pub use blob::{ReadableBlob, WritableBlob, BLOB_INPLACE, BLOB_SHARED_IMMUTABLE, BLOB_SHARED_MUTABLE};
pub use config::{HeaderVariant, ParcelConfig, BLOB_INPLACE_LIMIT, MAX_FDS, MAX_VECTOR_BYTES};
pub use error::{ParcelError, Result};
pub use interface::{InterfaceHeader, ThreadPolicy, STRICT_MODE_PENALTY_GATHER, UNSET_WORK_SOURCE};
pub use object::{
    Binder, FlatObject, ObjectFlags, ObjectKind, BINDER_TYPE_BINDER, BINDER_TYPE_FD,
    BINDER_TYPE_HANDLE, BINDER_TYPE_WEAK_BINDER, BINDER_TYPE_WEAK_HANDLE, FLAT_OBJECT_SIZE,
    RPC_TYPE_BINDER, RPC_TYPE_BINDER_NULL, RPC_TYPE_NATIVE_FILE_DESCRIPTOR,
};
pub use parcel::Parcel;
pub use primitives::{Scalar, EX_HAS_REPLY_HEADER};
pub use registry::{
    install_process_registry, process_registry, LocalAttributes, LocalRegistry, ObjectRegistry,
    OwnerToken,
};
pub use rpc::ParcelFd;
pub use session::{FdTransportMode, RpcSession};
