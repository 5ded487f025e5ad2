//! Parcel - Buffer lifecycle, ownership handoff and object-table upkeep
//!
//! Everything here keeps the data buffer and the active object table in
//! step: growth, truncation, adopting a received buffer, and copying a
//! range out of another parcel. Typed reads and writes live in
//! `primitives`, special objects in `binder`.

use alloc::sync::Arc;
use core::cmp::Ordering;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::os::fd::{IntoRawFd, RawFd};

use crate::arena::{alloc_zeroed, check_len, growth_target, Arena, ReleaseFn, ReleasedBuffer, MAX_LEN};
use crate::config::ParcelConfig;
use crate::kernel::KernelState;
use crate::object::{Binder, FlatObject, ObjectKind, FLAT_OBJECT_SIZE, RPC_TYPE_NATIVE_FILE_DESCRIPTOR};
use crate::registry::{acquire_object, process_registry, release_object, ObjectRegistry, OwnerToken};
use crate::rpc::{ParcelFd, RpcState};
use crate::session::{same_session, RpcSession};
use crate::{os, ParcelError, Result};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Object-table flavour in use; fixed once data has been written
pub(crate) enum Variant {
    Kernel(KernelState),
    Rpc(RpcState),
}

/// Marshalling buffer for one IPC message
///
/// A parcel starts out in the kernel encoding. Call [`Parcel::mark_for_rpc`]
/// before writing anything to use the socket encoding instead.
///
/// # Example
/// ```ignore
/// let mut parcel = Parcel::new();
/// parcel.write_i32(5)?;
/// parcel.write_utf8_as_utf16("hi")?;
/// parcel.set_data_position(0);
/// assert_eq!(parcel.read_i32()?, 5);
/// assert_eq!(parcel.read_utf8_from_utf16()?, "hi");
/// ```
pub struct Parcel {
    pub(crate) owner: OwnerToken,
    pub(crate) arena: Arena,
    pub(crate) variant: Variant,
    pub(crate) registry: Arc<dyn ObjectRegistry>,
    pub(crate) config: ParcelConfig,
    error: Option<ParcelError>,
    pub(crate) allow_fds: bool,
    enforce_no_data_avail: bool,
    pub(crate) service_fuzzing: bool,
}

impl Default for Parcel {
    fn default() -> Self {
        Self::new()
    }
}

impl Parcel {
    /// Empty parcel using the process registry and default configuration
    pub fn new() -> Self {
        Self::with_registry(process_registry(), ParcelConfig::default())
    }

    pub fn with_config(config: ParcelConfig) -> Self {
        Self::with_registry(process_registry(), config)
    }

    /// Empty parcel that reports reference traffic to `registry`
    pub fn with_registry(registry: Arc<dyn ObjectRegistry>, config: ParcelConfig) -> Self {
        Self {
            owner: OwnerToken(NEXT_OWNER.fetch_add(1, AtomicOrdering::Relaxed)),
            arena: Arena::new(),
            variant: Variant::Kernel(KernelState::new()),
            registry,
            config,
            error: None,
            allow_fds: true,
            enforce_no_data_avail: true,
            service_fuzzing: false,
        }
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    /// Written bytes, up to [`Parcel::data_size`]
    pub fn data(&self) -> &[u8] {
        let end = self.arena.data_size().min(self.arena.capacity());
        &self.arena.bytes()[..end]
    }

    /// Larger of the logical size and the cursor
    pub fn data_size(&self) -> usize {
        self.arena.data_size()
    }

    /// Bytes between the cursor and the logical size
    pub fn data_avail(&self) -> usize {
        self.arena.size.saturating_sub(self.arena.pos)
    }

    pub fn data_position(&self) -> usize {
        self.arena.pos
    }

    pub fn data_capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Logical size, ignoring the cursor
    pub fn data_buffer_size(&self) -> usize {
        self.arena.size
    }

    pub fn owner_token(&self) -> OwnerToken {
        self.owner
    }

    pub fn config(&self) -> &ParcelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn ObjectRegistry> {
        &self.registry
    }

    pub fn is_for_rpc(&self) -> bool {
        matches!(self.variant, Variant::Rpc(_))
    }

    /// Session an RPC parcel is bound to
    pub fn session(&self) -> Option<&Arc<dyn RpcSession>> {
        match &self.variant {
            Variant::Rpc(rpc) => Some(&rpc.session),
            Variant::Kernel(_) => None,
        }
    }

    /// Number of recorded special objects
    pub fn objects_count(&self) -> usize {
        match &self.variant {
            Variant::Kernel(kernel) => kernel.objects.len(),
            Variant::Rpc(rpc) => rpc.positions.len(),
        }
    }

    /// Recorded object offsets (empty for RPC parcels)
    pub fn ipc_objects(&self) -> &[u64] {
        match &self.variant {
            Variant::Kernel(kernel) => &kernel.objects,
            Variant::Rpc(_) => &[],
        }
    }

    /// Sticky error recorded by a failed allocation
    pub fn error_check(&self) -> Result<()> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub fn set_error(&mut self, err: ParcelError) {
        self.error = Some(err);
    }

    pub(crate) fn record_error(&mut self, err: ParcelError) -> ParcelError {
        self.error = Some(err.clone());
        err
    }

    // ---------------------------------------------------------------
    // Flags
    // ---------------------------------------------------------------

    pub fn allow_fds(&self) -> bool {
        self.allow_fds
    }

    pub fn set_allow_fds(&mut self, allow: bool) {
        self.allow_fds = allow;
    }

    /// Narrow the fd permission, returning the previous value
    ///
    /// Descriptors stay forbidden if they already were.
    pub fn push_allow_fds(&mut self, allow: bool) -> bool {
        let previous = self.allow_fds;
        if !allow {
            self.allow_fds = false;
        }
        previous
    }

    pub fn restore_allow_fds(&mut self, previous: bool) {
        self.allow_fds = previous;
    }

    /// Zero the buffer whenever memory is released or reallocated
    ///
    /// Must be called before any data is written.
    pub fn mark_sensitive(&mut self) {
        self.arena.sensitive = true;
    }

    pub fn is_sensitive(&self) -> bool {
        self.arena.sensitive
    }

    pub fn set_enforce_no_data_avail(&mut self, enforce: bool) {
        self.enforce_no_data_avail = enforce;
    }

    /// Fail if a reader left bytes unconsumed
    ///
    /// # Errors
    /// `NotFullyConsumed` with the unread byte count, unless enforcement
    /// has been turned off.
    pub fn enforce_no_data_avail(&self) -> Result<()> {
        if !self.enforce_no_data_avail {
            return Ok(());
        }
        let unread = self.data_avail();
        if unread > 0 {
            log::error!(
                "Parcel data not fully consumed, unread size: {} (position {}, size {})",
                unread,
                self.arena.pos,
                self.arena.size
            );
            return Err(ParcelError::NotFullyConsumed { unread });
        }
        Ok(())
    }

    /// Tolerate malformed input (header/interface mismatches, missing
    /// objects) without logging
    pub fn set_service_fuzzing(&mut self) {
        self.service_fuzzing = true;
    }

    pub fn is_service_fuzzing(&self) -> bool {
        self.service_fuzzing
    }

    /// Switch to the socket encoding, bound to `session`
    ///
    /// # Errors
    /// `ProtocolViolation` if data has already been written into an
    /// internally owned buffer.
    pub fn mark_for_rpc(&mut self, session: Arc<dyn RpcSession>) -> Result<()> {
        if self.data_size() > 0 && !self.arena.is_borrowed() {
            log::error!(
                "Parcel format must be chosen before writing ({} bytes present)",
                self.data_size()
            );
            return Err(ParcelError::ProtocolViolation {
                reason: "format must be chosen before data is written",
            });
        }
        self.variant = Variant::Rpc(RpcState::new(session));
        Ok(())
    }

    // ---------------------------------------------------------------
    // Size and position
    // ---------------------------------------------------------------

    /// Resize the logical data, dropping objects that no longer fit
    pub fn set_data_size(&mut self, size: usize) -> Result<()> {
        check_len(size, "data size")?;
        self.continue_write(size)?;
        self.arena.size = size;
        log::trace!("{:?}: data size set to {}", self.owner, size);
        Ok(())
    }

    /// Move the cursor
    ///
    /// # Panics
    /// Panics if `pos` exceeds `i32::MAX`.
    pub fn set_data_position(&mut self, pos: usize) {
        if pos > MAX_LEN {
            panic!("set_data_position: {pos} exceeds i32::MAX");
        }
        self.arena.pos = pos;
        if let Variant::Kernel(kernel) = &mut self.variant {
            kernel.reset_search();
        }
    }

    /// Ensure at least `size` bytes of capacity
    pub fn set_data_capacity(&mut self, size: usize) -> Result<()> {
        check_len(size, "data capacity")?;
        if size > self.arena.capacity() {
            return self.continue_write(size);
        }
        Ok(())
    }

    /// Replace the contents with a copy of `bytes`
    ///
    /// Any objects embedded in the copied bytes are not recorded.
    pub fn set_data(&mut self, bytes: &[u8]) -> Result<()> {
        check_len(bytes.len(), "data length")?;
        self.restart_write(bytes.len())?;
        self.arena.bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        self.arena.size = bytes.len();
        if let Variant::Kernel(kernel) = &mut self.variant {
            kernel.fds_known = false;
        }
        Ok(())
    }

    /// Release everything and return to an empty kernel-encoded parcel
    pub fn free_data(&mut self) {
        self.free_data_no_init();
        self.init_state();
    }

    // ---------------------------------------------------------------
    // Growth and ownership transfer
    // ---------------------------------------------------------------

    /// Make room for `len` more bytes at the tail
    pub(crate) fn grow_data(&mut self, len: usize) -> Result<()> {
        check_len(len, "growth length")?;
        if self.arena.pos > self.arena.size {
            log::error!(
                "Parcel cannot grow with position {} past size {}",
                self.arena.pos,
                self.arena.size
            );
            return Err(ParcelError::InvalidArgument {
                what: "position past end of data",
            });
        }
        let target = growth_target(self.arena.size, len)?;
        log::trace!("{:?}: growing to {} bytes", self.owner, target);
        self.continue_write(target)
    }

    /// Set the buffer up to hold `desired` bytes
    ///
    /// Externally owned buffers are copied into a fresh owned one. Owned
    /// buffers are reallocated in place. Either way, objects whose records
    /// no longer fit are dropped and released.
    pub(crate) fn continue_write(&mut self, desired: usize) -> Result<()> {
        check_len(desired, "desired size")?;

        // Objects whose records survive the new size
        let mut keep = self.objects_count();
        if desired < self.arena.size {
            if desired == 0 {
                keep = 0;
            } else {
                match &mut self.variant {
                    Variant::Kernel(kernel) => {
                        kernel.ensure_sorted();
                        keep = kernel.count_within(desired);
                    }
                    Variant::Rpc(rpc) => {
                        keep = rpc.count_within(self.arena.bytes(), self.arena.size, desired)?;
                    }
                }
            }
        }

        if self.arena.is_borrowed() {
            return self.take_ownership(desired, keep);
        }

        if self.arena.is_unallocated() {
            // First allocation
            let buf = alloc_zeroed(desired).map_err(|err| self.record_error(err))?;
            self.arena.install_owned(buf);
            self.arena.size = 0;
            self.arena.pos = 0;
            return Ok(());
        }

        self.drop_objects_past(keep)?;
        if desired > self.arena.capacity() {
            self.arena
                .resize_owned(desired)
                .map_err(|err| self.record_error(err))?;
        } else {
            self.arena.size = self.arena.size.min(desired);
            self.arena.pos = self.arena.pos.min(desired);
        }
        Ok(())
    }

    /// Copy a borrowed buffer into owned memory, keeping `keep` objects
    fn take_ownership(&mut self, desired: usize, keep: usize) -> Result<()> {
        if desired == 0 {
            self.free_data();
            return Ok(());
        }

        // Everything fallible happens before the borrowed buffer is let go
        let mut buf = alloc_zeroed(desired).map_err(|err| self.record_error(err))?;
        let kept_objects = match &mut self.variant {
            Variant::Kernel(kernel) => kernel.objects[..keep].to_vec(),
            Variant::Rpc(rpc) => {
                rpc.truncate(self.arena.bytes(), self.arena.size, keep)?;
                Vec::new()
            }
        };

        let size = self.arena.size;
        let Some((old, release)) = self.arena.take_borrowed() else {
            return Err(ParcelError::ProtocolViolation {
                reason: "buffer is not externally owned",
            });
        };
        let copied = size.min(desired);
        buf[..copied].copy_from_slice(&old[..copied]);

        let mut returned_objects = Vec::new();
        if let Variant::Kernel(kernel) = &mut self.variant {
            for &offset in &kept_objects {
                let offset = offset as usize;
                let mut obj = FlatObject::read_at(&old, offset);
                acquire_object(&*self.registry, &obj, self.owner);
                // Descriptors in a borrowed buffer are implicitly owned;
                // mark them so release closes them from now on
                if obj.kind == ObjectKind::Fd {
                    obj.cookie = 1;
                    obj.write_at(&mut buf, offset);
                }
            }
            for &offset in &kernel.objects[keep..] {
                let obj = FlatObject::read_at(&old, offset as usize);
                if obj.kind == ObjectKind::Fd {
                    os::close_fd(obj.fd_number());
                }
            }
            returned_objects = core::mem::replace(&mut kernel.objects, kept_objects);
            kernel.reset_search();
        }

        release(ReleasedBuffer {
            data: old,
            objects: returned_objects,
        });

        self.arena.install_owned(buf);
        self.arena.size = copied;
        self.arena.pos = self.arena.pos.min(desired);
        log::trace!("{:?}: took ownership of {} bytes", self.owner, desired);
        Ok(())
    }

    /// Release objects past index `keep` of an owned buffer
    fn drop_objects_past(&mut self, keep: usize) -> Result<()> {
        match &mut self.variant {
            Variant::Kernel(kernel) => {
                if keep < kernel.objects.len() {
                    let data = self.arena.bytes();
                    for &offset in &kernel.objects[keep..] {
                        let obj = FlatObject::read_at(data, offset as usize);
                        if obj.kind == ObjectKind::Fd {
                            // The dropped record may have been the only fd
                            kernel.fds_known = false;
                        }
                        release_object(&*self.registry, &obj, self.owner);
                    }
                    kernel.objects.truncate(keep);
                    kernel.objects.shrink_to_fit();
                    kernel.reset_search();
                }
                Ok(())
            }
            Variant::Rpc(rpc) => rpc.truncate(self.arena.bytes(), self.arena.size, keep),
        }
    }

    /// Start a new payload of `desired` bytes, discarding all objects
    pub(crate) fn restart_write(&mut self, desired: usize) -> Result<()> {
        check_len(desired, "desired size")?;

        if self.arena.is_borrowed() {
            self.free_data();
            return self.continue_write(desired);
        }

        self.release_objects();
        self.arena
            .resize_owned(desired)
            .map_err(|err| self.record_error(err))?;
        self.arena.size = 0;
        self.arena.pos = 0;

        match &mut self.variant {
            Variant::Kernel(kernel) => {
                kernel.objects.clear();
                kernel.objects.shrink_to_fit();
                kernel.reset_search();
                kernel.has_fds = false;
                kernel.fds_known = true;
            }
            Variant::Rpc(rpc) => {
                rpc.positions.clear();
                rpc.fds.clear();
            }
        }
        self.allow_fds = true;
        Ok(())
    }

    /// Release every recorded kernel object (the table itself is kept)
    fn release_objects(&mut self) {
        if let Variant::Kernel(kernel) = &self.variant {
            let data = self.arena.bytes();
            for &offset in kernel.objects.iter().rev() {
                let obj = FlatObject::read_at(data, offset as usize);
                release_object(&*self.registry, &obj, self.owner);
            }
        }
    }

    fn free_data_no_init(&mut self) {
        if self.arena.is_borrowed() {
            // Descriptors in a borrowed buffer belong to the parcel
            let mut objects = Vec::new();
            match &mut self.variant {
                Variant::Kernel(kernel) => {
                    let data = self.arena.bytes();
                    for &offset in kernel.objects.iter().rev() {
                        let obj = FlatObject::read_at(data, offset as usize);
                        if obj.kind == ObjectKind::Fd {
                            os::close_fd(obj.fd_number());
                        }
                    }
                    objects = core::mem::take(&mut kernel.objects);
                }
                Variant::Rpc(rpc) => {
                    rpc.positions.clear();
                    rpc.fds.clear();
                }
            }
            if let Some((data, release)) = self.arena.take_borrowed() {
                log::trace!("{:?}: returning borrowed buffer to owner", self.owner);
                release(ReleasedBuffer { data, objects });
            }
            self.arena.size = 0;
            self.arena.pos = 0;
        } else {
            self.release_objects();
            self.arena.free_owned();
        }
    }

    fn init_state(&mut self) {
        self.error = None;
        self.arena = Arena::new();
        self.variant = Variant::Kernel(KernelState::new());
        self.allow_fds = true;
        self.enforce_no_data_avail = true;
        self.service_fuzzing = false;
    }

    // ---------------------------------------------------------------
    // Received buffers
    // ---------------------------------------------------------------

    /// Adopt a buffer received from the kernel transport
    ///
    /// `objects` must list ascending, non-overlapping offsets of records
    /// of a known type; if any does not, the whole table is discarded and
    /// the data is treated as plain bytes. `release` gets the buffer back
    /// once the parcel is done with it (or copies it on mutation).
    pub fn ipc_set_data_reference(
        &mut self,
        data: Box<[u8]>,
        objects: Vec<u64>,
        release: impl FnOnce(ReleasedBuffer) + Send + 'static,
    ) {
        self.free_data();

        let len = data.len();
        self.arena.adopt(data, Box::new(release) as ReleaseFn);

        let mut kernel = KernelState::new();
        kernel.objects = objects;

        let bytes = self.arena.bytes();
        let mut min_offset = 0u64;
        let mut valid = true;
        for &offset in &kernel.objects {
            if offset < min_offset {
                log::error!("Bad object offset {} < {}", offset, min_offset);
                valid = false;
                break;
            }
            let end = offset.saturating_add(FLAT_OBJECT_SIZE as u64);
            if end > len as u64 {
                log::error!("Object offset {} out of range (size {})", offset, len);
                valid = false;
                break;
            }
            let obj = FlatObject::read_at(bytes, offset as usize);
            if !matches!(obj.kind, ObjectKind::Binder | ObjectKind::Handle | ObjectKind::Fd) {
                log::error!("Unsupported object type {:?} at offset {}", obj.kind, offset);
                valid = false;
                break;
            }
            min_offset = end;
        }
        if !valid {
            kernel.objects.clear();
        }
        kernel.scan_for_fds(bytes, len);
        self.variant = Variant::Kernel(kernel);
    }

    /// Adopt a buffer received over an RPC session
    ///
    /// `positions` locate the descriptor records and `fds` carries the
    /// descriptors they index, in order.
    ///
    /// # Errors
    /// `InvalidArgument` if the position and descriptor counts differ,
    /// positions are not strictly increasing, or a record header lies out
    /// of bounds. `release` has already been invoked in that case.
    pub fn rpc_set_data_reference(
        &mut self,
        session: Arc<dyn RpcSession>,
        data: Box<[u8]>,
        positions: Vec<u32>,
        fds: Vec<ParcelFd>,
        release: impl FnOnce(ReleasedBuffer) + Send + 'static,
    ) -> Result<()> {
        let mut rejected = None;
        if positions.len() != fds.len() {
            log::error!(
                "Object table size {} does not match fd count {}",
                positions.len(),
                fds.len()
            );
            rejected = Some("object table size");
        }
        let mut previous: Option<u32> = None;
        for &pos in &positions {
            if rejected.is_some() {
                break;
            }
            let in_range = (pos as usize)
                .checked_add(4)
                .is_some_and(|end| end < data.len());
            let ascending = previous.map_or(true, |prev| pos > prev);
            if !in_range || !ascending {
                log::error!(
                    "Received bad object position {} (parcel size {})",
                    pos,
                    data.len()
                );
                rejected = Some("object position");
            }
            previous = Some(pos);
        }
        if let Some(what) = rejected {
            release(ReleasedBuffer {
                data,
                objects: Vec::new(),
            });
            return Err(ParcelError::InvalidArgument { what });
        }

        self.free_data();
        self.arena.adopt(data, Box::new(release) as ReleaseFn);
        let mut rpc = RpcState::new(session);
        rpc.positions = positions;
        rpc.fds = fds;
        self.variant = Variant::Rpc(rpc);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Object queries
    // ---------------------------------------------------------------

    /// Whether any descriptor is embedded, rescanning if the cache is stale
    pub fn has_file_descriptors(&mut self) -> bool {
        let size = self.data_size();
        match &mut self.variant {
            Variant::Kernel(kernel) => {
                if !kernel.fds_known {
                    kernel.scan_for_fds(self.arena.bytes(), size);
                }
                kernel.has_fds
            }
            Variant::Rpc(rpc) => !rpc.fds.is_empty(),
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if len <= MAX_LEN && end <= self.data().len() => Ok(()),
            _ => Err(ParcelError::InvalidArgument { what: "range" }),
        }
    }

    pub fn has_file_descriptors_in_range(&self, offset: usize, len: usize) -> Result<bool> {
        self.check_range(offset, len)?;
        match &self.variant {
            Variant::Kernel(kernel) => Ok(kernel.has_fds_in_range(self.arena.bytes(), offset, len)),
            Variant::Rpc(rpc) => {
                let data = self.arena.bytes();
                Ok(rpc.positions.iter().any(|&pos| {
                    let pos = pos as usize;
                    pos >= offset
                        && pos < offset + len
                        && try_read_i32_at(data, pos) == Some(RPC_TYPE_NATIVE_FILE_DESCRIPTOR)
                }))
            }
        }
    }

    pub fn has_binders(&self) -> bool {
        self.has_binders_in_range(0, self.data_size()).unwrap_or(false)
    }

    /// # Errors
    /// `ProtocolViolation` for RPC parcels, which do not track references
    pub fn has_binders_in_range(&self, offset: usize, len: usize) -> Result<bool> {
        self.check_range(offset, len)?;
        match &self.variant {
            Variant::Kernel(kernel) => Ok(kernel.has_binders_in_range(self.arena.bytes(), offset, len)),
            Variant::Rpc(_) => Err(ParcelError::ProtocolViolation {
                reason: "RPC parcels do not track references",
            }),
        }
    }

    /// References embedded in a kernel parcel, in table order
    pub fn debug_read_all_strong_binders(&self) -> Vec<Binder> {
        let Variant::Kernel(kernel) = &self.variant else {
            return Vec::new();
        };
        let data = self.arena.bytes();
        kernel
            .objects
            .iter()
            .filter_map(|&offset| {
                let obj = FlatObject::read_at(data, offset as usize);
                match obj.kind {
                    ObjectKind::Binder if obj.cookie != 0 => Some(Binder::Local(obj.cookie)),
                    ObjectKind::Handle => self.registry.resolve_remote(obj.handle()),
                    _ => None,
                }
            })
            .collect()
    }

    /// Descriptors embedded in the parcel, in table order
    pub fn debug_read_all_file_descriptors(&self) -> Vec<RawFd> {
        let data = self.arena.bytes();
        match &self.variant {
            Variant::Kernel(kernel) => kernel
                .objects
                .iter()
                .map(|&offset| FlatObject::read_at(data, offset as usize))
                .filter(|obj| obj.kind == ObjectKind::Fd)
                .map(|obj| obj.fd_number())
                .collect(),
            Variant::Rpc(rpc) => rpc
                .positions
                .iter()
                .map(|&pos| pos as usize)
                .filter(|&pos| read_i32_at(data, pos) == RPC_TYPE_NATIVE_FILE_DESCRIPTOR)
                .filter_map(|pos| rpc.fd_index_at(data, self.arena.size, pos).ok())
                .map(|index| rpc.fds[index].raw())
                .collect(),
        }
    }

    // ---------------------------------------------------------------
    // Comparison
    // ---------------------------------------------------------------

    /// Order by data size first, then by content
    pub fn compare_data(&self, other: &Parcel) -> Ordering {
        let (ours, theirs) = (self.data(), other.data());
        ours.len().cmp(&theirs.len()).then_with(|| ours.cmp(theirs))
    }

    /// Compare `len` bytes at `this_offset` with `len` bytes of `other`
    pub fn compare_data_in_range(
        &self,
        this_offset: usize,
        other: &Parcel,
        other_offset: usize,
        len: usize,
    ) -> Result<Ordering> {
        self.check_range(this_offset, len)?;
        other.check_range(other_offset, len)?;
        let ours = &self.arena.bytes()[this_offset..this_offset + len];
        let theirs = &other.arena.bytes()[other_offset..other_offset + len];
        Ok(ours.cmp(theirs))
    }

    // ---------------------------------------------------------------
    // Cross-parcel append
    // ---------------------------------------------------------------

    /// Append `[offset, offset + len)` of `source` at the cursor
    ///
    /// Objects whose records lie entirely inside the range are recorded
    /// in this parcel. Their references are acquired once more and their
    /// descriptors are duplicated, so each parcel owns its own.
    ///
    /// # Errors
    /// - `ProtocolViolation` if the encodings differ or the RPC sessions differ.
    ///   Neither parcel is modified in that case.
    /// - `InvalidArgument` if the range exceeds the source.
    /// - `PermissionDenied` if descriptors arrive while they are disallowed.
    ///   The bytes and objects are still appended in that case.
    pub fn append_from(&mut self, source: &Parcel, offset: usize, len: usize) -> Result<()> {
        match (&self.variant, &source.variant) {
            (Variant::Kernel(_), Variant::Kernel(_)) => {}
            (Variant::Rpc(ours), Variant::Rpc(theirs)) => {
                if !same_session(&ours.session, &theirs.session) {
                    log::error!("Cannot append parcels from different sessions");
                    return Err(ParcelError::ProtocolViolation {
                        reason: "parcels belong to different sessions",
                    });
                }
            }
            _ => {
                log::error!("Cannot append a parcel encoded for a different transport");
                return Err(ParcelError::ProtocolViolation {
                    reason: "parcels use different encodings",
                });
            }
        }

        if len == 0 {
            return Ok(());
        }
        check_len(len, "append length")?;
        let source_size = source.arena.size;
        if offset > source_size || len > source_size || offset + len > source_size {
            return Err(ParcelError::InvalidArgument {
                what: "append range",
            });
        }

        let start = self.arena.pos;
        let end = start
            .checked_add(len)
            .ok_or(ParcelError::ResourceExhausted { requested: len })?;
        if end > self.arena.capacity() {
            self.grow_data(len)?;
        }
        let quiet = self.service_fuzzing;
        if let Variant::Kernel(kernel) = &mut self.variant {
            kernel.validate(start, end, quiet)?;
        }

        self.arena.bytes_mut()[start..end]
            .copy_from_slice(&source.arena.bytes()[offset..offset + len]);
        self.arena.pos = end;
        self.arena.size = self.arena.size.max(end);

        match (&mut self.variant, &source.variant) {
            (Variant::Kernel(ours), Variant::Kernel(theirs)) => {
                let copied: Vec<u64> = theirs
                    .objects
                    .iter()
                    .copied()
                    .filter(|&pos| {
                        pos >= offset as u64
                            && pos + FLAT_OBJECT_SIZE as u64 <= (offset + len) as u64
                    })
                    .collect();
                if copied.is_empty() {
                    return Ok(());
                }
                ours.reserve(copied.len())?;

                let mut result = Ok(());
                let data = self.arena.bytes_mut();
                for pos in copied {
                    let translated = (pos as usize) - offset + start;
                    ours.push_object(translated as u64);

                    let mut obj = FlatObject::read_at(data, translated);
                    if obj.kind == ObjectKind::Fd {
                        let dup = match os::dup_fd(obj.fd_number()) {
                            Ok(fd) => fd.into_raw_fd(),
                            Err(err) => {
                                log::warn!("Failed to duplicate fd {}: {}", obj.fd_number(), err);
                                result = Err(err);
                                -1
                            }
                        };
                        obj = FlatObject { flags: obj.flags, ..FlatObject::fd(dup, true) };
                        obj.write_at(data, translated);
                        ours.has_fds = true;
                        ours.fds_known = true;
                        if !self.allow_fds && result.is_ok() {
                            result = Err(ParcelError::fds_not_allowed());
                        }
                    }
                    acquire_object(&*self.registry, &obj, self.owner);
                }
                result
            }
            (Variant::Rpc(ours), Variant::Rpc(theirs)) => {
                for &pos in &theirs.positions {
                    let pos = pos as usize;
                    if pos < offset || pos >= offset + len {
                        continue;
                    }
                    let translated = pos - offset + start;
                    if translated + 4 > end {
                        log::error!(
                            "Append range [{}, {}) cuts the object at {} short",
                            offset,
                            offset + len,
                            pos
                        );
                        return Err(ParcelError::InvalidArgument {
                            what: "object record",
                        });
                    }
                    let data = self.arena.bytes_mut();
                    let tag = read_i32_at(data, translated);
                    if tag != RPC_TYPE_NATIVE_FILE_DESCRIPTOR {
                        ours.positions.push(translated as u32);
                        continue;
                    }
                    if !self.allow_fds {
                        return Err(ParcelError::fds_not_allowed());
                    }
                    if translated + 8 > end {
                        return Err(ParcelError::InvalidArgument { what: "fd record" });
                    }
                    let index = read_i32_at(data, translated + 4);
                    let source_fd = usize::try_from(index)
                        .ok()
                        .and_then(|index| theirs.fds.get(index))
                        .ok_or(ParcelError::InvalidArgument { what: "fd index" })?;
                    // Always duplicate, even descriptors the source only borrowed
                    let dup = os::dup_fd(source_fd.raw())?;
                    ours.fds.push(ParcelFd::Owned(dup));
                    ours.positions.push(translated as u32);
                    let new_index = (ours.fds.len() - 1) as i32;
                    data[translated + 4..translated + 8].copy_from_slice(&new_index.to_ne_bytes());
                }
                Ok(())
            }
            _ => Err(ParcelError::ProtocolViolation {
                reason: "parcels use different encodings",
            }),
        }
    }
}

fn read_i32_at(data: &[u8], at: usize) -> i32 {
    i32::from_ne_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn try_read_i32_at(data: &[u8], at: usize) -> Option<i32> {
    let bytes = data.get(at..at.checked_add(4)?)?;
    Some(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl Drop for Parcel {
    fn drop(&mut self) {
        self.free_data_no_init();
    }
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(err) = &self.error {
            return write!(f, "Parcel(error: {err})");
        }
        let data = self.data();
        writeln!(
            f,
            "Parcel({} bytes, position {}, {}) {{",
            data.len(),
            self.arena.pos,
            if self.is_for_rpc() { "rpc" } else { "kernel" }
        )?;
        for (row, chunk) in data.chunks(16).enumerate() {
            write!(f, "  {:08x}:", row * 16)?;
            for byte in chunk {
                write!(f, " {byte:02x}")?;
            }
            writeln!(f)?;
        }
        match &self.variant {
            Variant::Kernel(kernel) => {
                for (i, &offset) in kernel.objects.iter().enumerate() {
                    let obj = FlatObject::read_at(self.arena.bytes(), offset as usize);
                    writeln!(
                        f,
                        "  Object #{i} @ {offset}: {:?} = {:#x}",
                        obj.kind, obj.binder
                    )?;
                }
            }
            Variant::Rpc(rpc) => {
                for (i, pos) in rpc.positions.iter().enumerate() {
                    writeln!(f, "  Object #{i} @ {pos}")?;
                }
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalRegistry;
    use crate::arena::{global_alloc_count, global_alloc_size, MIN_CAPACITY, ZEROED_BYTES};
    use crate::object::ObjectFlags;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::Mutex;

    fn raw_dev_null() -> RawFd {
        std::fs::File::open("/dev/null").unwrap().into_raw_fd()
    }

    /// Nonblocking pipe: the owned read end and the raw write end
    fn pipe() -> (OwnedFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
        (unsafe { OwnedFd::from_raw_fd(fds[0]) }, fds[1])
    }

    /// A read of EOF means every copy of the write end is closed
    fn write_end_closed(read_end: &OwnedFd) -> bool {
        let mut byte = 0u8;
        let n = unsafe {
            libc::read(
                read_end.as_raw_fd(),
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
            )
        };
        n == 0
    }

    fn parcel_with(registry: &Arc<LocalRegistry>) -> Parcel {
        Parcel::with_registry(registry.clone(), ParcelConfig::default())
    }

    #[test]
    fn test_first_write_allocates_minimum_capacity() {
        let mut parcel = Parcel::new();
        assert_eq!(parcel.data_capacity(), 0);
        parcel.write_i32(1).unwrap();
        assert_eq!(parcel.data_capacity(), crate::arena::MIN_CAPACITY);
        assert_eq!(parcel.data_size(), 4);
    }

    #[test]
    fn test_grow_rejects_position_past_size() {
        let mut parcel = Parcel::new();
        parcel.set_data_position(8);
        assert!(matches!(
            parcel.write_i32(1),
            Err(ParcelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_set_data_rejects_huge_lengths() {
        let mut parcel = Parcel::new();
        assert!(matches!(
            parcel.set_data_size(MAX_LEN + 1),
            Err(ParcelError::InvalidArgument { .. })
        ));
        assert!(matches!(
            parcel.set_data_capacity(usize::MAX),
            Err(ParcelError::InvalidArgument { .. })
        ));
    }

    #[test]
    #[should_panic]
    fn test_set_data_position_past_i32_is_fatal() {
        let mut parcel = Parcel::new();
        parcel.set_data_position(MAX_LEN + 1);
    }

    #[test]
    fn test_set_data_copies_bytes() {
        let mut parcel = Parcel::new();
        parcel.set_data(&[1, 0, 0, 0, 2, 0, 0, 0]).unwrap();
        assert_eq!(parcel.data_size(), 8);
        assert_eq!(parcel.data_position(), 0);
        assert_eq!(parcel.read_i32().unwrap(), i32::from_ne_bytes([1, 0, 0, 0]));
    }

    #[test]
    fn test_borrowed_buffer_copied_on_write() {
        let released = Arc::new(Mutex::new(None));
        let sink = released.clone();
        let mut parcel = Parcel::new();
        let mut payload = Vec::new();
        payload.extend_from_slice(&7i32.to_ne_bytes());
        parcel.ipc_set_data_reference(payload.into_boxed_slice(), Vec::new(), move |buf| {
            *sink.lock().unwrap() = Some(buf.data.len());
        });
        assert_eq!(parcel.read_i32().unwrap(), 7);

        // Writing past the end forces a private copy
        parcel.write_i32(8).unwrap();
        assert_eq!(*released.lock().unwrap(), Some(4));
        parcel.set_data_position(0);
        assert_eq!(parcel.read_i32().unwrap(), 7);
        assert_eq!(parcel.read_i32().unwrap(), 8);
    }

    #[test]
    fn test_borrowed_buffer_released_on_drop() {
        let released = Arc::new(Mutex::new(false));
        let sink = released.clone();
        {
            let mut parcel = Parcel::new();
            parcel.ipc_set_data_reference(vec![0u8; 8].into_boxed_slice(), Vec::new(), move |_| {
                *sink.lock().unwrap() = true;
            });
        }
        assert!(*released.lock().unwrap());
    }

    #[test]
    fn test_ingest_discards_overlapping_offsets() {
        let mut data = vec![0u8; 48];
        FlatObject::null_binder().write_at(&mut data, 0);
        FlatObject::null_binder().write_at(&mut data, 24);
        let mut parcel = Parcel::new();
        parcel.ipc_set_data_reference(data.clone().into_boxed_slice(), vec![0, 24], |_| {});
        assert_eq!(parcel.objects_count(), 2);

        parcel.ipc_set_data_reference(data.clone().into_boxed_slice(), vec![0, 12], |_| {});
        assert_eq!(parcel.objects_count(), 0);

        parcel.ipc_set_data_reference(data.into_boxed_slice(), vec![40], |_| {});
        assert_eq!(parcel.objects_count(), 0);
    }

    #[test]
    fn test_shrink_releases_dropped_objects() {
        let registry = Arc::new(LocalRegistry::new());
        let mut parcel = parcel_with(&registry);
        parcel.write_i32(1).unwrap();
        parcel.write_strong_binder(Some(&Binder::Local(0x40))).unwrap();
        assert_eq!(registry.strong_count(&Binder::Local(0x40)), 1);

        parcel.set_data_size(4).unwrap();
        assert_eq!(parcel.objects_count(), 0);
        assert_eq!(registry.strong_count(&Binder::Local(0x40)), 0);
    }

    #[test]
    fn test_mark_for_rpc_after_write_rejected() {
        struct NoSession;
        impl RpcSession for NoSession {
            fn fd_transport_mode(&self) -> crate::FdTransportMode {
                crate::FdTransportMode::None
            }
            fn on_binder_leaving(&self, _binder: &Binder) -> Result<u64> {
                Ok(1)
            }
            fn on_binder_entering(&self, _address: u64) -> Result<Binder> {
                Ok(Binder::Remote(1))
            }
            fn flush_excess_binder_refs(&self, _address: u64, _binder: &Binder) -> Result<()> {
                Ok(())
            }
        }

        let mut parcel = Parcel::new();
        parcel.write_i32(1).unwrap();
        assert!(matches!(
            parcel.mark_for_rpc(Arc::new(NoSession)),
            Err(ParcelError::ProtocolViolation { .. })
        ));
        parcel.free_data();
        assert!(parcel.mark_for_rpc(Arc::new(NoSession)).is_ok());
        assert!(parcel.is_for_rpc());
    }

    #[test]
    fn test_push_allow_fds() {
        let mut parcel = Parcel::new();
        let previous = parcel.push_allow_fds(false);
        assert!(previous);
        assert!(!parcel.allow_fds());
        assert!(!parcel.push_allow_fds(true));
        assert!(!parcel.allow_fds());
        parcel.restore_allow_fds(previous);
        assert!(parcel.allow_fds());
    }

    #[test]
    fn test_enforce_no_data_avail() {
        let mut parcel = Parcel::new();
        parcel.write_i32(1).unwrap();
        parcel.set_data_position(0);
        assert!(matches!(
            parcel.enforce_no_data_avail(),
            Err(ParcelError::NotFullyConsumed { unread: 4 })
        ));
        parcel.set_enforce_no_data_avail(false);
        assert!(parcel.enforce_no_data_avail().is_ok());
        parcel.set_enforce_no_data_avail(true);
        parcel.read_i32().unwrap();
        assert!(parcel.enforce_no_data_avail().is_ok());
    }

    #[test]
    fn test_shrink_after_out_of_order_write_drops_tail_objects() {
        let registry = Arc::new(LocalRegistry::new());
        let mut parcel = parcel_with(&registry);
        for i in 0..18 {
            parcel.write_i32(i).unwrap();
        }
        parcel.write_strong_binder(Some(&Binder::Local(0x72))).unwrap();
        parcel.write_strong_binder(Some(&Binder::Local(0x73))).unwrap();

        // The read sorts the table; the write then lands below its last entry
        parcel.set_data_position(0);
        parcel.read_i32().unwrap();
        parcel.write_strong_binder(Some(&Binder::Local(0x74))).unwrap();
        assert_eq!(parcel.ipc_objects(), &[72, 96, 4]);

        parcel.set_data_size(60).unwrap();
        assert_eq!(parcel.ipc_objects(), &[4]);
        assert_eq!(registry.strong_count(&Binder::Local(0x72)), 0);
        assert_eq!(registry.strong_count(&Binder::Local(0x73)), 0);
        assert_eq!(registry.strong_count(&Binder::Local(0x74)), 1);

        parcel.set_data_size(120).unwrap();
        parcel.set_data_position(72);
        assert!(matches!(
            parcel.read_strong_binder(),
            Err(ParcelError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_borrowed_shrink_after_out_of_order_write() {
        let mut data = vec![0u8; 96];
        FlatObject::fd(raw_dev_null(), false).write_at(&mut data, 48);
        FlatObject::fd(raw_dev_null(), false).write_at(&mut data, 72);
        let releases = Arc::new(Mutex::new(0));
        let sink = releases.clone();

        let mut parcel = Parcel::new();
        parcel.ipc_set_data_reference(data.into_boxed_slice(), vec![48, 72], move |_| {
            *sink.lock().unwrap() += 1;
        });
        parcel.read_i32().unwrap();
        parcel
            .write_object(&FlatObject::fd(raw_dev_null(), true), true)
            .unwrap();
        assert_eq!(parcel.ipc_objects(), &[48, 72, 4]);

        parcel.set_data_size(60).unwrap();
        assert_eq!(parcel.ipc_objects(), &[4]);
        assert_eq!(parcel.data_buffer_size(), 60);
        assert_eq!(*releases.lock().unwrap(), 1);
        assert!(FlatObject::read_at(parcel.data(), 4).owns_fd());
    }

    #[test]
    fn test_borrowed_buffer_with_objects_copied_on_shrink() {
        let registry = Arc::new(LocalRegistry::new());
        let local = Binder::Local(0x77);
        let kept_fd = raw_dev_null();
        let (read_end, dropped_fd) = pipe();

        let mut data = vec![0u8; 72];
        FlatObject::fd(kept_fd, false).write_at(&mut data, 0);
        FlatObject {
            kind: ObjectKind::Binder,
            flags: ObjectFlags::empty(),
            binder: 0x77,
            cookie: 0x77,
        }
        .write_at(&mut data, 24);
        FlatObject::fd(dropped_fd, false).write_at(&mut data, 48);

        let releases = Arc::new(Mutex::new(Vec::new()));
        let sink = releases.clone();
        let mut parcel = parcel_with(&registry);
        parcel.ipc_set_data_reference(data.into_boxed_slice(), vec![0, 24, 48], move |buf| {
            sink.lock().unwrap().push(buf.objects);
        });
        assert_eq!(registry.strong_count(&local), 0);

        parcel.set_data_size(48).unwrap();
        assert_eq!(*releases.lock().unwrap(), vec![vec![0, 24, 48]]);
        assert_eq!(parcel.ipc_objects(), &[0, 24]);
        assert_eq!(registry.strong_count(&local), 1);
        assert!(write_end_closed(&read_end));

        // Descriptors kept from a borrowed buffer now belong to the parcel
        let kept = FlatObject::read_at(parcel.data(), 0);
        assert_eq!(kept.fd_number(), kept_fd);
        assert!(kept.owns_fd());

        drop(parcel);
        assert_eq!(releases.lock().unwrap().len(), 1);
        assert_eq!(registry.strong_count(&local), 0);
    }

    #[test]
    fn test_sensitive_parcel_zeroes_released_memory() {
        let mut parcel = Parcel::new();
        parcel.mark_sensitive();
        assert!(parcel.is_sensitive());
        parcel.write(&[0xa5; 100]).unwrap();
        let first_capacity = parcel.data_capacity();

        let before = ZEROED_BYTES.load(AtomicOrdering::Relaxed);
        parcel.write(&[0x5a; 100]).unwrap();
        let after_grow = ZEROED_BYTES.load(AtomicOrdering::Relaxed);
        assert!(parcel.data_capacity() > first_capacity);
        assert!(after_grow - before >= first_capacity);
        assert_eq!(&parcel.data()[..100], &[0xa5; 100][..]);
        assert_eq!(&parcel.data()[100..200], &[0x5a; 100][..]);

        let capacity = parcel.data_capacity();
        parcel.free_data();
        assert!(ZEROED_BYTES.load(AtomicOrdering::Relaxed) - after_grow >= capacity);
        assert_eq!(parcel.data_capacity(), 0);
    }

    #[test]
    fn test_global_alloc_stats_track_live_buffers() {
        let mut parcel = Parcel::new();
        parcel.write_i32(1).unwrap();
        assert_eq!(parcel.data_capacity(), MIN_CAPACITY);
        assert!(global_alloc_count() >= 1);
        assert!(global_alloc_size() >= parcel.data_capacity());
    }

    #[test]
    fn test_compare_data_orders_by_size_first() {
        let mut shorter = Parcel::new();
        let mut longer = Parcel::new();
        shorter.set_data(&[2]).unwrap();
        longer.set_data(&[1, 2]).unwrap();
        assert_eq!(shorter.compare_data(&longer), Ordering::Less);
        assert_eq!(longer.compare_data(&shorter), Ordering::Greater);
    }

    #[test]
    fn test_compare_data() {
        let mut a = Parcel::new();
        let mut b = Parcel::new();
        a.write_i32(1).unwrap();
        b.write_i32(1).unwrap();
        assert_eq!(a.compare_data(&b), Ordering::Equal);
        b.write_i32(2).unwrap();
        assert_eq!(a.compare_data(&b), Ordering::Less);
        assert_eq!(a.compare_data_in_range(0, &b, 0, 4).unwrap(), Ordering::Equal);
        assert!(a.compare_data_in_range(0, &b, 4, 8).is_err());
    }

    #[test]
    fn test_debug_output() {
        let mut parcel = Parcel::new();
        parcel.write_i32(0x11).unwrap();
        let text = format!("{parcel:?}");
        assert!(text.contains("00000000: 11 00 00 00"));
        assert!(text.contains("kernel"));
    }
}
