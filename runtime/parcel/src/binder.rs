//! References and File Descriptors
//!
//! Writing a reference or descriptor embeds a special-object record and
//! records its position in the active object table. The kernel encoding
//! stores a full 24-byte record and reports the reference to the object
//! registry. The RPC encoding stores a tag followed by a session address
//! or an index into the parcel's descriptor list.

use core::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};

use crate::object::{
    Binder, FlatObject, ObjectFlags, ObjectKind, FLAT_OBJECT_SIZE, RPC_TYPE_BINDER,
    RPC_TYPE_BINDER_NULL, RPC_TYPE_NATIVE_FILE_DESCRIPTOR, SCHED_NORMAL,
};
use crate::parcel::{Parcel, Variant};
use crate::registry::acquire_object;
use crate::rpc::ParcelFd;
use crate::{os, ParcelError, Result};

/// Priority hint attached to local references unless background
/// scheduling is disabled
const DEFAULT_MIN_PRIORITY: u32 = 19;

/// Status a reader sends back over the comm channel of a parcel fd
/// (`ParcelFileDescriptor.DETACHED`), always big-endian
const PFD_STATUS_DETACHED: i32 = 2;

impl Parcel {
    // ---------------------------------------------------------------
    // Raw kernel records
    // ---------------------------------------------------------------

    /// Append a kernel record at the cursor
    ///
    /// The record is entered in the object table (and acquired) when
    /// `null_metadata` is set or its `binder` field is non-zero. A null
    /// reference is written as bytes only.
    ///
    /// # Errors
    /// - `ProtocolViolation` for RPC parcels.
    /// - `PermissionDenied` for a descriptor record while descriptors are
    ///   disallowed; the object table is left untouched.
    pub fn write_object(&mut self, obj: &FlatObject, null_metadata: bool) -> Result<()> {
        if self.is_for_rpc() {
            return Err(ParcelError::ProtocolViolation {
                reason: "raw records require the kernel encoding",
            });
        }
        if obj.kind == ObjectKind::Fd && !self.allow_fds {
            log::error!("File descriptors are not allowed in this parcel");
            return Err(ParcelError::fds_not_allowed());
        }
        let record = null_metadata || obj.binder != 0;

        loop {
            let pos = self.arena.pos;
            let end = pos
                .checked_add(FLAT_OBJECT_SIZE)
                .ok_or(ParcelError::ResourceExhausted {
                    requested: FLAT_OBJECT_SIZE,
                })?;
            let enough_data = end <= self.arena.capacity();
            let enough_objects = match &self.variant {
                Variant::Kernel(kernel) => kernel.has_room(),
                Variant::Rpc(_) => true,
            };

            if enough_data && enough_objects {
                self.validate_access(end)?;
                obj.write_at(self.arena.bytes_mut(), pos);
                if let Variant::Kernel(kernel) = &mut self.variant {
                    if obj.kind == ObjectKind::Fd {
                        kernel.has_fds = true;
                        kernel.fds_known = true;
                    }
                    if record {
                        kernel.push_object(pos as u64);
                        acquire_object(&*self.registry, obj, self.owner);
                    }
                }
                self.finish_write(FLAT_OBJECT_SIZE);
                return Ok(());
            }

            if !enough_data {
                self.grow_data(FLAT_OBJECT_SIZE)?;
            }
            if !enough_objects {
                if let Variant::Kernel(kernel) = &mut self.variant {
                    kernel.reserve(1).map_err(|err| {
                        log::error!("Failed to grow object table: {}", err);
                        err
                    })?;
                }
            }
        }
    }

    /// Read the kernel record at the cursor
    ///
    /// A record with zero `binder` and `cookie` is accepted without a
    /// table lookup unless `null_metadata` is set. Any other record must
    /// appear in the object table. The cursor advances past the record
    /// either way.
    ///
    /// # Errors
    /// - `NotEnoughData` if fewer than 24 bytes remain.
    /// - `ProtocolViolation` for RPC parcels or if no object is recorded at
    ///   the cursor.
    pub fn read_object(&mut self, null_metadata: bool) -> Result<FlatObject> {
        let pos = self.arena.pos;
        let size = self.arena.size;
        let Variant::Kernel(kernel) = &mut self.variant else {
            return Err(ParcelError::ProtocolViolation {
                reason: "raw records require the kernel encoding",
            });
        };
        if pos.checked_add(FLAT_OBJECT_SIZE).map_or(true, |end| end > size) {
            return Err(ParcelError::NotEnoughData {
                position: pos,
                requested: FLAT_OBJECT_SIZE,
                size,
            });
        }

        let obj = FlatObject::read_at(self.arena.bytes(), pos);
        self.arena.pos = pos + FLAT_OBJECT_SIZE;
        if !null_metadata && obj.cookie == 0 && obj.binder == 0 {
            // Null references are never entered in the table
            return Ok(obj);
        }
        if kernel.find_object(pos).is_some() {
            return Ok(obj);
        }
        if !self.service_fuzzing {
            log::warn!(
                "Attempt to read object at offset {} that is not in the object list",
                pos
            );
        }
        Err(ParcelError::ProtocolViolation {
            reason: "no object recorded at position",
        })
    }

    // ---------------------------------------------------------------
    // Strong references
    // ---------------------------------------------------------------

    /// Write a reference, or a null placeholder for `None`
    ///
    /// Local references pick up the registry's per-object attributes
    /// (security context, real-time inheritance, minimum scheduling).
    pub fn write_strong_binder(&mut self, binder: Option<&Binder>) -> Result<()> {
        if let Variant::Rpc(rpc) = &self.variant {
            let session = rpc.session.clone();
            let Some(binder) = binder else {
                return self.write_i32(RPC_TYPE_BINDER_NULL);
            };
            self.write_i32(RPC_TYPE_BINDER)?;
            let address = session.on_binder_leaving(binder)?;
            return self.write_u64(address);
        }

        let mut sched = if self.config.background_scheduling_disabled {
            ObjectFlags::empty()
        } else {
            ObjectFlags::sched_policy(SCHED_NORMAL, DEFAULT_MIN_PRIORITY)
        };
        let mut obj = match binder {
            None => FlatObject::null_binder(),
            Some(Binder::Remote(handle)) => FlatObject {
                kind: ObjectKind::Handle,
                flags: ObjectFlags::empty(),
                binder: u64::from(*handle),
                cookie: 0,
            },
            Some(Binder::Local(id)) => {
                let attributes = self.registry.local_attributes(*id);
                if let Some((policy, priority)) = attributes.min_sched {
                    if policy != 0 || priority != 0 {
                        sched = ObjectFlags::sched_policy(policy, priority);
                    }
                }
                let mut flags = ObjectFlags::ACCEPTS_FDS;
                if attributes.requesting_sid {
                    flags |= ObjectFlags::TXN_SECURITY_CTX;
                }
                if attributes.inherit_rt {
                    flags |= ObjectFlags::INHERIT_RT;
                }
                FlatObject {
                    kind: ObjectKind::Binder,
                    flags,
                    binder: *id,
                    cookie: *id,
                }
            }
        };
        obj.flags |= sched;
        self.write_object(&obj, false)
    }

    /// Read a reference that may be null
    ///
    /// Remote handles the registry cannot resolve read as `None`.
    pub fn read_nullable_strong_binder(&mut self) -> Result<Option<Binder>> {
        if let Variant::Rpc(rpc) = &self.variant {
            let session = rpc.session.clone();
            let present = self.read_i32()?;
            if present & 1 == 0 {
                return Ok(None);
            }
            let address = self.read_u64()?;
            let binder = session.on_binder_entering(address)?;
            session.flush_excess_binder_refs(address, &binder)?;
            return Ok(Some(binder));
        }

        let obj = self.read_object(false)?;
        match obj.kind {
            ObjectKind::Binder if obj.cookie == 0 => Ok(None),
            ObjectKind::Binder => Ok(Some(Binder::Local(obj.cookie))),
            ObjectKind::Handle => Ok(self.registry.resolve_remote(obj.handle())),
            _ => Err(ParcelError::ProtocolViolation {
                reason: "record is not a reference",
            }),
        }
    }

    /// # Errors
    /// `UnexpectedNull` if the reference is null
    pub fn read_strong_binder(&mut self) -> Result<Binder> {
        self.read_nullable_strong_binder()?
            .ok_or(ParcelError::UnexpectedNull)
    }

    /// Reference at the cursor, or `None` on any failure
    pub fn strong_binder_or_none(&mut self) -> Option<Binder> {
        self.read_nullable_strong_binder().ok().flatten()
    }

    pub fn write_strong_binder_vector(&mut self, binders: &[Binder]) -> Result<()> {
        crate::arena::check_len(binders.len(), "vector length")?;
        self.write_i32(binders.len() as i32)?;
        for binder in binders {
            self.write_strong_binder(Some(binder))?;
        }
        Ok(())
    }

    pub fn read_strong_binder_vector(&mut self) -> Result<Vec<Binder>> {
        let count = self
            .read_vector_size(size_of::<Binder>())?
            .ok_or(ParcelError::UnexpectedNull)?;
        let mut binders = Vec::with_capacity(count);
        for _ in 0..count {
            binders.push(self.read_strong_binder()?);
        }
        Ok(binders)
    }

    // ---------------------------------------------------------------
    // File descriptors
    // ---------------------------------------------------------------

    /// Embed a descriptor the caller keeps open while the parcel is in use
    pub fn write_file_descriptor(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        self.push_fd(ParcelFd::Borrowed(fd.as_raw_fd()))
    }

    /// Embed a descriptor the parcel closes when done with it
    ///
    /// The descriptor is closed if the write fails.
    pub fn write_owned_file_descriptor(&mut self, fd: OwnedFd) -> Result<()> {
        self.push_fd(ParcelFd::Owned(fd))
    }

    /// Embed a duplicate of `fd`
    pub fn write_dup_file_descriptor(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        let dup = os::dup_fd(fd.as_raw_fd())?;
        self.write_owned_file_descriptor(dup)
    }

    fn push_fd(&mut self, fd: ParcelFd) -> Result<()> {
        let rpc = match &self.variant {
            Variant::Rpc(rpc) => Some((rpc.session.fd_transport_mode(), rpc.fds.len())),
            Variant::Kernel(_) => None,
        };

        let Some((mode, index)) = rpc else {
            let (raw, owned) = match fd {
                ParcelFd::Owned(fd) => (fd.into_raw_fd(), true),
                ParcelFd::Borrowed(raw) => (raw, false),
            };
            let result = self.write_object(&FlatObject::fd(raw, owned), true);
            if result.is_err() && owned {
                os::close_fd(raw);
            }
            return result;
        };

        if !self.allow_fds {
            log::error!("File descriptors are not allowed in this parcel");
            return Err(ParcelError::fds_not_allowed());
        }
        if !mode.is_supported() {
            log::error!(
                "File descriptors are not allowed in this RPC session; both peers must agree on a transport mode"
            );
            return Err(ParcelError::fds_not_allowed());
        }
        let pos = u32::try_from(self.arena.pos).map_err(|_| ParcelError::ResourceExhausted {
            requested: self.arena.pos,
        })?;
        // Tag and index are reserved as one record
        let range = self.write_inplace_range(8)?;
        let record = &mut self.arena.bytes_mut()[range];
        record[..4].copy_from_slice(&RPC_TYPE_NATIVE_FILE_DESCRIPTOR.to_ne_bytes());
        record[4..].copy_from_slice(&(index as i32).to_ne_bytes());
        if let Variant::Rpc(rpc) = &mut self.variant {
            rpc.positions.push(pos);
            rpc.fds.push(fd);
        }
        Ok(())
    }

    /// Descriptor at the cursor; the parcel keeps ownership of it
    ///
    /// # Errors
    /// - `ProtocolViolation` if no descriptor is recorded at the cursor.
    /// - `InvalidArgument` if an RPC record names an index past the
    ///   descriptor list.
    pub fn read_file_descriptor(&mut self) -> Result<RawFd> {
        if !self.is_for_rpc() {
            let obj = self.read_object(true)?;
            if obj.kind == ObjectKind::Fd {
                return Ok(obj.fd_number());
            }
            return Err(ParcelError::ProtocolViolation {
                reason: "record is not a file descriptor",
            });
        }

        let pos = self.arena.pos;
        let recorded = match (&self.variant, u32::try_from(pos)) {
            (Variant::Rpc(rpc), Ok(pos)) => rpc.positions.binary_search(&pos).is_ok(),
            _ => false,
        };
        if !recorded {
            if !self.service_fuzzing {
                log::warn!(
                    "Attempt to read file descriptor at offset {} that is not in the object list",
                    pos
                );
            }
            return Err(ParcelError::ProtocolViolation {
                reason: "no descriptor recorded at position",
            });
        }

        if self.read_i32()? != RPC_TYPE_NATIVE_FILE_DESCRIPTOR {
            return Err(ParcelError::ProtocolViolation {
                reason: "record is not a file descriptor",
            });
        }
        let index = self.read_i32()?;
        let Variant::Rpc(rpc) = &self.variant else {
            return Err(ParcelError::ProtocolViolation {
                reason: "parcels use different encodings",
            });
        };
        match usize::try_from(index).ok().and_then(|index| rpc.fds.get(index)) {
            Some(fd) => Ok(fd.raw()),
            None => {
                log::error!(
                    "RPC parcel contains invalid fd index {} (fd count {})",
                    index,
                    rpc.fds.len()
                );
                Err(ParcelError::InvalidArgument { what: "fd index" })
            }
        }
    }

    /// Duplicate of the descriptor at the cursor, owned by the caller
    pub fn read_unique_file_descriptor(&mut self) -> Result<OwnedFd> {
        let fd = self.read_file_descriptor()?;
        os::dup_fd(fd)
    }

    /// Descriptor preceded by a "has comm channel" word (always 0 here)
    pub fn write_parcel_file_descriptor(&mut self, fd: OwnedFd) -> Result<()> {
        self.write_i32(0)?;
        self.write_owned_file_descriptor(fd)
    }

    /// Read a parcel fd, detaching it from its comm channel if one follows
    pub fn read_parcel_file_descriptor(&mut self) -> Result<RawFd> {
        let has_comm = self.read_i32()?;
        let fd = self.read_file_descriptor()?;
        if has_comm != 0 {
            let comm = self.read_file_descriptor()?;
            if let Err(err) = os::write_all(comm, &PFD_STATUS_DETACHED.to_be_bytes()) {
                log::warn!("Failed to detach parcel file descriptor: {}", err);
                return Err(ParcelError::ProtocolViolation {
                    reason: "failed to detach parcel file descriptor",
                });
            }
        }
        Ok(fd)
    }

    /// Count followed by a duplicate of each descriptor
    pub fn write_unique_fd_vector<F: AsFd>(&mut self, fds: &[F]) -> Result<()> {
        crate::arena::check_len(fds.len(), "vector length")?;
        self.write_i32(fds.len() as i32)?;
        for fd in fds {
            self.write_dup_file_descriptor(fd.as_fd())?;
        }
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` if the count exceeds the configured descriptor
    /// limit
    pub fn read_unique_fd_vector(&mut self) -> Result<Vec<OwnedFd>> {
        let count = self
            .read_vector_size(size_of::<RawFd>())?
            .ok_or(ParcelError::UnexpectedNull)?;
        if count > self.config.max_fds {
            log::error!("Descriptor vector of {} exceeds limit {}", count, self.config.max_fds);
            return Err(ParcelError::InvalidArgument { what: "fd count" });
        }
        let mut fds = Vec::with_capacity(count);
        for _ in 0..count {
            fds.push(self.read_unique_file_descriptor()?);
        }
        Ok(fds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParcelConfig;
    use crate::registry::{LocalAttributes, LocalRegistry};
    use crate::session::{FdTransportMode, RpcSession};
    use alloc::sync::Arc;

    fn dev_null() -> OwnedFd {
        std::fs::File::open("/dev/null").unwrap().into()
    }

    struct TestSession(FdTransportMode);

    impl RpcSession for TestSession {
        fn fd_transport_mode(&self) -> FdTransportMode {
            self.0
        }
        fn on_binder_leaving(&self, binder: &Binder) -> Result<u64> {
            match binder {
                Binder::Local(id) => Ok(*id),
                Binder::Remote(handle) => Ok(u64::from(*handle) | 1 << 32),
            }
        }
        fn on_binder_entering(&self, address: u64) -> Result<Binder> {
            Ok(Binder::Local(address))
        }
        fn flush_excess_binder_refs(&self, _address: u64, _binder: &Binder) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_local_binder_record() {
        let registry = Arc::new(LocalRegistry::new());
        let mut parcel = Parcel::with_registry(registry.clone(), ParcelConfig::default());
        parcel.write_strong_binder(Some(&Binder::Local(0x77))).unwrap();
        assert_eq!(parcel.ipc_objects(), &[0]);
        assert_eq!(registry.strong_count(&Binder::Local(0x77)), 1);

        let obj = FlatObject::read_at(parcel.data(), 0);
        assert_eq!(obj.kind, ObjectKind::Binder);
        assert!(obj.flags.contains(ObjectFlags::ACCEPTS_FDS));
        assert_eq!(obj.flags.bits() & 0xff, 19);

        parcel.set_data_position(0);
        assert_eq!(parcel.read_strong_binder().unwrap(), Binder::Local(0x77));
    }

    #[test]
    fn test_local_attributes_fold_into_flags() {
        let registry = Arc::new(LocalRegistry::new());
        registry.set_local_attributes(
            5,
            LocalAttributes {
                requesting_sid: true,
                inherit_rt: true,
                min_sched: Some((1, 10)),
            },
        );
        let mut parcel = Parcel::with_registry(registry, ParcelConfig::default());
        parcel.write_strong_binder(Some(&Binder::Local(5))).unwrap();
        let flags = FlatObject::read_at(parcel.data(), 0).flags;
        assert!(flags.contains(ObjectFlags::TXN_SECURITY_CTX | ObjectFlags::INHERIT_RT));
        assert_eq!(flags.bits() & 0xff, 10);
        assert_eq!((flags.bits() >> 9) & 3, 1);
    }

    #[test]
    fn test_background_scheduling_disabled() {
        let config = ParcelConfig::default().with_background_scheduling_disabled(true);
        let mut parcel = Parcel::with_config(config);
        parcel.write_strong_binder(None).unwrap();
        assert_eq!(FlatObject::read_at(parcel.data(), 0).flags, ObjectFlags::empty());
    }

    #[test]
    fn test_null_binder_not_recorded() {
        let mut parcel = Parcel::new();
        parcel.write_strong_binder(None).unwrap();
        assert_eq!(parcel.objects_count(), 0);
        assert_eq!(parcel.data_size(), FLAT_OBJECT_SIZE);
        parcel.set_data_position(0);
        assert_eq!(parcel.read_nullable_strong_binder().unwrap(), None);
        parcel.set_data_position(0);
        assert!(matches!(
            parcel.read_strong_binder(),
            Err(ParcelError::UnexpectedNull)
        ));
    }

    #[test]
    fn test_remote_handle_resolution() {
        let registry = Arc::new(LocalRegistry::new());
        registry.register_remote(9);
        let mut parcel = Parcel::with_registry(registry.clone(), ParcelConfig::default());
        parcel.write_strong_binder(Some(&Binder::Remote(9))).unwrap();
        parcel.write_strong_binder(Some(&Binder::Remote(12))).unwrap();
        assert_eq!(registry.strong_count(&Binder::Remote(9)), 1);

        parcel.set_data_position(0);
        assert_eq!(parcel.read_strong_binder().unwrap(), Binder::Remote(9));
        // Unregistered handles are dead
        assert_eq!(parcel.strong_binder_or_none(), None);
        drop(parcel);
        assert_eq!(registry.strong_count(&Binder::Remote(9)), 0);
    }

    #[test]
    fn test_unrecorded_object_rejected() {
        let mut parcel = Parcel::new();
        let mut record = [0u8; FLAT_OBJECT_SIZE];
        FlatObject::fd(3, false).write_at(&mut record, 0);
        parcel.write(&record).unwrap();
        parcel.set_data_position(0);
        assert!(matches!(
            parcel.read_file_descriptor(),
            Err(ParcelError::ProtocolViolation { .. })
        ));
        assert_eq!(parcel.data_position(), FLAT_OBJECT_SIZE);
    }

    #[test]
    fn test_kernel_fd_round_trip() {
        let fd = dev_null();
        let mut parcel = Parcel::new();
        parcel.write_file_descriptor(fd.as_fd()).unwrap();
        assert!(parcel.has_file_descriptors());
        parcel.set_data_position(0);
        assert_eq!(parcel.read_file_descriptor().unwrap(), fd.as_raw_fd());
    }

    #[test]
    fn test_kernel_fds_disallowed() {
        let fd = dev_null();
        let mut parcel = Parcel::new();
        parcel.set_allow_fds(false);
        let err = parcel.write_dup_file_descriptor(fd.as_fd()).unwrap_err();
        assert_eq!(err.status_code(), crate::error::STATUS_FDS_NOT_ALLOWED);
        assert_eq!(parcel.objects_count(), 0);
        assert_eq!(parcel.data_size(), 0);
    }

    #[test]
    fn test_rpc_binder_round_trip() {
        let mut parcel = Parcel::new();
        parcel
            .mark_for_rpc(Arc::new(TestSession(FdTransportMode::None)))
            .unwrap();
        parcel.write_strong_binder(Some(&Binder::Local(0xabc))).unwrap();
        parcel.write_strong_binder(None).unwrap();
        assert_eq!(parcel.data_size(), 4 + 8 + 4);

        parcel.set_data_position(0);
        assert_eq!(parcel.read_strong_binder().unwrap(), Binder::Local(0xabc));
        assert_eq!(parcel.read_nullable_strong_binder().unwrap(), None);
    }

    #[test]
    fn test_rpc_fds_require_transport() {
        let fd = dev_null();
        let mut parcel = Parcel::new();
        parcel
            .mark_for_rpc(Arc::new(TestSession(FdTransportMode::None)))
            .unwrap();
        assert!(matches!(
            parcel.write_file_descriptor(fd.as_fd()),
            Err(ParcelError::PermissionDenied { .. })
        ));
        assert_eq!(parcel.data_size(), 0);
    }

    #[test]
    fn test_rpc_fd_record_written_whole_or_not_at_all() {
        let fd = dev_null();
        let mut parcel = Parcel::new();
        parcel
            .mark_for_rpc(Arc::new(TestSession(FdTransportMode::Unix)))
            .unwrap();
        parcel.write_i32(1).unwrap();
        assert_eq!(parcel.data_capacity(), crate::arena::MIN_CAPACITY);

        // Room for the tag but not the index, with the cursor past the data
        parcel.set_data_position(crate::arena::MIN_CAPACITY - 4);
        assert!(matches!(
            parcel.write_file_descriptor(fd.as_fd()),
            Err(ParcelError::InvalidArgument { .. })
        ));
        assert_eq!(parcel.data_buffer_size(), 4);
        assert_eq!(parcel.objects_count(), 0);
        assert!(!parcel.has_file_descriptors());

        parcel.set_data_position(4);
        parcel.write_file_descriptor(fd.as_fd()).unwrap();
        assert_eq!(&parcel.data()[4..8], &RPC_TYPE_NATIVE_FILE_DESCRIPTOR.to_ne_bytes());
        assert_eq!(&parcel.data()[8..12], &0i32.to_ne_bytes());
        assert_eq!(parcel.objects_count(), 1);
    }

    #[test]
    fn test_rpc_fd_read_requires_recorded_position() {
        let fd = dev_null();
        let mut parcel = Parcel::new();
        parcel
            .mark_for_rpc(Arc::new(TestSession(FdTransportMode::Unix)))
            .unwrap();
        parcel.write_i32(7).unwrap();
        parcel.write_file_descriptor(fd.as_fd()).unwrap();

        parcel.set_data_position(0);
        assert!(matches!(
            parcel.read_file_descriptor(),
            Err(ParcelError::ProtocolViolation { .. })
        ));
        parcel.set_data_position(4);
        assert_eq!(parcel.read_file_descriptor().unwrap(), fd.as_raw_fd());
    }

    #[test]
    fn test_parcel_file_descriptor() {
        let mut parcel = Parcel::new();
        parcel.write_parcel_file_descriptor(dev_null()).unwrap();
        parcel.set_data_position(0);
        let fd = parcel.read_parcel_file_descriptor().unwrap();
        assert!(os::is_valid_fd(fd));
    }

    #[test]
    fn test_vectors_of_objects() {
        let registry = Arc::new(LocalRegistry::new());
        let mut parcel = Parcel::with_registry(registry, ParcelConfig::default());
        let files = [dev_null(), dev_null()];
        parcel
            .write_strong_binder_vector(&[Binder::Local(1), Binder::Local(2)])
            .unwrap();
        parcel.write_unique_fd_vector(&files).unwrap();

        parcel.set_data_position(0);
        assert_eq!(
            parcel.read_strong_binder_vector().unwrap(),
            vec![Binder::Local(1), Binder::Local(2)]
        );
        let fds = parcel.read_unique_fd_vector().unwrap();
        assert_eq!(fds.len(), 2);
        for (dup, original) in fds.iter().zip(&files) {
            assert_ne!(dup.as_raw_fd(), original.as_raw_fd());
        }
    }
}
