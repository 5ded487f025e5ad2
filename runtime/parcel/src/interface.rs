//! Interface Tokens - Request header naming the target interface
//!
//! On the kernel encoding the interface name is preceded by three words:
//! the caller's strict-mode policy (with the penalty-gather bit forced on),
//! the work-source uid and a magic identifying the build flavour. Receivers
//! reject a magic that does not match their own. The RPC encoding carries
//! the name only.

use crate::parcel::{Parcel, Variant};
use crate::{ParcelError, Result};

/// Always set in the transmitted strict-mode policy word
pub const STRICT_MODE_PENALTY_GATHER: i32 = i32::MIN;

/// Work source value meaning "not attributed to another uid"
pub const UNSET_WORK_SOURCE: i32 = -1;

/// Calling-thread state carried in an interface header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadPolicy {
    pub strict_mode_policy: i32,
    /// Uid to propagate as the work source, if any
    pub work_source: Option<i32>,
}

/// Header fields read by [`Parcel::enforce_interface`]
///
/// The transport applies these to the serving thread. One-way calls
/// should ignore `strict_mode_policy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceHeader {
    pub strict_mode_policy: i32,
    pub work_source_uid: i32,
}

impl Parcel {
    /// Write the request header for `interface` with a default policy
    pub fn write_interface_token(&mut self, interface: &str) -> Result<()> {
        self.write_interface_token_with(interface, &ThreadPolicy::default())
    }

    pub fn write_interface_token_with(
        &mut self,
        interface: &str,
        policy: &ThreadPolicy,
    ) -> Result<()> {
        if !self.is_for_rpc() {
            self.write_i32(policy.strict_mode_policy | STRICT_MODE_PENALTY_GATHER)?;
            self.update_work_source_position();
            self.write_i32(policy.work_source.unwrap_or(UNSET_WORK_SOURCE))?;
            self.write_u32(self.config.header.magic())?;
        }
        self.write_utf8_as_utf16(interface)
    }

    /// Check the request header against `interface`
    ///
    /// In fuzzing mode a wrong magic or name is tolerated.
    ///
    /// # Errors
    /// `ProtocolViolation` if the magic or the interface name differs.
    pub fn enforce_interface(&mut self, interface: &str) -> Result<InterfaceHeader> {
        let mut header = InterfaceHeader {
            strict_mode_policy: 0,
            work_source_uid: UNSET_WORK_SOURCE,
        };

        if !self.is_for_rpc() {
            header.strict_mode_policy = self.read_i32()?;
            self.update_work_source_position();
            header.work_source_uid = self.read_i32()?;
            let magic = self.read_u32()?;
            let expected = self.config.header.magic();
            if magic != expected && !self.service_fuzzing {
                log::error!(
                    "Expecting header {:#x} but found {:#x}; mixed parcel builds?",
                    expected,
                    magic
                );
                return Err(ParcelError::ProtocolViolation {
                    reason: "interface header magic mismatch",
                });
            }
        }

        let expected: Vec<u16> = interface.encode_utf16().collect();
        match self.read_string16() {
            Ok(units) if units == expected => Ok(header),
            _ if self.service_fuzzing => Ok(header),
            Ok(units) => {
                log::warn!(
                    "enforce_interface expected '{}' but read '{}'",
                    interface,
                    String::from_utf16_lossy(&units)
                );
                Err(ParcelError::ProtocolViolation {
                    reason: "interface descriptor mismatch",
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Only the first header written or read is tracked
    fn update_work_source_position(&mut self) {
        let pos = self.arena.pos;
        if let Variant::Kernel(kernel) = &mut self.variant {
            kernel.work_source_pos.get_or_insert(pos);
        }
    }

    /// Overwrite the work source of the header already in the parcel
    ///
    /// Returns false if there is no header or the write fails.
    pub fn replace_calling_work_source_uid(&mut self, uid: i32) -> bool {
        let Variant::Kernel(kernel) = &self.variant else {
            return false;
        };
        let Some(header_pos) = kernel.work_source_pos else {
            return false;
        };
        let initial = self.arena.pos;
        self.set_data_position(header_pos);
        let written = self.write_i32(uid).is_ok();
        self.set_data_position(initial);
        written
    }

    /// Work source recorded in the header, or [`UNSET_WORK_SOURCE`]
    pub fn read_calling_work_source_uid(&mut self) -> i32 {
        let Variant::Kernel(kernel) = &self.variant else {
            return UNSET_WORK_SOURCE;
        };
        let Some(header_pos) = kernel.work_source_pos else {
            return UNSET_WORK_SOURCE;
        };
        let initial = self.arena.pos;
        self.set_data_position(header_pos);
        let uid = self.read_i32_or_default();
        self.set_data_position(initial);
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeaderVariant, ParcelConfig};

    #[test]
    fn test_header_layout() {
        let mut parcel = Parcel::new();
        let policy = ThreadPolicy {
            strict_mode_policy: 0x4,
            work_source: Some(1000),
        };
        parcel.write_interface_token_with("foo", &policy).unwrap();
        let data = parcel.data();
        assert_eq!(&data[0..4], &(0x4 | i32::MIN).to_ne_bytes());
        assert_eq!(&data[4..8], &1000i32.to_ne_bytes());
        assert_eq!(&data[8..12], &HeaderVariant::Unknown.magic().to_ne_bytes());
        assert_eq!(&data[12..16], &3i32.to_ne_bytes());
    }

    #[test]
    fn test_enforce_interface() {
        let mut parcel = Parcel::new();
        parcel.write_interface_token("android.os.IFoo").unwrap();
        parcel.set_data_position(0);
        let header = parcel.enforce_interface("android.os.IFoo").unwrap();
        assert_eq!(header.work_source_uid, UNSET_WORK_SOURCE);
        assert_eq!(header.strict_mode_policy, STRICT_MODE_PENALTY_GATHER);

        parcel.set_data_position(0);
        assert!(matches!(
            parcel.enforce_interface("android.os.IBar"),
            Err(ParcelError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_magic_mismatch() {
        let mut writer = Parcel::with_config(ParcelConfig::default().with_header(HeaderVariant::Vendor));
        writer.write_interface_token("IFoo").unwrap();

        let mut reader = Parcel::with_config(ParcelConfig::default().with_header(HeaderVariant::System));
        reader.set_data(writer.data()).unwrap();
        assert!(matches!(
            reader.enforce_interface("IFoo"),
            Err(ParcelError::ProtocolViolation { .. })
        ));

        reader.set_data_position(0);
        reader.set_service_fuzzing();
        assert!(reader.enforce_interface("IOther").is_ok());
    }

    #[test]
    fn test_work_source_replacement() {
        let mut parcel = Parcel::new();
        assert_eq!(parcel.read_calling_work_source_uid(), UNSET_WORK_SOURCE);
        assert!(!parcel.replace_calling_work_source_uid(5));

        parcel.write_interface_token("IFoo").unwrap();
        parcel.write_i32(42).unwrap();
        let end = parcel.data_position();
        assert!(parcel.replace_calling_work_source_uid(2000));
        assert_eq!(parcel.data_position(), end);
        assert_eq!(parcel.read_calling_work_source_uid(), 2000);

        parcel.set_data_position(0);
        let header = parcel.enforce_interface("IFoo").unwrap();
        assert_eq!(header.work_source_uid, 2000);
        assert_eq!(parcel.read_i32().unwrap(), 42);
    }
}
