//! Typed Read/Write Primitives
//!
//! Every value is written at the cursor in native byte order and padded to
//! four bytes with zeros. Reads and writes are checked against the kernel
//! object table so plain data can never alias a special-object record.
//!
//! Each scalar read exists twice: `read_x()` returns a `Result`, and
//! `read_x_or_default()` yields the type's default (zero) on failure for
//! call sites that check [`Parcel::error_check`] or do not care.

use core::mem::size_of;
use core::ops::Range;
use std::ffi::{CStr, CString};

use crate::arena::{check_len, pad_size};
use crate::parcel::{Parcel, Variant};
use crate::{ParcelError, Result};

/// Exception code announcing a reply header that precedes the payload
pub const EX_HAS_REPLY_HEADER: i32 = -128;

/// Value that can be written element-wise inside a vector
pub trait Scalar: Sized + Copy + Default {
    fn write_to(self, parcel: &mut Parcel) -> Result<()>;
    fn read_from(parcel: &mut Parcel) -> Result<Self>;
}

macro_rules! scalar_accessors {
    ($($ty:ty => $write:ident, $read:ident, $read_or_default:ident;)*) => {
        $(
            #[doc = concat!("Append a native-endian `", stringify!($ty), "`")]
            pub fn $write(&mut self, value: $ty) -> Result<()> {
                self.write_aligned(value.to_ne_bytes())
            }

            #[doc = concat!("Read a `", stringify!($ty), "` at the cursor")]
            pub fn $read(&mut self) -> Result<$ty> {
                self.read_aligned().map(<$ty>::from_ne_bytes)
            }

            #[doc = concat!("Like [`Parcel::", stringify!($read), "`], yielding zero on failure")]
            pub fn $read_or_default(&mut self) -> $ty {
                self.$read().unwrap_or_default()
            }
        )*
    };
}

macro_rules! impl_scalar {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Scalar for $ty {
                fn write_to(self, parcel: &mut Parcel) -> Result<()> {
                    parcel.$write(self)
                }

                fn read_from(parcel: &mut Parcel) -> Result<Self> {
                    parcel.$read()
                }
            }
        )*
    };
}

impl_scalar! {
    i32 => write_i32, read_i32;
    u32 => write_u32, read_u32;
    i64 => write_i64, read_i64;
    u64 => write_u64, read_u64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
    bool => write_bool, read_bool;
    u16 => write_char, read_char;
}

impl Parcel {
    // ---------------------------------------------------------------
    // Core paths
    // ---------------------------------------------------------------

    /// Check `[position, upper_bound)` against the object table
    pub(crate) fn validate_access(&mut self, upper_bound: usize) -> Result<()> {
        let pos = self.arena.pos;
        let quiet = self.service_fuzzing;
        match &mut self.variant {
            Variant::Kernel(kernel) => kernel.validate(pos, upper_bound, quiet),
            Variant::Rpc(_) => Ok(()),
        }
    }

    pub(crate) fn finish_write(&mut self, len: usize) {
        self.arena.pos += len;
        if self.arena.pos > self.arena.size {
            self.arena.size = self.arena.pos;
        }
    }

    /// Reserve `len` bytes (plus zeroed padding) at the cursor
    ///
    /// Returns the byte range the caller fills in.
    pub(crate) fn write_inplace_range(&mut self, len: usize) -> Result<Range<usize>> {
        check_len(len, "write length")?;
        let padded = pad_size(len);
        if self.arena.pos.checked_add(padded).is_none() {
            return Err(ParcelError::ResourceExhausted { requested: padded });
        }

        loop {
            let pos = self.arena.pos;
            let end = pos + padded;
            if end <= self.arena.capacity() {
                self.validate_access(end)?;
                self.arena.bytes_mut()[pos + len..end].fill(0);
                self.finish_write(padded);
                return Ok(pos..pos + len);
            }
            self.grow_data(padded)?;
        }
    }

    /// Consume `len` bytes (plus padding) at the cursor
    ///
    /// # Errors
    /// - `NotEnoughData` if the padded range runs past the logical size.
    /// - `PermissionDenied` if it overlaps an object record. The cursor
    ///   still advances in that case.
    pub(crate) fn read_inplace_range(&mut self, len: usize) -> Result<Range<usize>> {
        check_len(len, "read length")?;
        let padded = pad_size(len);
        let pos = self.arena.pos;
        let size = self.arena.size;
        let end = match pos.checked_add(padded) {
            Some(end) if end <= size => end,
            _ => {
                return Err(ParcelError::NotEnoughData {
                    position: pos,
                    requested: len,
                    size,
                })
            }
        };

        if matches!(&self.variant, Variant::Kernel(kernel) if !kernel.objects.is_empty()) {
            if let Err(err) = self.validate_access(end) {
                self.arena.pos = end;
                return Err(err);
            }
        }
        self.arena.pos = end;
        Ok(pos..pos + len)
    }

    fn write_aligned<const N: usize>(&mut self, bytes: [u8; N]) -> Result<()> {
        let range = self.write_inplace_range(N)?;
        self.arena.bytes_mut()[range].copy_from_slice(&bytes);
        Ok(())
    }

    fn read_aligned<const N: usize>(&mut self) -> Result<[u8; N]> {
        let range = self.read_inplace_range(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.arena.bytes()[range]);
        Ok(out)
    }

    // ---------------------------------------------------------------
    // Raw bytes
    // ---------------------------------------------------------------

    /// Append `bytes` followed by zero padding
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let range = self.write_inplace_range(bytes.len())?;
        self.arena.bytes_mut()[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Reserve `len` bytes at the cursor for the caller to fill
    pub fn write_inplace(&mut self, len: usize) -> Result<&mut [u8]> {
        let range = self.write_inplace_range(len)?;
        Ok(&mut self.arena.bytes_mut()[range])
    }

    /// Fill `out` from the cursor
    pub fn read(&mut self, out: &mut [u8]) -> Result<()> {
        let range = self.read_inplace_range(out.len())?;
        out.copy_from_slice(&self.arena.bytes()[range]);
        Ok(())
    }

    /// Borrow `len` bytes at the cursor without copying
    pub fn read_inplace(&mut self, len: usize) -> Result<&[u8]> {
        let range = self.read_inplace_range(len)?;
        Ok(&self.arena.bytes()[range])
    }

    // ---------------------------------------------------------------
    // Scalars
    // ---------------------------------------------------------------

    scalar_accessors! {
        i32 => write_i32, read_i32, read_i32_or_default;
        u32 => write_u32, read_u32, read_u32_or_default;
        i64 => write_i64, read_i64, read_i64_or_default;
        u64 => write_u64, read_u64, read_u64_or_default;
        f32 => write_f32, read_f32, read_f32_or_default;
        f64 => write_f64, read_f64, read_f64_or_default;
    }

    /// Booleans travel as an int32
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_i32(value as i32)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_i32().map(|value| value != 0)
    }

    pub fn read_bool_or_default(&mut self) -> bool {
        self.read_bool().unwrap_or_default()
    }

    /// UTF-16 code unit, widened to an int32
    pub fn write_char(&mut self, value: u16) -> Result<()> {
        self.write_i32(value as i32)
    }

    pub fn read_char(&mut self) -> Result<u16> {
        self.read_i32().map(|value| value as u16)
    }

    pub fn read_char_or_default(&mut self) -> u16 {
        self.read_char().unwrap_or_default()
    }

    /// Single byte, widened to an int32
    pub fn write_byte(&mut self, value: i8) -> Result<()> {
        self.write_i32(value as i32)
    }

    pub fn read_byte(&mut self) -> Result<i8> {
        self.read_i32().map(|value| value as i8)
    }

    pub fn read_byte_or_default(&mut self) -> i8 {
        self.read_byte().unwrap_or_default()
    }

    /// Pointer-sized value; always 64 bits on the wire
    pub fn write_pointer(&mut self, value: u64) -> Result<()> {
        self.write_u64(value)
    }

    pub fn read_pointer(&mut self) -> Result<u64> {
        self.read_u64()
    }

    pub fn read_pointer_or_default(&mut self) -> u64 {
        self.read_u64_or_default()
    }

    // ---------------------------------------------------------------
    // Strings
    // ---------------------------------------------------------------

    /// Length-prefixed, NUL-terminated UTF-16 string
    pub fn write_string16(&mut self, units: &[u16]) -> Result<()> {
        self.write_nullable_string16(Some(units))
    }

    /// `None` is written as length -1
    pub fn write_nullable_string16(&mut self, units: Option<&[u16]>) -> Result<()> {
        let Some(units) = units else {
            return self.write_i32(-1);
        };
        check_len(units.len(), "string16 length")?;
        let bytes = units
            .len()
            .checked_add(1)
            .and_then(|n| n.checked_mul(2))
            .ok_or(ParcelError::ResourceExhausted { requested: units.len() })?;
        check_len(bytes, "string16 length")?;

        self.write_i32(units.len() as i32)?;
        let range = self.write_inplace_range(bytes)?;
        let data = &mut self.arena.bytes_mut()[range];
        for (slot, unit) in data.chunks_exact_mut(2).zip(units.iter().chain([&0u16])) {
            slot.copy_from_slice(&unit.to_ne_bytes());
        }
        Ok(())
    }

    /// Encode `text` as UTF-16 and write it as a string16
    pub fn write_utf8_as_utf16(&mut self, text: &str) -> Result<()> {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.write_string16(&units)
    }

    pub fn write_nullable_utf8_as_utf16(&mut self, text: Option<&str>) -> Result<()> {
        match text {
            Some(text) => self.write_utf8_as_utf16(text),
            None => self.write_i32(-1),
        }
    }

    /// Byte range of a string16's code units, excluding the terminator
    fn read_string16_range(&mut self) -> Result<Range<usize>> {
        let declared = self.read_i32()?;
        if declared == -1 {
            return Err(ParcelError::UnexpectedNull);
        }
        if declared < 0 || declared == i32::MAX {
            return Err(ParcelError::InvalidArgument {
                what: "string16 length",
            });
        }
        let units = declared as usize;
        let range = self.read_inplace_range((units + 1) * 2)?;
        let terminator = range.start + units * 2;
        if self.arena.bytes()[terminator..terminator + 2] != [0, 0] {
            if !self.service_fuzzing {
                log::error!("String16 of length {} is not NUL terminated", units);
            }
            return Err(ParcelError::ProtocolViolation {
                reason: "string16 is not NUL terminated",
            });
        }
        Ok(range.start..terminator)
    }

    pub fn read_string16(&mut self) -> Result<Vec<u16>> {
        let range = self.read_string16_range()?;
        Ok(self.arena.bytes()[range]
            .chunks_exact(2)
            .map(|unit| u16::from_ne_bytes([unit[0], unit[1]]))
            .collect())
    }

    /// `Ok(None)` for a string written as null
    pub fn read_nullable_string16(&mut self) -> Result<Option<Vec<u16>>> {
        match self.read_string16() {
            Ok(units) => Ok(Some(units)),
            Err(ParcelError::UnexpectedNull) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Read a string16 and convert it to UTF-8
    ///
    /// # Errors
    /// `InvalidArgument` if the code units are not valid UTF-16.
    pub fn read_utf8_from_utf16(&mut self) -> Result<String> {
        let units = self.read_string16()?;
        String::from_utf16(&units).map_err(|_| ParcelError::InvalidArgument {
            what: "string16 contents",
        })
    }

    pub fn read_nullable_utf8_from_utf16(&mut self) -> Result<Option<String>> {
        match self.read_utf8_from_utf16() {
            Ok(text) => Ok(Some(text)),
            Err(ParcelError::UnexpectedNull) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Empty string on any failure
    pub fn read_utf8_from_utf16_or_default(&mut self) -> String {
        self.read_utf8_from_utf16().unwrap_or_default()
    }

    /// Length-prefixed, NUL-terminated 8-bit string
    pub fn write_string8(&mut self, text: &str) -> Result<()> {
        check_len(text.len(), "string8 length")?;
        self.write_i32(text.len() as i32)?;
        let range = self.write_inplace_range(text.len() + 1)?;
        let data = &mut self.arena.bytes_mut()[range];
        data[..text.len()].copy_from_slice(text.as_bytes());
        data[text.len()] = 0;
        Ok(())
    }

    pub fn read_string8(&mut self) -> Result<String> {
        let declared = self.read_i32()?;
        if declared == -1 {
            return Err(ParcelError::UnexpectedNull);
        }
        if declared < 0 || declared == i32::MAX {
            return Err(ParcelError::InvalidArgument {
                what: "string8 length",
            });
        }
        let len = declared as usize;
        let range = self.read_inplace_range(len + 1)?;
        let bytes = &self.arena.bytes()[range];
        if bytes[len] != 0 {
            return Err(ParcelError::ProtocolViolation {
                reason: "string8 is not NUL terminated",
            });
        }
        String::from_utf8(bytes[..len].to_vec()).map_err(|_| ParcelError::InvalidArgument {
            what: "string8 contents",
        })
    }

    /// NUL-terminated string with no length prefix
    pub fn write_cstring(&mut self, text: &CStr) -> Result<()> {
        self.write(text.to_bytes_with_nul())
    }

    /// Read up to and including the next NUL byte
    pub fn read_cstring(&mut self) -> Result<CString> {
        let pos = self.arena.pos;
        let size = self.arena.size;
        let avail = &self.arena.bytes()[pos.min(size)..size];
        let Some(nul) = avail.iter().position(|&byte| byte == 0) else {
            return Err(ParcelError::NotEnoughData {
                position: pos,
                requested: avail.len() + 1,
                size,
            });
        };
        let range = self.read_inplace_range(nul + 1)?;
        CString::from_vec_with_nul(self.arena.bytes()[range].to_vec()).map_err(|_| {
            ParcelError::ProtocolViolation {
                reason: "malformed C string",
            }
        })
    }

    // ---------------------------------------------------------------
    // Arrays and vectors
    // ---------------------------------------------------------------

    /// Length-prefixed byte array; `None` is written as length -1
    pub fn write_byte_array(&mut self, bytes: Option<&[u8]>) -> Result<()> {
        let Some(bytes) = bytes else {
            return self.write_i32(-1);
        };
        check_len(bytes.len(), "byte array length")?;
        self.write_i32(bytes.len() as i32)?;
        self.write(bytes)
    }

    /// Element count of a vector, or `None` if it was written as null
    ///
    /// # Errors
    /// `ResourceExhausted` if `count * elem_size` reaches the configured
    /// vector limit.
    pub(crate) fn read_vector_size(&mut self, elem_size: usize) -> Result<Option<usize>> {
        let declared = self.read_i32()?;
        if declared < 0 {
            return Ok(None);
        }
        let count = declared as usize;
        match count.checked_mul(elem_size) {
            Some(bytes) if bytes < self.config.max_vector_bytes => Ok(Some(count)),
            _ => {
                log::error!(
                    "Vector of {} elements of {} bytes exceeds allocation limit",
                    count,
                    elem_size
                );
                Err(ParcelError::ResourceExhausted {
                    requested: count.saturating_mul(elem_size),
                })
            }
        }
    }

    pub fn read_nullable_byte_vector(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(len) = self.read_vector_size(size_of::<u8>())? else {
            return Ok(None);
        };
        Ok(Some(self.read_inplace(len)?.to_vec()))
    }

    pub fn read_byte_vector(&mut self) -> Result<Vec<u8>> {
        self.read_nullable_byte_vector()?
            .ok_or(ParcelError::UnexpectedNull)
    }

    /// Count followed by each element
    pub fn write_vector<T: Scalar>(&mut self, values: &[T]) -> Result<()> {
        self.write_nullable_vector(Some(values))
    }

    pub fn write_nullable_vector<T: Scalar>(&mut self, values: Option<&[T]>) -> Result<()> {
        let Some(values) = values else {
            return self.write_i32(-1);
        };
        check_len(values.len(), "vector length")?;
        self.write_i32(values.len() as i32)?;
        for value in values {
            value.write_to(self)?;
        }
        Ok(())
    }

    pub fn read_nullable_vector<T: Scalar>(&mut self) -> Result<Option<Vec<T>>> {
        let Some(count) = self.read_vector_size(size_of::<T>())? else {
            return Ok(None);
        };
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(T::read_from(self)?);
        }
        Ok(Some(values))
    }

    pub fn read_vector<T: Scalar>(&mut self) -> Result<Vec<T>> {
        self.read_nullable_vector()?.ok_or(ParcelError::UnexpectedNull)
    }

    /// Vector of strings, each written as UTF-16
    pub fn write_utf8_vector_as_utf16<S: AsRef<str>>(&mut self, values: &[S]) -> Result<()> {
        check_len(values.len(), "vector length")?;
        self.write_i32(values.len() as i32)?;
        for value in values {
            self.write_utf8_as_utf16(value.as_ref())?;
        }
        Ok(())
    }

    pub fn read_utf8_vector_from_utf16(&mut self) -> Result<Vec<String>> {
        let count = self
            .read_vector_size(size_of::<String>())?
            .ok_or(ParcelError::UnexpectedNull)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_utf8_from_utf16()?);
        }
        Ok(values)
    }

    // ---------------------------------------------------------------
    // Exception header
    // ---------------------------------------------------------------

    /// Successful reply marker
    pub fn write_no_exception(&mut self) -> Result<()> {
        self.write_i32(0)
    }

    /// Exception code at the head of a reply
    ///
    /// A reply header is skipped and reported as no exception.
    pub fn read_exception_code(&mut self) -> Result<i32> {
        let code = self.read_i32()?;
        if code != EX_HAS_REPLY_HEADER {
            return Ok(code);
        }
        // The header size includes its own 4-byte length field
        let header_start = self.arena.pos;
        let avail = self.data_avail();
        let header_size = self.read_i32()?;
        match usize::try_from(header_size) {
            Ok(size) if size <= avail => {
                self.set_data_position(header_start + size);
                Ok(0)
            }
            _ => Err(ParcelError::InvalidArgument {
                what: "reply header size",
            }),
        }
    }
}
