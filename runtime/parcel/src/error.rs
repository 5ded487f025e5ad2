//! Parcel error taxonomy and the binder status codes it maps onto

use thiserror::Error;

/// Error types for parcel operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParcelError {
    /// A length or count that cannot be valid (usually a negative value
    /// reinterpreted as unsigned) or a malformed blob/fd count
    #[error("Invalid argument: {what}")]
    InvalidArgument { what: &'static str },

    /// Allocation failure or checked-arithmetic overflow while sizing
    #[error("Resource exhausted (requested: {requested} bytes)")]
    ResourceExhausted { requested: usize },

    /// An ordinary access would touch a special-object record, or file
    /// descriptors were written into a parcel that disallows them
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: &'static str },

    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: &'static str },

    #[error("Unexpected null value")]
    UnexpectedNull,

    #[error("Not enough data (position: {position}, requested: {requested}, size: {size})")]
    NotEnoughData {
        position: usize,
        requested: usize,
        size: usize,
    },

    #[error("Parcel not fully consumed ({unread} bytes unread)")]
    NotFullyConsumed { unread: usize },

    #[error("OS error during {op} (errno: {errno})")]
    Os { op: &'static str, errno: i32 },
}

pub type Result<T> = core::result::Result<T, ParcelError>;

/// Reason string used when fds are written into a parcel that disallows them
pub(crate) const FDS_NOT_ALLOWED: &str = "file descriptors not allowed";

// Binder status codes (utils/Errors.h)
const UNKNOWN_ERROR: i32 = i32::MIN;
pub const STATUS_OK: i32 = 0;
pub const STATUS_NO_MEMORY: i32 = -libc::ENOMEM;
pub const STATUS_BAD_VALUE: i32 = -libc::EINVAL;
pub const STATUS_BAD_TYPE: i32 = UNKNOWN_ERROR + 1;
pub const STATUS_PERMISSION_DENIED: i32 = -libc::EPERM;
pub const STATUS_NOT_ENOUGH_DATA: i32 = -libc::ENODATA;
pub const STATUS_FDS_NOT_ALLOWED: i32 = UNKNOWN_ERROR + 7;
pub const STATUS_UNEXPECTED_NULL: i32 = UNKNOWN_ERROR + 8;

impl ParcelError {
    /// Status integer this error travels as when a transport reports it
    pub fn status_code(&self) -> i32 {
        match self {
            ParcelError::InvalidArgument { .. } => STATUS_BAD_VALUE,
            ParcelError::ResourceExhausted { .. } => STATUS_NO_MEMORY,
            ParcelError::PermissionDenied { reason } if *reason == FDS_NOT_ALLOWED => {
                STATUS_FDS_NOT_ALLOWED
            }
            ParcelError::PermissionDenied { .. } => STATUS_PERMISSION_DENIED,
            ParcelError::ProtocolViolation { .. } => STATUS_BAD_TYPE,
            ParcelError::UnexpectedNull => STATUS_UNEXPECTED_NULL,
            ParcelError::NotEnoughData { .. } => STATUS_NOT_ENOUGH_DATA,
            ParcelError::NotFullyConsumed { .. } => STATUS_BAD_VALUE,
            ParcelError::Os { errno, .. } => -errno,
        }
    }

    /// Capture `errno` after a failed libc call
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        ParcelError::Os { op, errno }
    }

    pub(crate) fn fds_not_allowed() -> Self {
        ParcelError::PermissionDenied {
            reason: FDS_NOT_ALLOWED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ParcelError::InvalidArgument { what: "len" }.status_code(),
            -22
        );
        assert_eq!(ParcelError::fds_not_allowed().status_code(), i32::MIN + 7);
        assert_eq!(
            ParcelError::PermissionDenied { reason: "overlap" }.status_code(),
            -1
        );
        assert_eq!(ParcelError::UnexpectedNull.status_code(), i32::MIN + 8);
    }

    #[test]
    fn test_display() {
        let err = ParcelError::NotEnoughData {
            position: 8,
            requested: 4,
            size: 10,
        };
        assert_eq!(
            err.to_string(),
            "Not enough data (position: 8, requested: 4, size: 10)"
        );
    }
}
