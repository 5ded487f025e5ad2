//! RPC-Variant Object Table
//!
//! Socket transports carry no kernel metadata, so only the positions of
//! descriptor records are tracked, and the descriptors themselves travel
//! in a side list that the session ships as ancillary data. A record in
//! the buffer holds the type tag followed by the index into that list.

use alloc::sync::Arc;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::object::{RPC_TYPE_BINDER, RPC_TYPE_NATIVE_FILE_DESCRIPTOR};
use crate::session::RpcSession;
use crate::{ParcelError, Result};

/// Descriptor held in an RPC parcel's side list
#[derive(Debug)]
pub enum ParcelFd {
    /// Closed when the parcel drops it
    Owned(OwnedFd),
    /// Kept open by the caller for as long as the parcel is in use
    Borrowed(RawFd),
}

impl ParcelFd {
    pub fn raw(&self) -> RawFd {
        match self {
            ParcelFd::Owned(fd) => fd.as_raw_fd(),
            ParcelFd::Borrowed(fd) => *fd,
        }
    }
}

pub(crate) struct RpcState {
    pub(crate) session: Arc<dyn RpcSession>,
    /// Strictly increasing positions of descriptor records
    pub(crate) positions: Vec<u32>,
    pub(crate) fds: Vec<ParcelFd>,
}

const TAG_SIZE: usize = 4;

impl RpcState {
    pub(crate) fn new(session: Arc<dyn RpcSession>) -> Self {
        Self {
            session,
            positions: Vec::new(),
            fds: Vec::new(),
        }
    }

    /// Number of leading entries whose record ends at or before `desired`
    pub(crate) fn count_within(&self, data: &[u8], size: usize, desired: usize) -> Result<usize> {
        let mut kept = self.positions.len();
        while kept > 0 {
            let pos = self.positions[kept - 1] as usize;
            let tag = read_tag(data, size, pos)?;
            let record = match tag {
                RPC_TYPE_BINDER => TAG_SIZE + 8,
                RPC_TYPE_NATIVE_FILE_DESCRIPTOR => TAG_SIZE + 4,
                _ => TAG_SIZE,
            };
            if pos + record <= desired {
                break;
            }
            kept -= 1;
        }
        Ok(kept)
    }

    /// Drop entries past `keep`, removing the descriptors they index
    pub(crate) fn truncate(&mut self, data: &[u8], size: usize, keep: usize) -> Result<()> {
        if keep == 0 {
            self.positions.clear();
            self.fds.clear();
            return Ok(());
        }
        while self.positions.len() > keep {
            let Some(&last) = self.positions.last() else {
                break;
            };
            let pos = last as usize;
            if read_tag(data, size, pos)? == RPC_TYPE_NATIVE_FILE_DESCRIPTOR {
                let index = self.fd_index_at(data, size, pos)?;
                // In practice this is always the last element
                self.fds.remove(index);
            }
            self.positions.pop();
        }
        Ok(())
    }

    /// Index stored after the tag of the descriptor record at `pos`
    pub(crate) fn fd_index_at(&self, data: &[u8], size: usize, pos: usize) -> Result<usize> {
        let start = pos + TAG_SIZE;
        if start + 4 > size {
            return Err(ParcelError::InvalidArgument { what: "fd record" });
        }
        let raw = i32::from_ne_bytes([data[start], data[start + 1], data[start + 2], data[start + 3]]);
        match usize::try_from(raw) {
            Ok(index) if index < self.fds.len() => Ok(index),
            _ => {
                log::error!(
                    "RPC parcel contains invalid fd index {} (fd count {})",
                    raw,
                    self.fds.len()
                );
                Err(ParcelError::InvalidArgument { what: "fd index" })
            }
        }
    }
}

fn read_tag(data: &[u8], size: usize, pos: usize) -> Result<i32> {
    if pos + TAG_SIZE > size {
        return Err(ParcelError::InvalidArgument { what: "object position" });
    }
    Ok(i32::from_ne_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]))
}
