//! RPC Session - Hooks a socket transport provides to the parcel
//!
//! An RPC parcel is bound to exactly one session for its lifetime. The
//! session translates references into 64-bit addresses meaningful to the
//! peer and decides whether descriptors may travel at all.

use alloc::sync::Arc;

use crate::object::Binder;
use crate::Result;

/// Descriptor transport negotiated for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdTransportMode {
    /// Descriptors cannot be sent
    None,
    /// SCM_RIGHTS over a unix domain socket
    Unix,
    /// Trusty IPC handles
    Trusty,
}

impl FdTransportMode {
    pub fn is_supported(self) -> bool {
        self != FdTransportMode::None
    }
}

pub trait RpcSession: Send + Sync {
    fn fd_transport_mode(&self) -> FdTransportMode;

    /// Address under which `binder` is known to the peer
    fn on_binder_leaving(&self, binder: &Binder) -> Result<u64>;

    /// Reference for an address received from the peer
    fn on_binder_entering(&self, address: u64) -> Result<Binder>;

    /// Drop surplus references the peer sent along with `address`
    fn flush_excess_binder_refs(&self, address: u64, binder: &Binder) -> Result<()>;
}

/// Whether two handles name the same session
pub(crate) fn same_session(a: &Arc<dyn RpcSession>, b: &Arc<dyn RpcSession>) -> bool {
    core::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
