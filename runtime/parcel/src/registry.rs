//! Object Registry - Acquire/release glue for embedded references
//!
//! The registry owns the strong counts of local and remote endpoints. A
//! parcel never counts references itself; it only tells the registry when
//! a record enters or leaves its object table, tagged with the parcel's
//! [`OwnerToken`] so the registry can attribute the reference.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;

use spin::{Mutex, Once};

use crate::object::{Binder, FlatObject, ObjectKind};
use crate::os;

/// Identity of the parcel that holds a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerToken(pub u64);

/// Attributes a registry reports for a local object
///
/// Folded into the flags word of the kernel record that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalAttributes {
    pub requesting_sid: bool,
    pub inherit_rt: bool,
    /// Minimum (policy, priority) overriding the parcel's default hint
    pub min_sched: Option<(u32, u32)>,
}

/// Strong-reference bookkeeping for endpoints, implemented by the
/// surrounding IPC runtime
pub trait ObjectRegistry: Send + Sync {
    /// Take a strong reference on behalf of `owner`
    fn acquire(&self, binder: &Binder, owner: OwnerToken);

    /// Drop a strong reference previously taken for `owner`
    fn release(&self, binder: &Binder, owner: OwnerToken);

    /// Proxy for a kernel handle, or `None` if the handle is dead
    fn resolve_remote(&self, handle: u32) -> Option<Binder>;

    fn local_attributes(&self, _id: u64) -> LocalAttributes {
        LocalAttributes::default()
    }
}

/// Counting registry for single-process use and tests
///
/// Remote handles resolve only after [`LocalRegistry::register_remote`].
#[derive(Default)]
pub struct LocalRegistry {
    strong: Mutex<BTreeMap<Binder, usize>>,
    remotes: Mutex<BTreeSet<u32>>,
    attributes: Mutex<BTreeMap<u64, LocalAttributes>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handle` resolvable
    pub fn register_remote(&self, handle: u32) {
        self.remotes.lock().insert(handle);
    }

    pub fn set_local_attributes(&self, id: u64, attributes: LocalAttributes) {
        self.attributes.lock().insert(id, attributes);
    }

    /// Strong references currently held through this registry
    pub fn strong_count(&self, binder: &Binder) -> usize {
        self.strong.lock().get(binder).copied().unwrap_or(0)
    }
}

impl ObjectRegistry for LocalRegistry {
    fn acquire(&self, binder: &Binder, _owner: OwnerToken) {
        *self.strong.lock().entry(*binder).or_insert(0) += 1;
    }

    fn release(&self, binder: &Binder, owner: OwnerToken) {
        let mut strong = self.strong.lock();
        match strong.get_mut(binder) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                strong.remove(binder);
            }
            None => log::warn!("{:?} released {:?} with no strong references", owner, binder),
        }
    }

    fn resolve_remote(&self, handle: u32) -> Option<Binder> {
        self.remotes
            .lock()
            .contains(&handle)
            .then_some(Binder::Remote(handle))
    }

    fn local_attributes(&self, id: u64) -> LocalAttributes {
        self.attributes.lock().get(&id).copied().unwrap_or_default()
    }
}

static PROCESS_REGISTRY: Once<Arc<dyn ObjectRegistry>> = Once::new();

/// Install the registry used by parcels built without an explicit one
///
/// Returns false if a registry was already installed (or defaulted).
pub fn install_process_registry(registry: Arc<dyn ObjectRegistry>) -> bool {
    let mut installed = false;
    PROCESS_REGISTRY.call_once(|| {
        installed = true;
        registry
    });
    installed
}

/// Process-wide registry, defaulting to a [`LocalRegistry`]
pub fn process_registry() -> Arc<dyn ObjectRegistry> {
    PROCESS_REGISTRY
        .call_once(|| Arc::new(LocalRegistry::new()))
        .clone()
}

/// Take whatever reference a kernel record represents
///
/// Descriptors carry no reference count; they are only logged.
pub(crate) fn acquire_object(registry: &dyn ObjectRegistry, obj: &FlatObject, owner: OwnerToken) {
    match obj.kind {
        ObjectKind::Binder => {
            if obj.binder != 0 {
                log::trace!("{:?} acquiring local {:#x}", owner, obj.cookie);
                registry.acquire(&Binder::Local(obj.cookie), owner);
            }
        }
        ObjectKind::Handle => {
            if let Some(proxy) = registry.resolve_remote(obj.handle()) {
                log::trace!("{:?} acquiring handle {}", owner, obj.handle());
                registry.acquire(&proxy, owner);
            }
        }
        ObjectKind::Fd => {
            log::trace!("{:?} tracking fd {}", owner, obj.fd_number());
        }
        other => log::error!("Invalid object type {:?} in acquire", other),
    }
}

/// Undo [`acquire_object`], closing descriptors the parcel owns
pub(crate) fn release_object(registry: &dyn ObjectRegistry, obj: &FlatObject, owner: OwnerToken) {
    match obj.kind {
        ObjectKind::Binder => {
            if obj.binder != 0 {
                log::trace!("{:?} releasing local {:#x}", owner, obj.cookie);
                registry.release(&Binder::Local(obj.cookie), owner);
            }
        }
        ObjectKind::Handle => {
            if let Some(proxy) = registry.resolve_remote(obj.handle()) {
                log::trace!("{:?} releasing handle {}", owner, obj.handle());
                registry.release(&proxy, owner);
            }
        }
        ObjectKind::Fd => {
            if obj.owns_fd() {
                os::close_fd(obj.fd_number());
            }
        }
        other => log::error!("Invalid object type {:?} in release", other),
    }
}
