//! Virtual and interface method resolution with per-class caches.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicPtr, AtomicU64, Ordering},
};

use object::{Class, ExceptionKind, MethodId};

use crate::Domain;
use crate::exception::Raise;
use crate::method::{InterpMethod, MethodKind};

struct AssocEntry {
    key: MethodId,
    value: Arc<InterpMethod>,
    next: *mut AssocEntry,
}

/// Cache for one vtable slot.
///
/// Plain class slots have a single resolution and use `single`. Interface
/// and generic-method slots can resolve differently depending on the
/// method being called, so they keep an association list keyed by it.
/// Both only grow, are written under the domain's dispatch lock and read
/// without it.
#[derive(Default)]
struct SlotCache {
    single: OnceLock<Arc<InterpMethod>>,
    list: AtomicPtr<AssocEntry>,
}

impl SlotCache {
    fn lookup(&self, key: MethodId) -> Option<&Arc<InterpMethod>> {
        let mut entry = self.list.load(Ordering::Acquire);
        while !entry.is_null() {
            // SAFETY: entries are published with Release after they are
            // fully written and are only freed with the table.
            let current = unsafe { &*entry };
            if current.key == key {
                return Some(&current.value);
            }
            entry = current.next;
        }
        None
    }

    /// Caller holds the dispatch lock.
    fn insert(&self, key: MethodId, value: Arc<InterpMethod>) -> Arc<InterpMethod> {
        if let Some(existing) = self.lookup(key) {
            return existing.clone();
        }
        let entry = Box::into_raw(Box::new(AssocEntry {
            key,
            value: value.clone(),
            next: self.list.load(Ordering::Acquire),
        }));
        self.list.store(entry, Ordering::Release);
        value
    }
}

impl Drop for SlotCache {
    fn drop(&mut self) {
        let mut entry = *self.list.get_mut();
        while !entry.is_null() {
            // SAFETY: every entry came from Box::into_raw and is owned by
            // this list alone.
            let boxed = unsafe { Box::from_raw(entry) };
            entry = boxed.next;
        }
    }
}

/// The interpreter's per-class dispatch cache, one slot cache per vtable
/// entry. Installed into [`Class::interp_vtable`].
pub(crate) struct DispatchTable {
    slots: Box<[SlotCache]>,
}

impl DispatchTable {
    fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots).map(|_| SlotCache::default()).collect(),
        }
    }

    fn of(class: &Class) -> Option<&DispatchTable> {
        class
            .interp_vtable
            .get_or_init(|| Box::new(DispatchTable::new(class.vtable.len())))
            .downcast_ref::<DispatchTable>()
    }
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Slow-path resolutions.
    pub resolutions: AtomicU64,
    pub cache_hits: AtomicU64,
}

impl DispatchStats {
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }
}

/// The implementation of `target` for a receiver of class `receiver`.
pub(crate) fn resolve_virtual(
    domain: &Domain,
    target: &Arc<InterpMethod>,
    receiver: &Class,
) -> Result<Arc<InterpMethod>, Raise> {
    let method = &target.method;
    if !method.is_virtual() || method.is_final() {
        return Ok(target.clone());
    }
    let Some(index) = method.slot else {
        log::warn!("virtual method {} has no slot", target.full_name());
        return Err(Raise::Kind(ExceptionKind::ExecutionEngine));
    };
    let keyed = target.class.is_interface() || method.method_inst.is_some();
    let slot = if target.class.is_interface() {
        match domain.metadata().interface_offset(receiver, &target.class) {
            Some(offset) => offset + index as usize,
            None => return Err(Raise::Kind(ExceptionKind::InvalidCast)),
        }
    } else {
        index as usize
    };

    let table = DispatchTable::of(receiver);
    let cache = table.and_then(|table| table.slots.get(slot));
    if let Some(cache) = cache {
        let hit = if keyed {
            cache.lookup(method.id)
        } else {
            cache.single.get()
        };
        if let Some(hit) = hit {
            domain.stats().dispatch.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.clone());
        }
    }

    domain.stats().dispatch.resolutions.fetch_add(1, Ordering::Relaxed);
    let resolved = resolve_slot(domain, target, receiver, slot)?;

    let Some(cache) = cache else {
        return Ok(resolved);
    };
    let _guard = domain.dispatch_lock.lock();
    if keyed {
        Ok(cache.insert(method.id, resolved))
    } else {
        Ok(cache.single.get_or_init(|| resolved).clone())
    }
}

fn resolve_slot(
    domain: &Domain,
    target: &InterpMethod,
    receiver: &Class,
    slot: usize,
) -> Result<Arc<InterpMethod>, Raise> {
    let Some(&declared) = receiver.vtable.get(slot) else {
        log::warn!("slot {slot} is out of range for {}", receiver.name);
        return Err(Raise::Kind(ExceptionKind::ExecutionEngine));
    };
    let mut implementation = declared;
    if let Some(inst) = &target.method.method_inst {
        implementation = domain
            .metadata()
            .inflate_method(implementation, inst)
            .map_err(|_| Raise::Kind(ExceptionKind::ExecutionEngine))?;
    }
    let resolved = domain
        .interp_method(implementation)
        .map_err(|_| Raise::Kind(ExceptionKind::ExecutionEngine))?;
    log::debug!(
        "dispatch {} on {} -> {}",
        target.full_name(),
        receiver.name,
        resolved.full_name()
    );
    if resolved.kind == MethodKind::Abstract {
        return Err(Raise::Kind(ExceptionKind::ExecutionEngine));
    }
    Ok(resolved)
}
