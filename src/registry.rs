//! The process-wide allocator registry.
//!
//! Segments store only pointers and a length, so returning one without an
//! allocator reference in hand needs a way back to its owner. The registry
//! maps each live allocator's buffer base address to a weak handle; once
//! the allocator drops, the handle stops upgrading and lookups report "not
//! found" instead of a dangling reference.
//!
//! This is the only process-wide shared state in the crate. It must
//! tolerate concurrent construction and disposal of distinct allocators,
//! which the `spin::RwLock` around the table provides; each individual
//! allocator remains externally serialized.

use crate::error::{ConfigError, ReturnError};

use alloc::sync::{Arc, Weak};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use spin::{Lazy, RwLock};

/// The type-erased door back into an allocator, implemented by the shared
/// state of every allocator kind.
pub(crate) trait SegmentHome: Send + Sync {
    /// Size of one buffer element in bytes.
    fn element_size(&self) -> usize;

    /// Return the segment occupying `offset..offset + length` (in units)
    /// to the allocator.
    fn restore_units(&self, offset: usize, length: usize) -> Result<(), ReturnError>;
}

struct Registration {
    home: Weak<dyn SegmentHome>,
    /// Address of the owning shared state, used as an identity token so a
    /// lagging deregistration cannot evict a newer tenant of the same
    /// buffer address.
    ident: usize,
}

static REGISTRY: Lazy<RwLock<HashMap<usize, Registration>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register an allocator at its buffer base address.
///
/// Fails if another *live* allocator already claims the address; an entry
/// whose allocator has since dropped is replaced silently.
pub(crate) fn register(
    base: usize,
    home: Weak<dyn SegmentHome>,
    ident: usize,
) -> Result<(), ConfigError> {
    let mut table = REGISTRY.write();
    match table.entry(base) {
        Entry::Occupied(mut occupied) => {
            if occupied.get().home.strong_count() > 0 {
                return Err(ConfigError::BaseAddressInUse);
            }
            occupied.insert(Registration { home, ident });
            Ok(())
        }
        Entry::Vacant(vacant) => {
            vacant.insert(Registration { home, ident });
            Ok(())
        }
    }
}

/// Remove the entry at `base` if it still belongs to `ident`. Idempotent.
pub(crate) fn deregister(base: usize, ident: usize) {
    let mut table = REGISTRY.write();
    if let Some(current) = table.get(&base) {
        if current.ident == ident {
            table.remove(&base);
        }
    }
}

/// Resolve the allocator owning the buffer at `base`, if it is still live.
pub(crate) fn resolve(base: usize) -> Option<Arc<dyn SegmentHome>> {
    REGISTRY.read().get(&base)?.home.upgrade()
}

/// Whether a live allocator is registered at `base`.
pub fn is_registered(base: usize) -> bool {
    resolve(base).is_some()
}
