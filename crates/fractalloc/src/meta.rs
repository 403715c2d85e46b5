//! Type-descriptor collaborator contract.
//!
//! The reflection registry that owns type descriptors lives outside this
//! crate; the allocator only needs the routing fields below plus one
//! mutable chain-head slot it reads and writes under the `Type` tactic.
//! Descriptors are expected to be `static`s, so identity is by address —
//! two descriptors with equal fields are still two descriptors.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::pool::Pool;

/// Per-type routing choice for allocations carrying a hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PoolTactic {
    /// Route into the untyped main chain.
    #[default]
    Main,
    /// Route into the chain bucketed by `log2(size)`.
    Size,
    /// Route into a chain dedicated to this descriptor.
    Type,
}

/// Type metadata handed to the allocator as an allocation hint.
pub struct TypeMeta {
    /// Human-readable type name, used only by dumps and audits.
    pub name: &'static str,
    /// Owning library token, used by boundary checks.
    pub library: &'static str,
    /// Instance size in bytes; drives the `Size` tactic bucket.
    pub size: usize,
    /// Preferred minimum pool-entry size; zero means the pool default.
    pub allocation_page: usize,
    /// Routing tactic for allocations of this type.
    pub tactic: PoolTactic,
    /// Head of this type's pool chain. Written only by the allocator,
    /// under its own serialization; relaxed ordering is sufficient.
    chain: AtomicPtr<Pool>,
}

impl TypeMeta {
    /// A descriptor with no pools yet. `const` so registries can hold
    /// descriptors in `static`s.
    pub const fn new(
        name: &'static str,
        library: &'static str,
        size: usize,
        allocation_page: usize,
        tactic: PoolTactic,
    ) -> Self {
        Self {
            name,
            library,
            size,
            allocation_page,
            tactic,
            chain: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn chain_head(&self) -> *mut Pool {
        self.chain.load(Ordering::Relaxed)
    }

    pub(crate) fn set_chain_head(&self, head: *mut Pool) {
        self.chain.store(head, Ordering::Relaxed);
    }
}

impl fmt::Debug for TypeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMeta")
            .field("name", &self.name)
            .field("library", &self.library)
            .field("size", &self.size)
            .field("allocation_page", &self.allocation_page)
            .field("tactic", &self.tactic)
            .finish_non_exhaustive()
    }
}

/// Address-identity wrapper so descriptor sets compare by pointer.
#[derive(Clone, Copy)]
pub(crate) struct MetaPtr(pub &'static TypeMeta);

impl PartialEq for MetaPtr {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl Eq for MetaPtr {}

impl Hash for MetaPtr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0 as *const TypeMeta as usize).hash(state);
    }
}
