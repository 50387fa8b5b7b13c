//! Garbage-collector collaborator
//!
//! The runtime tells the collector about compiled units that embed movable
//! object references, and routes allocation barriers through it.
//! `CodeRootSet` is an in-process implementation that records what it is
//! told; embedders with a real collector implement `GcHooks` themselves.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::code::{CompiledUnit, ObjectRef};
use crate::ids::{KlassId, UnitId};

/// Where a store barrier is requested from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationSite {
    /// Klass of the object being initialized
    pub klass: KlassId,
    /// The object was just allocated and not yet published
    pub freshly_allocated: bool,
}

/// Hooks the runtime calls into the collector
pub trait GcHooks: Send + Sync {
    /// A unit with movable embedded references was published
    fn register_roots_in(&self, _unit: &CompiledUnit) {}

    /// A unit was unloaded
    fn unregister_roots_in(&self, _unit: UnitId) {}

    /// Whether stores into an object from `site` need no barrier
    fn can_elide_barrier_for(&self, _site: &AllocationSite) -> bool {
        false
    }

    /// Barrier before overwriting a reference field of `object`
    fn pre_barrier(&self, _object: ObjectRef, _previous: Option<ObjectRef>) {}

    /// Barrier after storing `value` into `object`
    fn post_barrier(&self, _object: ObjectRef, _value: ObjectRef) {}
}

/// Collector that needs nothing from the runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGc;

impl GcHooks for NoGc {}

/// Root set of compiled code
///
/// Tracks the movable references embedded in each registered unit and counts
/// barrier invocations. Barriers for freshly allocated objects are elided.
#[derive(Debug, Default)]
pub struct CodeRootSet {
    roots: Mutex<FxHashMap<UnitId, Vec<ObjectRef>>>,
    pre_barriers: AtomicU64,
    post_barriers: AtomicU64,
}

impl CodeRootSet {
    /// Create an empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `unit` is registered
    pub fn contains(&self, unit: UnitId) -> bool {
        self.roots.lock().contains_key(&unit)
    }

    /// All registered references
    pub fn iter_roots(&self) -> Vec<ObjectRef> {
        self.roots.lock().values().flatten().copied().collect()
    }

    /// Number of registered units
    pub fn len(&self) -> usize {
        self.roots.lock().len()
    }

    /// Whether no units are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pre-barriers executed so far
    pub fn pre_barrier_count(&self) -> u64 {
        self.pre_barriers.load(Ordering::Relaxed)
    }

    /// Post-barriers executed so far
    pub fn post_barrier_count(&self) -> u64 {
        self.post_barriers.load(Ordering::Relaxed)
    }
}

impl GcHooks for CodeRootSet {
    fn register_roots_in(&self, unit: &CompiledUnit) {
        let movable: Vec<ObjectRef> = unit.embedded_oops().iter().copied().filter(|o| o.movable).collect();
        if !movable.is_empty() {
            self.roots.lock().insert(unit.id(), movable);
        }
    }

    fn unregister_roots_in(&self, unit: UnitId) {
        self.roots.lock().remove(&unit);
    }

    fn can_elide_barrier_for(&self, site: &AllocationSite) -> bool {
        site.freshly_allocated
    }

    fn pre_barrier(&self, _object: ObjectRef, _previous: Option<ObjectRef>) {
        self.pre_barriers.fetch_add(1, Ordering::Relaxed);
    }

    fn post_barrier(&self, _object: ObjectRef, _value: ObjectRef) {
        self.post_barriers.fetch_add(1, Ordering::Relaxed);
    }
}
