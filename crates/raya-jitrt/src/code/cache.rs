//! Code repository for compiled units
//!
//! Owns every published `CompiledUnit` in a generational arena, hands out
//! stable code-heap addresses, and holds each method's dispatch state: one
//! standard entry plus any number of OSR entries keyed by bci.
//!
//! Mutation of dispatch state happens under the compile lock (see
//! `installer`); the internal `RwLock` only keeps concurrent readers
//! consistent.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::code::unit::{align_up, CompiledUnit, UnitCandidate, UnitState, STUB_SIZE};
use crate::ids::{CodeAddress, MethodId, UnitId};

/// First address of the simulated code heap
pub const CODE_HEAP_BASE: usize = 0x1000_0000;

/// Dispatch state of one method
#[derive(Debug, Default, Clone)]
struct MethodDispatch {
    code: Option<UnitId>,
    osr: Vec<(u32, UnitId)>,
    version: u64,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    unit: Option<Arc<CompiledUnit>>,
}

#[derive(Debug)]
struct RepositoryInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_address: BTreeMap<usize, UnitId>,
    dispatch: FxHashMap<MethodId, MethodDispatch>,
    next_address: usize,
}

impl RepositoryInner {
    fn unit(&self, id: UnitId) -> Option<&Arc<CompiledUnit>> {
        self.slots
            .get(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.unit.as_ref())
    }
}

/// What a sweep pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Not-entrant units with no activations, now zombies
    pub zombied: Vec<(UnitId, MethodId)>,
    /// Zombie units removed from the heap
    pub unloaded: Vec<(UnitId, MethodId)>,
    /// Bytes returned to the heap
    pub reclaimed_bytes: usize,
}

impl SweepReport {
    /// Whether the pass changed anything
    pub fn made_progress(&self) -> bool {
        !self.zombied.is_empty() || !self.unloaded.is_empty()
    }
}

/// Thread-safe repository of compiled units
pub struct CodeRepository {
    inner: RwLock<RepositoryInner>,
    /// Bytes currently occupied by units
    used_bytes: AtomicUsize,
    /// Maximum bytes units may occupy
    capacity: usize,
    alignment: usize,
    exception_cache_capacity: usize,
    deopt_blob: CodeAddress,
}

impl CodeRepository {
    /// Create a repository with a capacity limit (in bytes)
    pub fn new(capacity: usize, alignment: usize, exception_cache_capacity: usize) -> Self {
        let deopt_blob = CodeAddress::new(CODE_HEAP_BASE);
        CodeRepository {
            inner: RwLock::new(RepositoryInner {
                slots: Vec::new(),
                free: Vec::new(),
                by_address: BTreeMap::new(),
                dispatch: FxHashMap::default(),
                next_address: CODE_HEAP_BASE + align_up(STUB_SIZE, alignment),
            }),
            used_bytes: AtomicUsize::new(0),
            capacity,
            alignment,
            exception_cache_capacity,
            deopt_blob,
        }
    }

    /// Generic re-entry point for frames redirected to deoptimization
    pub fn deopt_blob(&self) -> CodeAddress {
        self.deopt_blob
    }

    /// Copy a candidate into the heap. Returns None when the heap is full.
    ///
    /// The unit is not reachable from any dispatch slot until published.
    pub fn materialize(&self, candidate: UnitCandidate, dependencies: Vec<u8>) -> Option<Arc<CompiledUnit>> {
        let size = candidate.heap_size(self.alignment);
        let reserved = self
            .used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + size <= self.capacity).then_some(used + size)
            });
        if reserved.is_err() {
            tracing::debug!(
                target: "raya_jitrt::code",
                size,
                used = self.used_bytes(),
                capacity = self.capacity,
                "code heap exhausted"
            );
            return None;
        }

        let mut inner = self.inner.write();
        let start = inner.next_address;
        inner.next_address = start + size;

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot::default());
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        let id = UnitId::new(index, slot.generation);
        let unit = Arc::new(CompiledUnit::materialize(
            id,
            CodeAddress::new(start),
            candidate,
            dependencies,
            self.alignment,
            self.exception_cache_capacity,
        ));
        slot.unit = Some(Arc::clone(&unit));
        inner.by_address.insert(start, id);
        Some(unit)
    }

    /// Make `unit` the method's standard entry; returns the unit it replaced
    pub fn publish_standard(&self, unit: &Arc<CompiledUnit>) -> Option<Arc<CompiledUnit>> {
        let mut inner = self.inner.write();
        let dispatch = inner.dispatch.entry(unit.method()).or_default();
        let previous = dispatch.code.replace(unit.id());
        dispatch.version += 1;
        previous.and_then(|id| inner.unit(id).cloned())
    }

    /// Register `unit` as the method's OSR entry at `bci`; returns the unit
    /// previously registered at the same bci
    pub fn publish_osr(&self, unit: &Arc<CompiledUnit>, bci: u32) -> Option<Arc<CompiledUnit>> {
        let mut inner = self.inner.write();
        let dispatch = inner.dispatch.entry(unit.method()).or_default();
        let previous = match dispatch.osr.iter_mut().find(|(b, _)| *b == bci) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, unit.id())),
            None => {
                dispatch.osr.push((bci, unit.id()));
                None
            }
        };
        previous.and_then(|id| inner.unit(id).cloned())
    }

    /// Retire a unit from new invocations and unlink it from dispatch.
    ///
    /// Returns false if the unit was already not entrant (or dead).
    pub fn make_not_entrant(&self, unit: &CompiledUnit) -> bool {
        if !unit.advance_state(UnitState::NotEntrant) {
            return false;
        }
        let mut inner = self.inner.write();
        if let Some(dispatch) = inner.dispatch.get_mut(&unit.method()) {
            if dispatch.code == Some(unit.id()) {
                dispatch.code = None;
            }
            dispatch.osr.retain(|(_, id)| *id != unit.id());
        }
        tracing::debug!(target: "raya_jitrt::code", unit = %unit.id(), method = %unit.method(), "made not entrant");
        true
    }

    /// Look up a unit by id
    pub fn get(&self, id: UnitId) -> Option<Arc<CompiledUnit>> {
        self.inner.read().unit(id).cloned()
    }

    /// Unit whose code range contains `pc`
    pub fn find_by_pc(&self, pc: CodeAddress) -> Option<Arc<CompiledUnit>> {
        let inner = self.inner.read();
        let (_, id) = inner.by_address.range(..=pc.as_usize()).next_back()?;
        inner.unit(*id).filter(|u| u.contains(pc)).cloned()
    }

    /// Current standard entry of a method
    pub fn active_code(&self, method: MethodId) -> Option<Arc<CompiledUnit>> {
        let inner = self.inner.read();
        let id = inner.dispatch.get(&method)?.code?;
        inner.unit(id).cloned()
    }

    /// OSR entry of a method at `bci`
    pub fn osr_code(&self, method: MethodId, bci: u32) -> Option<Arc<CompiledUnit>> {
        let inner = self.inner.read();
        let dispatch = inner.dispatch.get(&method)?;
        let (_, id) = dispatch.osr.iter().find(|(b, _)| *b == bci)?;
        inner.unit(*id).cloned()
    }

    /// All OSR entries of a method, by bci
    pub fn osr_entries(&self, method: MethodId) -> Vec<(u32, UnitId)> {
        self.inner
            .read()
            .dispatch
            .get(&method)
            .map(|d| d.osr.clone())
            .unwrap_or_default()
    }

    /// Number of standard publications for a method so far
    pub fn dispatch_version(&self, method: MethodId) -> u64 {
        self.inner.read().dispatch.get(&method).map_or(0, |d| d.version)
    }

    /// Every unit that is still alive
    pub fn live_units(&self) -> Vec<Arc<CompiledUnit>> {
        self.inner
            .read()
            .slots
            .iter()
            .filter_map(|s| s.unit.as_ref())
            .filter(|u| u.is_alive())
            .cloned()
            .collect()
    }

    /// One reclamation pass.
    ///
    /// Not-entrant units without activations become zombies; zombies without
    /// activations are unloaded and their bytes returned. A unit therefore
    /// needs two passes to go from not-entrant to unloaded. The runtime
    /// calls this with the compile lock held.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut inner = self.inner.write();
        let mut unloaded = Vec::new();

        for (index, slot) in inner.slots.iter_mut().enumerate() {
            let Some(unit) = slot.unit.as_ref() else {
                continue;
            };
            if unit.activations() > 0 {
                continue;
            }
            match unit.state() {
                UnitState::NotEntrant => {
                    if unit.advance_state(UnitState::Zombie) {
                        report.zombied.push((unit.id(), unit.method()));
                    }
                }
                UnitState::Zombie => {
                    unit.advance_state(UnitState::Unloaded);
                    report.unloaded.push((unit.id(), unit.method()));
                    report.reclaimed_bytes += unit.size();
                    unloaded.push((index as u32, unit.start()));
                    slot.unit = None;
                    slot.generation = slot.generation.wrapping_add(1);
                }
                _ => {}
            }
        }

        for (index, start) in unloaded {
            inner.by_address.remove(&start.as_usize());
            inner.free.push(index);
        }
        self.used_bytes.fetch_sub(report.reclaimed_bytes, Ordering::AcqRel);

        if report.made_progress() {
            tracing::debug!(
                target: "raya_jitrt::code",
                zombied = report.zombied.len(),
                unloaded = report.unloaded.len(),
                reclaimed = report.reclaimed_bytes,
                "sweep"
            );
        }
        report
    }

    /// Bytes occupied by units
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of units in the heap, dead or alive
    pub fn unit_count(&self) -> usize {
        self.inner.read().slots.iter().filter(|s| s.unit.is_some()).count()
    }
}
