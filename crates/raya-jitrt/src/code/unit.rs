//! Compiled units and their side tables
//!
//! A `UnitCandidate` is what the compiler hands over: machine code plus
//! metadata. Once materialized in the code heap it becomes a `CompiledUnit`,
//! which is immutable apart from its lifecycle state, its activation count
//! and its exception cache.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ids::{CodeAddress, KlassId, MethodId, UnitId};

/// Size reserved for each stub appended after the unit's code
pub const STUB_SIZE: usize = 16;

/// Where a GC pointer lives at a safepoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerLocation {
    /// In a machine register (register number)
    Register(u8),
    /// At a stack offset from frame pointer
    StackOffset(i32),
}

/// GC-visible pointers at a specific code location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMapEntry {
    /// Offset in the generated code
    pub code_offset: u32,
    /// Locations of live GC pointers at this point
    pub live_pointers: Vec<PointerLocation>,
}

/// A point where the unit can be deoptimized back to the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptSite {
    /// Machine-code offset
    pub code_offset: u32,
    /// Bytecode offset to resume interpretation at
    pub bci: u32,
}

/// Covered pc range and the handler it transfers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRange {
    /// First covered code offset
    pub start: u32,
    /// One past the last covered code offset
    pub end: u32,
    /// Exception klass caught, or None for catch-all
    pub catch_klass: Option<KlassId>,
    /// Handler code offset
    pub handler_offset: u32,
}

impl ExceptionRange {
    /// Whether `offset` lies in this range
    pub fn covers(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// Exception ranges in search order (innermost first)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionTable {
    ranges: Vec<ExceptionRange>,
}

impl ExceptionTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a range
    pub fn with_range(mut self, start: u32, end: u32, catch_klass: Option<KlassId>, handler_offset: u32) -> Self {
        self.ranges.push(ExceptionRange {
            start,
            end,
            catch_klass,
            handler_offset,
        });
        self
    }

    /// All ranges, in search order
    pub fn iter(&self) -> impl Iterator<Item = &ExceptionRange> {
        self.ranges.iter()
    }

    /// Ranges covering `offset`, in search order
    pub fn covering(&self, offset: u32) -> impl Iterator<Item = &ExceptionRange> {
        self.ranges.iter().filter(move |r| r.covers(offset))
    }

    /// Number of ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the table has no ranges
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Opaque reference to an object in the managed heap
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Heap identity
    pub id: u64,
    /// Whether the collector may move the object
    pub movable: bool,
}

/// Machine code and metadata produced by the compiler
#[derive(Debug, Clone)]
pub struct UnitCandidate {
    /// Method the code was compiled for
    pub method: MethodId,
    /// OSR entry bci, or None for the standard entry
    pub entry_bci: Option<u32>,
    /// Human-readable name for diagnostics
    pub name: Option<String>,
    /// Raw machine code bytes
    pub code: Vec<u8>,
    /// Offset of the entry point within `code`
    pub entry_offset: usize,
    /// Exception ranges
    pub exception_table: ExceptionTable,
    /// GC stack maps for safepoints
    pub stack_maps: Vec<StackMapEntry>,
    /// Deoptimization sites
    pub deopt_sites: Vec<DeoptSite>,
    /// Code offsets of method-handle call sites
    pub method_handle_call_sites: Vec<u32>,
    /// Encoded speculation log
    pub speculations: Vec<u8>,
    /// Frame size in words
    pub frame_size: u32,
    /// Objects embedded in the code
    pub embedded_oops: Vec<ObjectRef>,
}

impl UnitCandidate {
    /// Standard-entry candidate with empty side tables
    pub fn new(method: MethodId, code: Vec<u8>) -> Self {
        UnitCandidate {
            method,
            entry_bci: None,
            name: None,
            code,
            entry_offset: 0,
            exception_table: ExceptionTable::new(),
            stack_maps: Vec::new(),
            deopt_sites: Vec::new(),
            method_handle_call_sites: Vec::new(),
            speculations: Vec::new(),
            frame_size: 0,
            embedded_oops: Vec::new(),
        }
    }

    /// Turn this into an OSR candidate entering at `bci`
    pub fn osr_at(mut self, bci: u32) -> Self {
        self.entry_bci = Some(bci);
        self
    }

    /// Set the diagnostic name
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Attach the exception table
    pub fn with_exception_table(mut self, table: ExceptionTable) -> Self {
        self.exception_table = table;
        self
    }

    /// Attach the speculation log
    pub fn with_speculations(mut self, speculations: Vec<u8>) -> Self {
        self.speculations = speculations;
        self
    }

    /// Embed an object reference
    pub fn with_oop(mut self, oop: ObjectRef) -> Self {
        self.embedded_oops.push(oop);
        self
    }

    /// Check that every code offset the candidate carries lands inside its
    /// code. The message names the first offending offset.
    pub fn check_offsets(&self) -> Result<(), String> {
        let len = self.code.len();
        if self.entry_offset >= len {
            return Err(format!("entry offset {} outside code of length {}", self.entry_offset, len));
        }
        for range in self.exception_table.iter() {
            if range.start > range.end || range.end as usize > len {
                return Err(format!(
                    "exception range [{}, {}) outside code of length {}",
                    range.start, range.end, len
                ));
            }
            if range.handler_offset as usize >= len {
                return Err(format!(
                    "handler offset {} outside code of length {}",
                    range.handler_offset, len
                ));
            }
        }
        let sites = self
            .stack_maps
            .iter()
            .map(|m| m.code_offset)
            .chain(self.deopt_sites.iter().map(|s| s.code_offset))
            .chain(self.method_handle_call_sites.iter().copied());
        for offset in sites {
            if offset as usize >= len {
                return Err(format!("site offset {} outside code of length {}", offset, len));
            }
        }
        Ok(())
    }

    /// Bytes the unit occupies in the code heap, stubs included
    pub fn heap_size(&self, alignment: usize) -> usize {
        align_up(self.code.len(), alignment) + 2 * STUB_SIZE
    }
}

pub(crate) fn align_up(n: usize, alignment: usize) -> usize {
    (n + alignment - 1) / alignment * alignment
}

/// Lifecycle state of a compiled unit; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UnitState {
    /// Invocable through the dispatch table
    InUse = 0,
    /// Retired from new invocations; running frames continue
    NotEntrant = 1,
    /// Dead; no frames may reference it
    Zombie = 2,
    /// Reclaimed by the collector
    Unloaded = 3,
}

impl UnitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => UnitState::InUse,
            1 => UnitState::NotEntrant,
            2 => UnitState::Zombie,
            _ => UnitState::Unloaded,
        }
    }

    /// InUse or NotEntrant
    pub fn is_alive(self) -> bool {
        self <= UnitState::NotEntrant
    }
}

#[derive(Debug)]
struct ExceptionCacheEntry {
    klass: KlassId,
    pc: CodeAddress,
    handler: CodeAddress,
}

/// A compiled unit published in the code heap
#[derive(Debug)]
pub struct CompiledUnit {
    id: UnitId,
    method: MethodId,
    entry_bci: Option<u32>,
    name: Option<String>,
    start: CodeAddress,
    code: Box<[u8]>,
    code_span: usize,
    entry_offset: usize,
    exception_table: ExceptionTable,
    stack_maps: Box<[StackMapEntry]>,
    deopt_sites: Box<[DeoptSite]>,
    method_handle_call_sites: Box<[u32]>,
    speculations: Box<[u8]>,
    dependencies: Box<[u8]>,
    frame_size: u32,
    embedded_oops: Box<[ObjectRef]>,
    state: AtomicU8,
    marked_for_deoptimization: AtomicBool,
    activations: AtomicU32,
    exception_cache: Mutex<VecDeque<ExceptionCacheEntry>>,
    exception_cache_capacity: usize,
}

impl CompiledUnit {
    pub(crate) fn materialize(
        id: UnitId,
        start: CodeAddress,
        candidate: UnitCandidate,
        dependencies: Vec<u8>,
        alignment: usize,
        exception_cache_capacity: usize,
    ) -> Self {
        let mut deopt_sites = candidate.deopt_sites;
        deopt_sites.sort_by_key(|s| s.code_offset);
        deopt_sites.dedup();
        let code_span = align_up(candidate.code.len(), alignment);

        CompiledUnit {
            id,
            method: candidate.method,
            entry_bci: candidate.entry_bci,
            name: candidate.name,
            start,
            code: candidate.code.into_boxed_slice(),
            code_span,
            entry_offset: candidate.entry_offset,
            exception_table: candidate.exception_table,
            stack_maps: candidate.stack_maps.into_boxed_slice(),
            deopt_sites: deopt_sites.into_boxed_slice(),
            method_handle_call_sites: candidate.method_handle_call_sites.into_boxed_slice(),
            speculations: candidate.speculations.into_boxed_slice(),
            dependencies: dependencies.into_boxed_slice(),
            frame_size: candidate.frame_size,
            embedded_oops: candidate.embedded_oops.into_boxed_slice(),
            state: AtomicU8::new(UnitState::InUse as u8),
            marked_for_deoptimization: AtomicBool::new(false),
            activations: AtomicU32::new(0),
            exception_cache: Mutex::new(VecDeque::with_capacity(exception_cache_capacity)),
            exception_cache_capacity,
        }
    }

    /// Repository handle
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Method this unit was compiled for
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// OSR entry bci, None for the standard entry
    pub fn entry_bci(&self) -> Option<u32> {
        self.entry_bci
    }

    /// Whether this is an on-stack-replacement unit
    pub fn is_osr(&self) -> bool {
        self.entry_bci.is_some()
    }

    /// Diagnostic name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// First byte of the unit in the code heap
    pub fn start(&self) -> CodeAddress {
        self.start
    }

    /// Bytes occupied in the code heap, stubs included
    pub fn size(&self) -> usize {
        self.code_span + 2 * STUB_SIZE
    }

    /// Machine code
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Verified entry point
    pub fn entry_point(&self) -> CodeAddress {
        self.start.offset(self.entry_offset)
    }

    /// Stub that unwinds to the caller when no handler matches
    pub fn unwind_handler(&self) -> CodeAddress {
        self.start.offset(self.code_span)
    }

    /// Stub frames return into once they have been deoptimized
    pub fn deopt_handler(&self) -> CodeAddress {
        self.start.offset(self.code_span + STUB_SIZE)
    }

    /// Whether `pc` lies inside this unit
    pub fn contains(&self, pc: CodeAddress) -> bool {
        pc >= self.start && pc.as_usize() < self.start.as_usize() + self.size()
    }

    /// Offset of `pc` from the start of the unit
    pub fn pc_offset(&self, pc: CodeAddress) -> u32 {
        (pc.as_usize().saturating_sub(self.start.as_usize())) as u32
    }

    /// Whether `pc` is the deopt re-entry stub
    pub fn is_deopt_pc(&self, pc: CodeAddress) -> bool {
        pc == self.deopt_handler()
    }

    /// Whether `pc` is the return address of a method-handle call
    pub fn is_method_handle_return(&self, pc: CodeAddress) -> bool {
        self.contains(pc) && self.method_handle_call_sites.contains(&self.pc_offset(pc))
    }

    /// Exception ranges
    pub fn exception_table(&self) -> &ExceptionTable {
        &self.exception_table
    }

    /// GC stack maps
    pub fn stack_maps(&self) -> &[StackMapEntry] {
        &self.stack_maps
    }

    /// Stack map recorded exactly at `pc`
    pub fn stack_map_at(&self, pc: CodeAddress) -> Option<&StackMapEntry> {
        let offset = self.pc_offset(pc);
        self.stack_maps.iter().find(|m| m.code_offset == offset)
    }

    /// Deoptimization sites sorted by code offset
    pub fn deopt_sites(&self) -> &[DeoptSite] {
        &self.deopt_sites
    }

    /// Nearest deopt site at or before `pc`
    pub fn deopt_site_for(&self, pc: CodeAddress) -> Option<DeoptSite> {
        let offset = self.pc_offset(pc);
        let idx = self.deopt_sites.partition_point(|s| s.code_offset <= offset);
        idx.checked_sub(1).map(|i| self.deopt_sites[i])
    }

    /// Encoded speculation log
    pub fn speculations(&self) -> &[u8] {
        &self.speculations
    }

    /// Encoded dependency side table
    pub fn encoded_dependencies(&self) -> &[u8] {
        &self.dependencies
    }

    /// Frame size in words
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Objects embedded in the code
    pub fn embedded_oops(&self) -> &[ObjectRef] {
        &self.embedded_oops
    }

    /// Whether the collector must treat this unit as a root holder
    pub fn has_scavengable_oops(&self) -> bool {
        self.embedded_oops.iter().any(|o| o.movable)
    }

    /// Current lifecycle state
    pub fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Invocable for new calls
    pub fn is_in_use(&self) -> bool {
        self.state() == UnitState::InUse
    }

    /// InUse or NotEntrant
    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    /// Retired from new invocations but still alive
    pub fn is_not_entrant(&self) -> bool {
        self.state() == UnitState::NotEntrant
    }

    /// Move the state forward to `target`; returns false if already there or beyond
    pub(crate) fn advance_state(&self, target: UnitState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur < target as u8).then_some(target as u8)
            })
            .is_ok()
    }

    /// Request that running activations be deoptimized
    pub fn mark_for_deoptimization(&self) {
        self.marked_for_deoptimization.store(true, Ordering::Release);
    }

    /// Whether running activations must be deoptimized
    pub fn is_marked_for_deoptimization(&self) -> bool {
        self.marked_for_deoptimization.load(Ordering::Acquire)
    }

    /// Record an activation of this unit on some thread's stack
    pub fn enter(self: &Arc<Self>) -> Activation {
        self.activations.fetch_add(1, Ordering::AcqRel);
        Activation { unit: Arc::clone(self) }
    }

    /// Number of live activations
    pub fn activations(&self) -> u32 {
        self.activations.load(Ordering::Acquire)
    }

    /// Cached handler for an exception klass thrown at `pc`
    pub fn handler_for_exception_and_pc(&self, klass: KlassId, pc: CodeAddress) -> Option<CodeAddress> {
        self.exception_cache
            .lock()
            .iter()
            .find(|e| e.klass == klass && e.pc == pc)
            .map(|e| e.handler)
    }

    /// Remember a resolved handler, evicting the oldest entry when full
    pub fn add_handler_for_exception_and_pc(&self, klass: KlassId, pc: CodeAddress, handler: CodeAddress) {
        if self.exception_cache_capacity == 0 {
            return;
        }
        let mut cache = self.exception_cache.lock();
        if cache.iter().any(|e| e.klass == klass && e.pc == pc) {
            return;
        }
        if cache.len() == self.exception_cache_capacity {
            cache.pop_front();
        }
        cache.push_back(ExceptionCacheEntry { klass, pc, handler });
    }

    /// Number of cached exception handlers
    pub fn exception_cache_len(&self) -> usize {
        self.exception_cache.lock().len()
    }
}

/// RAII marker for a frame executing a unit
#[derive(Debug)]
pub struct Activation {
    unit: Arc<CompiledUnit>,
}

impl Activation {
    /// Unit being executed
    pub fn unit(&self) -> &Arc<CompiledUnit> {
        &self.unit
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        self.unit.activations.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(code_len: usize) -> Arc<CompiledUnit> {
        let candidate = UnitCandidate {
            deopt_sites: vec![
                DeoptSite { code_offset: 40, bci: 7 },
                DeoptSite { code_offset: 8, bci: 2 },
                DeoptSite { code_offset: 8, bci: 2 },
            ],
            method_handle_call_sites: vec![12],
            ..UnitCandidate::new(MethodId::new(1), vec![0x90; code_len])
        };
        Arc::new(CompiledUnit::materialize(
            UnitId::new(0, 0),
            CodeAddress::new(0x1000),
            candidate,
            vec![0],
            32,
            2,
        ))
    }

    #[test]
    fn test_layout_and_stubs() {
        let u = unit(40);
        assert_eq!(u.size(), 64 + 2 * STUB_SIZE);
        assert_eq!(u.unwind_handler(), CodeAddress::new(0x1040));
        assert_eq!(u.deopt_handler(), CodeAddress::new(0x1050));
        assert!(u.contains(u.deopt_handler()));
        assert!(!u.contains(CodeAddress::new(0x1000 + u.size())));
        assert!(u.is_deopt_pc(CodeAddress::new(0x1050)));
        assert!(u.is_method_handle_return(CodeAddress::new(0x100c)));
    }

    #[test]
    fn test_deopt_sites_sorted_and_looked_up() {
        let u = unit(64);
        assert_eq!(u.deopt_sites().len(), 2);
        assert_eq!(u.deopt_site_for(CodeAddress::new(0x1004)), None);
        assert_eq!(u.deopt_site_for(CodeAddress::new(0x1010)).unwrap().bci, 2);
        assert_eq!(u.deopt_site_for(CodeAddress::new(0x1030)).unwrap().bci, 7);
    }

    #[test]
    fn test_state_only_moves_forward() {
        let u = unit(8);
        assert!(u.is_in_use());
        assert!(u.advance_state(UnitState::NotEntrant));
        assert!(!u.advance_state(UnitState::NotEntrant));
        assert!(u.is_not_entrant());
        assert!(u.advance_state(UnitState::Zombie));
        assert!(!u.advance_state(UnitState::InUse));
        assert!(!u.is_alive());
    }

    #[test]
    fn test_activation_guard() {
        let u = unit(8);
        {
            let _a = u.enter();
            let _b = u.enter();
            assert_eq!(u.activations(), 2);
        }
        assert_eq!(u.activations(), 0);
    }

    #[test]
    fn test_exception_cache_evicts_oldest() {
        let u = unit(8);
        let k = KlassId::new(1);
        let (p1, p2, p3) = (CodeAddress::new(0x1001), CodeAddress::new(0x1002), CodeAddress::new(0x1003));
        u.add_handler_for_exception_and_pc(k, p1, CodeAddress::new(0x1010));
        u.add_handler_for_exception_and_pc(k, p2, CodeAddress::new(0x1020));
        u.add_handler_for_exception_and_pc(k, p3, CodeAddress::new(0x1030));
        assert_eq!(u.exception_cache_len(), 2);
        assert_eq!(u.handler_for_exception_and_pc(k, p1), None);
        assert_eq!(u.handler_for_exception_and_pc(k, p3), Some(CodeAddress::new(0x1030)));
    }

    #[test]
    fn test_exception_table_covering() {
        let table = ExceptionTable::new()
            .with_range(0, 10, Some(KlassId::new(2)), 20)
            .with_range(0, 30, None, 40);
        assert_eq!(table.covering(5).count(), 2);
        assert_eq!(table.covering(15).next().unwrap().handler_offset, 40);
        assert_eq!(table.covering(30).count(), 0);
    }

    #[test]
    fn test_check_offsets_accepts_in_bounds_tables() {
        let table = ExceptionTable::new().with_range(0, 16, None, 12);
        let mut c = UnitCandidate::new(MethodId::new(1), vec![0x90; 16]).with_exception_table(table);
        c.entry_offset = 15;
        c.method_handle_call_sites = vec![4];
        assert_eq!(c.check_offsets(), Ok(()));
    }

    #[test]
    fn test_check_offsets_rejects_entry_past_code() {
        let mut c = UnitCandidate::new(MethodId::new(1), vec![0x90; 16]);
        c.entry_offset = 16;
        assert_eq!(c.check_offsets().unwrap_err(), "entry offset 16 outside code of length 16");

        let empty = UnitCandidate::new(MethodId::new(1), Vec::new());
        assert!(empty.check_offsets().is_err());
    }

    #[test]
    fn test_check_offsets_rejects_bad_ranges() {
        let handler = ExceptionTable::new().with_range(0, 8, None, 64);
        let c = UnitCandidate::new(MethodId::new(1), vec![0x90; 16]).with_exception_table(handler);
        assert_eq!(c.check_offsets().unwrap_err(), "handler offset 64 outside code of length 16");

        let end = ExceptionTable::new().with_range(0, 17, None, 4);
        let c = UnitCandidate::new(MethodId::new(1), vec![0x90; 16]).with_exception_table(end);
        assert!(c.check_offsets().unwrap_err().starts_with("exception range [0, 17)"));

        let inverted = ExceptionTable::new().with_range(8, 4, None, 4);
        let c = UnitCandidate::new(MethodId::new(1), vec![0x90; 16]).with_exception_table(inverted);
        assert!(c.check_offsets().is_err());

        let mut c = UnitCandidate::new(MethodId::new(1), vec![0x90; 16]);
        c.deopt_sites = vec![DeoptSite { code_offset: 16, bci: 0 }];
        assert_eq!(c.check_offsets().unwrap_err(), "site offset 16 outside code of length 16");
    }
}
