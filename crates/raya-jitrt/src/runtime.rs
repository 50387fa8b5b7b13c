//! The JIT runtime facade
//!
//! `JitRuntime` owns one instance of every component (code repository,
//! mirror table, handle tables, counters, init state machine) and wires them
//! to the embedder's collaborators. Installation lives in `installer`, the
//! compile-request flow in `broker`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::code::{CodeRepository, CompiledUnit, ObjectRef, SweepReport, UnitState};
use crate::compile_state::CompileState;
use crate::config::{ConfigError, RuntimeConfig, CODE_ENTRY_ALIGNMENT};
use crate::counters::{CountersRegistry, MethodCounters};
use crate::deps::Dependencies;
use crate::error::{FatalError, MirrorError};
use crate::events::{CodeEvent, CodeEventSink, InvalidationReason, TracingSink};
use crate::gc::{AllocationSite, GcHooks, NoGc};
use crate::handles::{Handle, HandleTable};
use crate::hierarchy::{KlassKind, TypeSystem};
use crate::ids::{CodeAddress, KlassId, MethodId, MirrorId, UnitId};
use crate::init::{BasicType, Bootstrap, InitState, PrimitiveTypes, RuntimeInit, StandaloneBootstrap};
use crate::instrumentation::Instrumentation;
use crate::mirror::MirrorTable;
use crate::resolver::{ExceptionObject, ExceptionResolver, ExceptionThread, Resolution};
use crate::speculation::SpeculationRef;

/// Deepest object-array nesting the accessibility check follows
const MAX_ARRAY_DIMENSIONS: usize = 255;

/// Compiler-visible metadata referenced through a metadata handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataRef {
    /// A method
    Method(MethodId),
    /// A klass
    Klass(KlassId),
}

/// Object and metadata handle tables, guarded together
#[derive(Default)]
pub(crate) struct HandleTables {
    pub(crate) objects: HandleTable<ObjectRef>,
    pub(crate) metadata: HandleTable<MetadataRef>,
}

/// Runtime-side coordination between the JIT compiler and the engine
pub struct JitRuntime {
    pub(crate) config: RuntimeConfig,
    pub(crate) types: Arc<dyn TypeSystem>,
    pub(crate) instrumentation: Instrumentation,
    pub(crate) code: CodeRepository,
    pub(crate) mirrors: MirrorTable,
    pub(crate) counters: CountersRegistry,
    pub(crate) handles: Mutex<HandleTables>,
    pub(crate) gc: Arc<dyn GcHooks>,
    pub(crate) events: Arc<dyn CodeEventSink>,
    bootstrap: Arc<dyn Bootstrap>,
    init: RuntimeInit,
    primitive_types: OnceCell<PrimitiveTypes>,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) methods_compiled: AtomicU64,
}

impl JitRuntime {
    /// Create a runtime over `types` with the given configuration
    pub fn new(config: RuntimeConfig, types: Arc<dyn TypeSystem>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(JitRuntime {
            code: CodeRepository::new(
                config.code_cache_capacity,
                CODE_ENTRY_ALIGNMENT,
                config.exception_cache_capacity,
            ),
            counters: CountersRegistry::new(config.max_method_counters),
            config,
            types,
            instrumentation: Instrumentation::new(),
            mirrors: MirrorTable::new(),
            handles: Mutex::new(HandleTables::default()),
            gc: Arc::new(NoGc),
            events: Arc::new(TracingSink),
            bootstrap: Arc::new(StandaloneBootstrap),
            init: RuntimeInit::new(),
            primitive_types: OnceCell::new(),
            shutting_down: AtomicBool::new(false),
            methods_compiled: AtomicU64::new(0),
        })
    }

    /// Use `gc` as the collector collaborator
    pub fn with_gc(mut self, gc: Arc<dyn GcHooks>) -> Self {
        self.gc = gc;
        self
    }

    /// Deliver code events to `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn CodeEventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Use `bootstrap` for the one-time initialization
    pub fn with_bootstrap(mut self, bootstrap: Arc<dyn Bootstrap>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Configuration in effect
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Type-system collaborator
    pub fn types(&self) -> &dyn TypeSystem {
        &*self.types
    }

    /// Observer capabilities
    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    /// Code repository
    pub fn code(&self) -> &CodeRepository {
        &self.code
    }

    /// Mirror table
    pub fn mirrors(&self) -> &MirrorTable {
        &self.mirrors
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Bootstrap the runtime once; blocks while another thread is doing it
    pub fn initialize(&self) -> Result<(), FatalError> {
        self.init.initialize(|| {
            self.bootstrap
                .register_ids()
                .map_err(|e| FatalError::InitializationFailed(e.to_string()))?;

            let mut handles = Vec::with_capacity(BasicType::ALL.len());
            for ty in BasicType::ALL {
                let mirror = self
                    .bootstrap
                    .primitive_mirror(ty)
                    .map_err(|e| FatalError::InitializationFailed(e.to_string()))?;
                handles.push(self.make_global(mirror));
            }
            let handles: [Handle; 9] = handles
                .try_into()
                .map_err(|_| FatalError::InitializationFailed("primitive type table incomplete".to_string()))?;
            // Only the initializing thread gets here
            let _ = self.primitive_types.set(PrimitiveTypes::new(handles));
            Ok(())
        })
    }

    /// Initialization state
    pub fn init_state(&self) -> InitState {
        self.init.state()
    }

    /// Primitive type mirrors, available once initialized
    pub fn primitive_types(&self) -> Option<&PrimitiveTypes> {
        self.primitive_types.get()
    }

    // ========================================================================
    // Compilation bookkeeping
    // ========================================================================

    /// Snapshot the state a new compilation of `method` depends on
    pub fn begin_compile(&self, method: MethodId, entry_bci: Option<u32>) -> CompileState {
        CompileState::capture(
            method,
            entry_bci,
            &*self.types,
            &self.instrumentation,
            self.code.dispatch_version(method),
        )
    }

    /// Counters of `method`, if it has any yet
    pub fn method_counters(&self, method: MethodId) -> Option<Arc<MethodCounters>> {
        self.counters.get(method)
    }

    /// Number of compilations that installed code
    pub fn methods_compiled(&self) -> u64 {
        self.methods_compiled.load(Ordering::Relaxed)
    }

    /// Record a speculation that failed in `unit`.
    ///
    /// Returns true if it was not known for the method yet.
    pub fn add_failed_speculation(&self, unit: UnitId, speculation: i64) -> Result<bool, FatalError> {
        let Some(unit) = self.code.get(unit) else {
            return Ok(false);
        };
        let bytes = SpeculationRef::decode(speculation).slice(speculation, unit.speculations())?;
        match self.counters.get_or_create(unit.method()) {
            Some(counters) => Ok(counters.add_failed_speculation(bytes)),
            None => Ok(false),
        }
    }

    /// Speculations that failed in code for `method`
    pub fn failed_speculations(&self, method: MethodId) -> Vec<Vec<u8>> {
        self.counters
            .get(method)
            .map(|c| c.failed_speculations())
            .unwrap_or_default()
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Make `unit` not entrant and clear its mirror's entry point.
    ///
    /// Caller holds the compile lock and posts `events` after releasing it.
    pub(crate) fn retire(&self, unit: &CompiledUnit, reason: InvalidationReason, events: &mut Vec<CodeEvent>) -> bool {
        if !self.code.make_not_entrant(unit) {
            return false;
        }
        self.mirrors.invalidate(unit.id(), UnitState::NotEntrant);
        events.push(CodeEvent::Invalidated {
            unit: unit.id(),
            method: unit.method(),
            reason,
        });
        true
    }

    pub(crate) fn post_events(&self, events: Vec<CodeEvent>) {
        for event in &events {
            self.events.post(event);
        }
    }

    /// Re-check every live unit's dependencies after a hierarchy change.
    ///
    /// Units whose assumptions no longer hold are made not entrant and marked
    /// for deoptimization. Returns the affected units.
    pub fn flush_dependents(&self) -> Result<Vec<UnitId>, FatalError> {
        let mut events = Vec::new();
        let mut flushed = Vec::new();
        let mut corrupted = None;
        {
            let _compile = self.types.compile_lock().lock();
            for unit in self.code.live_units() {
                let deps = match Dependencies::decode(unit.encoded_dependencies()) {
                    Ok(deps) => deps,
                    Err(reason) => {
                        corrupted = Some(FatalError::DependencyTableCorrupted { unit: unit.id(), reason });
                        break;
                    }
                };
                if let Some((dep, detail)) = deps.first_violation(&*self.types) {
                    tracing::debug!(target: "raya_jitrt::deps", unit = %unit.id(), dependency = %dep, "{}", detail);
                    unit.mark_for_deoptimization();
                    if self.retire(&unit, InvalidationReason::DependencyViolated, &mut events) {
                        flushed.push(unit.id());
                    }
                }
            }
        }
        // Units retired before the corrupt table was hit stay retired
        self.post_events(events);
        match corrupted {
            Some(err) => Err(err),
            None => Ok(flushed),
        }
    }

    /// Invalidate the unit behind `mirror`, if it is still alive.
    ///
    /// Returns whether a unit was retired.
    pub fn invalidate_installed_code(&self, mirror: MirrorId) -> Result<bool, MirrorError> {
        let Some(unit_id) = self.mirrors.address(mirror)? else {
            return Ok(false);
        };
        let mut events = Vec::new();
        let retired = {
            let _compile = self.types.compile_lock().lock();
            match self.code.get(unit_id) {
                Some(unit) if unit.is_alive() => {
                    unit.mark_for_deoptimization();
                    self.retire(&unit, InvalidationReason::Explicit, &mut events);
                    true
                }
                _ => false,
            }
        };
        self.post_events(events);
        Ok(retired)
    }

    /// Reclamation pass: dead units lose their mirrors' identity links and
    /// their GC roots, and are removed from the heap.
    ///
    /// Runs under the compile lock, so it never interleaves with an install
    /// or a retirement. Must not be called with the lock held.
    pub fn sweep(&self) -> SweepReport {
        let mut events = Vec::new();
        let report = {
            let _compile = self.types.compile_lock().lock();
            let report = self.code.sweep();
            for &(unit, _) in &report.zombied {
                self.mirrors.invalidate(unit, UnitState::Zombie);
            }
            for &(unit, method) in &report.unloaded {
                self.mirrors.invalidate(unit, UnitState::Unloaded);
                self.gc.unregister_roots_in(unit);
                events.push(CodeEvent::Unloaded { unit, method });
            }
            report
        };
        self.post_events(events);
        report
    }

    /// Sweep until nothing more can be reclaimed
    pub(crate) fn reclaim(&self) {
        let mut reclaimed = 0;
        loop {
            let report = self.sweep();
            reclaimed += report.reclaimed_bytes;
            if !report.made_progress() {
                break;
            }
        }
        tracing::info!(
            target: "raya_jitrt::code",
            reclaimed,
            used = self.code.used_bytes(),
            capacity = self.code.capacity(),
            "code heap reclamation"
        );
    }

    // ========================================================================
    // Exceptions
    // ========================================================================

    /// Find where execution continues after `exception` was thrown at `pc`
    pub fn resolve_exception(
        &self,
        thread: &mut dyn ExceptionThread,
        pc: CodeAddress,
        exception: ExceptionObject,
    ) -> Result<Resolution, FatalError> {
        ExceptionResolver::new(
            &self.code,
            &*self.types,
            &self.instrumentation,
            self.config.trace_exceptions,
        )
        .resolve(thread, pc, exception)
    }

    // ========================================================================
    // Type checks
    // ========================================================================

    /// Whether code in `accessor` may refer to `target`.
    ///
    /// Object arrays are checked by their bottom element klass; primitive
    /// arrays are always accessible, and a non-instance accessor can access
    /// anything.
    pub fn check_klass_accessibility(&self, accessor: KlassId, target: KlassId) -> bool {
        let mut target = target;
        let mut dimensions = 0;
        while let KlassKind::ObjArray(element) = self.types.klass_kind(target) {
            dimensions += 1;
            if dimensions > MAX_ARRAY_DIMENSIONS {
                tracing::warn!(target: "raya_jitrt::types", klass = %target, "array klass nests too deeply");
                return false;
            }
            target = element;
        }
        match (self.types.klass_kind(accessor), self.types.klass_kind(target)) {
            (KlassKind::Instance, KlassKind::Instance) => self.types.is_klass_accessible(accessor, target),
            _ => true,
        }
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Pin `object` in a global handle
    pub fn make_global(&self, object: ObjectRef) -> Handle {
        self.handles.lock().objects.allocate(object)
    }

    /// Release a global handle
    pub fn destroy_global(&self, handle: Handle) -> Result<ObjectRef, FatalError> {
        self.handles.lock().objects.free(handle)
    }

    /// Whether `handle` is a live global handle
    pub fn is_global_handle(&self, handle: Handle) -> bool {
        self.handles.lock().objects.contains(handle)
    }

    /// Object behind a global handle
    pub fn resolve_global(&self, handle: Handle) -> Option<ObjectRef> {
        self.handles.lock().objects.get(handle).copied()
    }

    /// Hand metadata to the compiler side
    pub fn allocate_metadata_handle(&self, metadata: MetadataRef) -> Handle {
        self.handles.lock().metadata.allocate(metadata)
    }

    /// Release a metadata handle
    pub fn release_metadata_handle(&self, handle: Handle) -> Result<MetadataRef, FatalError> {
        self.handles.lock().metadata.free(handle)
    }

    /// Metadata behind a handle
    pub fn resolve_metadata(&self, handle: Handle) -> Option<MetadataRef> {
        self.handles.lock().metadata.get(handle).copied()
    }

    // ========================================================================
    // GC barriers
    // ========================================================================

    /// Pre-barrier for initializing stores into a new object.
    ///
    /// Returns whether a barrier was executed.
    pub fn new_store_pre_barrier(&self, site: &AllocationSite, object: ObjectRef) -> bool {
        if self.gc.can_elide_barrier_for(site) {
            return false;
        }
        self.gc.pre_barrier(object, None);
        true
    }

    /// Barrier before overwriting a reference field
    pub fn write_barrier_pre(&self, object: ObjectRef, previous: Option<ObjectRef>) {
        self.gc.pre_barrier(object, previous);
    }

    /// Barrier after storing a reference field
    pub fn write_barrier_post(&self, object: ObjectRef, value: ObjectRef) {
        self.gc.post_barrier(object, value);
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop accepting compilations
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            tracing::info!(target: "raya_jitrt::init", compiled = self.methods_compiled(), "runtime shutting down");
        }
    }

    /// Whether `shutdown` was called
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{ClassHierarchy, KlassSpec};
    use crate::init::BootstrapError;

    fn runtime() -> (JitRuntime, Arc<ClassHierarchy>) {
        let types = Arc::new(ClassHierarchy::new());
        let rt = JitRuntime::new(RuntimeConfig::default(), types.clone()).unwrap();
        (rt, types)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = RuntimeConfig {
            max_method_counters: 0,
            ..RuntimeConfig::default()
        };
        assert!(JitRuntime::new(config, Arc::new(ClassHierarchy::new())).is_err());
    }

    #[test]
    fn test_initialize_builds_primitive_types() {
        let (rt, _) = runtime();
        assert!(rt.primitive_types().is_none());
        rt.initialize().unwrap();
        rt.initialize().unwrap();
        assert_eq!(rt.init_state(), InitState::FullyInitialized);
        let prims = rt.primitive_types().unwrap();
        let int = prims.get(BasicType::Int);
        assert!(rt.is_global_handle(int));
        assert_eq!(rt.resolve_global(int).unwrap().id, BasicType::Int as u64 + 1);
    }

    struct BrokenBootstrap;

    impl Bootstrap for BrokenBootstrap {
        fn primitive_mirror(&self, ty: BasicType) -> Result<ObjectRef, BootstrapError> {
            Err(BootstrapError::PrimitiveType(ty.name()))
        }
    }

    #[test]
    fn test_failed_bootstrap_is_fatal_and_sticky() {
        let (rt, _) = runtime();
        let rt = rt.with_bootstrap(Arc::new(BrokenBootstrap));
        let err = rt.initialize().unwrap_err();
        assert!(matches!(err, FatalError::InitializationFailed(_)));
        assert_eq!(rt.initialize().unwrap_err(), err);
        assert_eq!(rt.init_state(), InitState::Failed);
        assert!(rt.primitive_types().is_none());
    }

    #[test]
    fn test_global_handles() {
        let (rt, _) = runtime();
        let obj = ObjectRef { id: 9, movable: true };
        let h = rt.make_global(obj);
        assert!(rt.is_global_handle(h));
        assert_eq!(rt.destroy_global(h).unwrap(), obj);
        assert!(!rt.is_global_handle(h));
        assert!(matches!(
            rt.destroy_global(h),
            Err(FatalError::CorruptedHandleTable { .. })
        ));
    }

    #[test]
    fn test_metadata_handles() {
        let (rt, _) = runtime();
        let h = rt.allocate_metadata_handle(MetadataRef::Method(MethodId::new(3)));
        assert_eq!(rt.resolve_metadata(h), Some(MetadataRef::Method(MethodId::new(3))));
        assert_eq!(
            rt.release_metadata_handle(h).unwrap(),
            MetadataRef::Method(MethodId::new(3))
        );
        assert!(rt.resolve_metadata(h).is_none());
    }

    #[test]
    fn test_klass_accessibility() {
        let types = Arc::new(ClassHierarchy::new());
        let outsider = types.add_klass(KlassSpec::instance("Outsider", None).in_package("a"));
        let hidden = types.add_klass(KlassSpec::instance("Hidden", None).in_package("b").private());
        let visible = types.add_klass(KlassSpec::instance("Visible", None).in_package("b"));
        let mut array = KlassSpec::instance("Hidden[]", None).in_package("b");
        array.kind = KlassKind::ObjArray(hidden);
        let hidden_array = types.add_klass(array);
        let mut nested = KlassSpec::instance("Hidden[][]", None).in_package("b");
        nested.kind = KlassKind::ObjArray(hidden_array);
        let hidden_matrix = types.add_klass(nested);
        let mut ints = KlassSpec::instance("int[]", None);
        ints.kind = KlassKind::TypeArray;
        let int_array = types.add_klass(ints);

        let rt = JitRuntime::new(RuntimeConfig::default(), types).unwrap();
        assert!(rt.check_klass_accessibility(outsider, visible));
        assert!(!rt.check_klass_accessibility(outsider, hidden));
        assert!(!rt.check_klass_accessibility(outsider, hidden_matrix));
        assert!(rt.check_klass_accessibility(outsider, int_array));
        assert!(rt.check_klass_accessibility(int_array, hidden));
    }

    #[test]
    fn test_self_referential_array_klass_is_inaccessible() {
        let types = Arc::new(ClassHierarchy::new());
        let accessor = types.add_klass(KlassSpec::instance("Accessor", None).in_package("a"));
        let mut looped = KlassSpec::instance("Loop[]", None).in_package("a");
        looped.kind = KlassKind::ObjArray(KlassId::new(1));
        let looped = types.add_klass(looped);
        assert_eq!(looped, KlassId::new(1));

        let rt = JitRuntime::new(RuntimeConfig::default(), types).unwrap();
        assert!(!rt.check_klass_accessibility(accessor, looped));
    }

    #[test]
    fn test_corrupt_dependency_table_still_posts_events() {
        use crate::code::UnitCandidate;
        use crate::deps::Dependency;
        use crate::events::ChannelSink;
        use crate::installer::InstallRequest;

        let (rt, types) = runtime();
        let (sink, rx) = ChannelSink::new();
        let rt = rt.with_event_sink(Arc::new(sink));
        let base = types.add_klass(KlassSpec::instance("Base", None));
        let good = rt
            .install(InstallRequest::new(
                UnitCandidate::new(MethodId::new(1), vec![0x90; 32]),
                Dependencies::new().with(Dependency::LeafType { context: base }),
            ))
            .unwrap()
            .unit
            .unwrap();
        let broken = rt
            .code()
            .materialize(UnitCandidate::new(MethodId::new(2), vec![0x90; 32]), vec![0xFF])
            .unwrap();
        rt.code().publish_standard(&broken);
        rx.try_iter().for_each(drop);

        types.add_klass(KlassSpec::instance("Sub", Some(base)));
        let err = rt.flush_dependents().unwrap_err();
        assert!(matches!(err, FatalError::DependencyTableCorrupted { unit, .. } if unit == broken.id()));

        assert!(rt.code().get(good).unwrap().is_not_entrant());
        let events: Vec<CodeEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![CodeEvent::Invalidated {
                unit: good,
                method: MethodId::new(1),
                reason: InvalidationReason::DependencyViolated,
            }]
        );
    }

    #[test]
    fn test_new_store_pre_barrier_elision() {
        let roots = Arc::new(crate::gc::CodeRootSet::new());
        let (rt, _) = runtime();
        let rt = rt.with_gc(roots.clone());
        let obj = ObjectRef { id: 1, movable: true };
        let klass = KlassId::new(0);
        assert!(!rt.new_store_pre_barrier(&AllocationSite { klass, freshly_allocated: true }, obj));
        assert!(rt.new_store_pre_barrier(&AllocationSite { klass, freshly_allocated: false }, obj));
        rt.write_barrier_pre(obj, None);
        rt.write_barrier_post(obj, obj);
        assert_eq!(roots.pre_barrier_count(), 2);
        assert_eq!(roots.post_barrier_count(), 1);
    }

    #[test]
    fn test_shutdown_flag() {
        let (rt, _) = runtime();
        assert!(!rt.is_shutting_down());
        rt.shutdown();
        rt.shutdown();
        assert!(rt.is_shutting_down());
    }
}
