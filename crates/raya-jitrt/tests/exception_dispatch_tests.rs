//! Exception Dispatch Tests
//!
//! Tests for resolving exceptions thrown in compiled frames through the
//! runtime:
//! - Handler selection and the per-unit exception cache
//! - Redirection to the deopt blob after invalidation
//! - Observers forcing deoptimization
//! - Method-handle return detection
//!
//! # Running Tests
//! ```bash
//! cargo test --test exception_dispatch_tests
//! ```

mod common;

use std::sync::Arc;

use common::{candidate, Harness, TestThread};
use raya_jitrt::{
    CompiledUnit, Continuation, Dependencies, Dependency, ExceptionObject, ExceptionTable, FatalError,
    InstallRequest, KlassSpec, MethodId, ResolverState, RuntimeConfig,
};

fn install_with_handlers(h: &Harness, m: MethodId, deps: Dependencies) -> Arc<CompiledUnit> {
    let table = ExceptionTable::new()
        .with_range(0, 32, Some(h.io_error), 64)
        .with_range(0, 48, None, 96);
    let unit = h
        .runtime
        .install(InstallRequest::new(candidate(m, 128).with_exception_table(table), deps))
        .unwrap()
        .unit
        .unwrap();
    h.runtime.code().get(unit).unwrap()
}

fn thrown(klass: raya_jitrt::KlassId) -> ExceptionObject {
    ExceptionObject { klass, identity: 7 }
}

// ===== Handler Selection Tests =====

#[test]
fn test_matching_handler_is_selected_then_cached() {
    let h = Harness::new();
    let unit = install_with_handlers(&h, MethodId::new(1), Dependencies::new());
    let pc = unit.start().offset(16);

    let first = h
        .runtime
        .resolve_exception(&mut TestThread::default(), pc, thrown(h.io_error))
        .unwrap();
    assert_eq!(first.continuation, Continuation::Handler(unit.start().offset(64)));
    assert!(!first.from_cache);
    assert_eq!(unit.exception_cache_len(), 1);

    let second = h
        .runtime
        .resolve_exception(&mut TestThread::default(), pc, thrown(h.io_error))
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(second.continuation, first.continuation);
}

#[test]
fn test_catch_all_range_takes_other_exceptions() {
    let h = Harness::new();
    let unit = install_with_handlers(&h, MethodId::new(1), Dependencies::new());
    let r = h
        .runtime
        .resolve_exception(&mut TestThread::default(), unit.start().offset(16), thrown(h.shape))
        .unwrap();
    assert_eq!(r.continuation, Continuation::Handler(unit.start().offset(96)));
}

#[test]
fn test_pc_past_all_ranges_unwinds() {
    let h = Harness::new();
    let unit = install_with_handlers(&h, MethodId::new(1), Dependencies::new());
    let r = h
        .runtime
        .resolve_exception(&mut TestThread::default(), unit.start().offset(100), thrown(h.io_error))
        .unwrap();
    assert_eq!(r.continuation, Continuation::UnwindStub(unit.unwind_handler()));
}

#[test]
fn test_exception_cache_respects_capacity() {
    let h = Harness::with_config(RuntimeConfig {
        exception_cache_capacity: 2,
        ..RuntimeConfig::default()
    });
    let unit = install_with_handlers(&h, MethodId::new(1), Dependencies::new());
    for offset in [0, 4, 8, 12] {
        h.runtime
            .resolve_exception(&mut TestThread::default(), unit.start().offset(offset), thrown(h.io_error))
            .unwrap();
    }
    assert_eq!(unit.exception_cache_len(), 2);
}

#[test]
fn test_load_error_during_search_replaces_exception() {
    let h = Harness::new();
    let linkage = h.types.add_klass(KlassSpec::instance("LinkageError", Some(h.throwable)));
    let unit = install_with_handlers(&h, MethodId::new(1), Dependencies::new());
    let mut thread = TestThread {
        pending_load_errors: vec![thrown(linkage)],
        ..TestThread::default()
    };

    let r = h
        .runtime
        .resolve_exception(&mut thread, unit.start().offset(16), thrown(h.io_error))
        .unwrap();
    assert_eq!(r.exception.klass, linkage);
    assert_eq!(r.continuation, Continuation::Handler(unit.start().offset(96)));
    assert_eq!(unit.exception_cache_len(), 0);
}

#[test]
fn test_search_gives_up_when_loading_keeps_failing() {
    let h = Harness::new();
    let linkage = h.types.add_klass(KlassSpec::instance("LinkageError", Some(h.throwable)));
    let unit = install_with_handlers(&h, MethodId::new(1), Dependencies::new());
    let mut thread = TestThread {
        pending_load_errors: (0..10)
            .map(|identity| ExceptionObject {
                klass: linkage,
                identity,
            })
            .collect(),
        ..TestThread::default()
    };

    let r = h
        .runtime
        .resolve_exception(&mut thread, unit.start().offset(16), thrown(h.io_error))
        .unwrap();

    // One initial search plus four restarts, each popping one load error
    assert_eq!(thread.pending_load_errors.len(), 5);
    assert_eq!(r.continuation, Continuation::UnwindStub(unit.unwind_handler()));
    assert_eq!(r.exception, ExceptionObject { klass: linkage, identity: 5 });
    assert!(!r.from_cache);
    assert_eq!(unit.exception_cache_len(), 0);
}

// ===== Deoptimization Redirect Tests =====

#[test]
fn test_replaced_unit_redirects_to_deopt() {
    let h = Harness::new();
    let m = MethodId::new(1);
    let old = install_with_handlers(&h, m, Dependencies::new());
    let pc = old.start().offset(16);

    // Warm the cache before the unit is retired
    h.runtime
        .resolve_exception(&mut TestThread::default(), pc, thrown(h.io_error))
        .unwrap();
    install_with_handlers(&h, m, Dependencies::new());
    assert!(old.is_not_entrant());

    let r = h
        .runtime
        .resolve_exception(&mut TestThread::default(), pc, thrown(h.io_error))
        .unwrap();
    assert_eq!(r.continuation, Continuation::Deoptimize(h.runtime.code().deopt_blob()));
    assert!(!r.from_cache);
    assert_eq!(r.trace.last(), Some(&ResolverState::RedirectedToDeopt));
}

#[test]
fn test_flushed_dependent_redirects_to_deopt() {
    let h = Harness::new();
    let unit = install_with_handlers(
        &h,
        MethodId::new(1),
        Dependencies::new().with(Dependency::LeafType { context: h.shape }),
    );
    h.types.add_klass(KlassSpec::instance("Hexagon", Some(h.shape)));
    h.runtime.flush_dependents().unwrap();

    let r = h
        .runtime
        .resolve_exception(&mut TestThread::default(), unit.start().offset(16), thrown(h.io_error))
        .unwrap();
    assert_eq!(r.continuation, Continuation::Deoptimize(h.runtime.code().deopt_blob()));
}

#[test]
fn test_observers_force_deopt_of_caller() {
    let h = Harness::new();
    let unit = install_with_handlers(&h, MethodId::new(1), Dependencies::new());
    h.runtime.instrumentation().set_can_post_on_exceptions(true);
    let mut thread = TestThread::default();

    let r = h
        .runtime
        .resolve_exception(&mut thread, unit.start().offset(16), thrown(h.io_error))
        .unwrap();
    assert_eq!(r.continuation, Continuation::Deoptimize(h.runtime.code().deopt_blob()));
    assert_eq!(thread.deoptimize_requests, 1);
    assert_eq!(unit.exception_cache_len(), 0);
}

#[test]
fn test_frame_returning_to_deopt_stub_uses_original_pc() {
    let h = Harness::new();
    let unit = install_with_handlers(&h, MethodId::new(1), Dependencies::new());
    let mut thread = TestThread {
        deopt_pc: Some(unit.start().offset(40)),
        ..TestThread::default()
    };

    let r = h
        .runtime
        .resolve_exception(&mut thread, unit.deopt_handler(), thrown(h.io_error))
        .unwrap();
    assert_eq!(r.pc, unit.start().offset(40));
    // Offset 40 is only covered by the catch-all range
    assert_eq!(r.continuation, Continuation::Handler(unit.start().offset(96)));
}

#[test]
fn test_disabled_stack_guard_skips_search() {
    let h = Harness::new();
    let unit = install_with_handlers(&h, MethodId::new(1), Dependencies::new());
    let mut thread = TestThread {
        guard_disabled: true,
        ..TestThread::default()
    };
    let r = h
        .runtime
        .resolve_exception(&mut thread, unit.start().offset(16), thrown(h.io_error))
        .unwrap();
    assert_eq!(r.continuation, Continuation::None);
}

// ===== Method Handle Tests =====

#[test]
fn test_method_handle_return_flag_is_set() {
    let h = Harness::new();
    let mut c = candidate(MethodId::new(1), 128);
    c.method_handle_call_sites = vec![24];
    let unit_id = h
        .runtime
        .install(InstallRequest::new(c, Dependencies::new()))
        .unwrap()
        .unit
        .unwrap();
    let unit = h.runtime.code().get(unit_id).unwrap();

    let mut thread = TestThread::default();
    h.runtime
        .resolve_exception(&mut thread, unit.start().offset(24), thrown(h.io_error))
        .unwrap();
    assert!(thread.method_handle_return);

    h.runtime
        .resolve_exception(&mut thread, unit.start().offset(28), thrown(h.io_error))
        .unwrap();
    assert!(!thread.method_handle_return);
}

// ===== Fatal Path Tests =====

#[test]
fn test_pc_outside_code_heap_is_fatal() {
    let h = Harness::new();
    let pc = raya_jitrt::CodeAddress::new(0x42);
    let err = h
        .runtime
        .resolve_exception(&mut TestThread::default(), pc, thrown(h.io_error))
        .unwrap_err();
    assert_eq!(err, FatalError::NotCompiledCode { pc });
}
