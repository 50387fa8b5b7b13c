use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use raya_jitrt::{
    ClassHierarchy, CodeAddress, Dependencies, Dependency, ExceptionObject, ExceptionTable, ExceptionThread,
    InstallRequest, JitRuntime, KlassId, KlassSpec, MethodId, ObjectRef, RuntimeConfig, UnitCandidate,
};

struct QuietThread;

impl ExceptionThread for QuietThread {
    fn stack_guard_enabled(&self) -> bool {
        true
    }

    fn reguard_stack(&mut self) -> bool {
        true
    }

    fn deoptimized_frame_pc(&self) -> CodeAddress {
        CodeAddress::new(0)
    }

    fn caller_is_deoptimized(&self) -> bool {
        false
    }

    fn deoptimize_caller(&mut self) {}

    fn load_catch_klass(&mut self, _klass: KlassId) -> Result<(), ExceptionObject> {
        Ok(())
    }

    fn set_is_method_handle_return(&mut self, _value: bool) {}
}

fn runtime() -> (JitRuntime, Arc<ClassHierarchy>) {
    let types = Arc::new(ClassHierarchy::new());
    let config = RuntimeConfig {
        code_cache_capacity: 1 << 30,
        ..RuntimeConfig::default()
    };
    let rt = JitRuntime::new(config, types.clone()).unwrap();
    (rt, types)
}

fn bench_handles(c: &mut Criterion) {
    let (rt, _) = runtime();
    let obj = ObjectRef { id: 1, movable: true };

    c.bench_function("global_handle_roundtrip", |b| {
        b.iter(|| {
            let handle = rt.make_global(black_box(obj));
            rt.destroy_global(handle).unwrap()
        });
    });
}

fn bench_install(c: &mut Criterion) {
    let mut group = c.benchmark_group("install");

    for deps in [0usize, 8, 64] {
        group.bench_with_input(BenchmarkId::new("dependencies", deps), &deps, |b, &deps| {
            let (rt, types) = runtime();
            let leaves: Vec<KlassId> = (0..deps)
                .map(|i| types.add_klass(KlassSpec::instance(&format!("Leaf{}", i), None)))
                .collect();
            let m = MethodId::new(1);
            b.iter(|| {
                let dependencies: Dependencies = leaves
                    .iter()
                    .map(|&context| Dependency::LeafType { context })
                    .collect();
                let state = rt.begin_compile(m, None);
                let outcome = rt
                    .install(
                        InstallRequest::new(UnitCandidate::new(m, vec![0; 256]), dependencies)
                            .with_compile_state(&state),
                    )
                    .unwrap();
                rt.sweep();
                outcome
            });
        });
    }

    group.finish();
}

fn bench_find_by_pc(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_by_pc");

    for units in [16u32, 1024] {
        let (rt, _) = runtime();
        let mut pcs = Vec::new();
        for i in 0..units {
            let unit = rt
                .install(InstallRequest::new(
                    UnitCandidate::new(MethodId::new(i), vec![0; 128]),
                    Dependencies::new(),
                ))
                .unwrap()
                .unit
                .unwrap();
            pcs.push(rt.code().get(unit).unwrap().start().offset(64));
        }
        group.bench_with_input(BenchmarkId::new("units", units), &pcs, |b, pcs| {
            b.iter(|| {
                for &pc in pcs {
                    black_box(rt.code().find_by_pc(pc));
                }
            });
        });
    }

    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_exception");

    let (rt, types) = runtime();
    let throwable = types.add_klass(KlassSpec::instance("Throwable", None));
    let io_error = types.add_klass(KlassSpec::instance("IoError", Some(throwable)));
    let table = ExceptionTable::new()
        .with_range(0, 64, Some(io_error), 128)
        .with_range(0, 64, Some(throwable), 160);
    let unit = rt
        .install(InstallRequest::new(
            UnitCandidate::new(MethodId::new(1), vec![0; 256]).with_exception_table(table),
            Dependencies::new(),
        ))
        .unwrap()
        .unit
        .unwrap();
    let unit = rt.code().get(unit).unwrap();
    let exception = ExceptionObject {
        klass: io_error,
        identity: 1,
    };

    let cached = unit.start().offset(8);
    rt.resolve_exception(&mut QuietThread, cached, exception).unwrap();
    group.bench_function("cached", |b| {
        b.iter(|| rt.resolve_exception(&mut QuietThread, black_box(cached), exception).unwrap());
    });

    group.bench_function("unwind", |b| {
        let pc = unit.start().offset(200);
        b.iter(|| rt.resolve_exception(&mut QuietThread, black_box(pc), exception).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_handles, bench_install, bench_find_by_pc, bench_resolve);
criterion_main!(benches);
