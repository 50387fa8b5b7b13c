//! Shared fixtures for the runtime integration tests

#![allow(dead_code)]

use std::sync::Arc;

use raya_jitrt::{
    ChannelSink, ClassHierarchy, CodeAddress, CodeEvent, ExceptionObject, ExceptionThread, JitRuntime, KlassId,
    KlassSpec, MethodId, RuntimeConfig, UnitCandidate,
};

/// A runtime over a small hierarchy: `Throwable <- IoError`, and `Shape` with
/// no subclasses yet
pub struct Harness {
    pub runtime: JitRuntime,
    pub types: Arc<ClassHierarchy>,
    pub events: crossbeam::channel::Receiver<CodeEvent>,
    pub throwable: KlassId,
    pub io_error: KlassId,
    pub shape: KlassId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        raya_jitrt::logging::init_tracing_with_writer("warn", tracing_subscriber::fmt::TestWriter::new());
        let types = Arc::new(ClassHierarchy::new());
        let throwable = types.add_klass(KlassSpec::instance("Throwable", None));
        let io_error = types.add_klass(KlassSpec::instance("IoError", Some(throwable)));
        let shape = types.add_klass(KlassSpec::instance("Shape", None));
        let (sink, events) = ChannelSink::new();
        let runtime = JitRuntime::new(config, types.clone())
            .unwrap()
            .with_event_sink(Arc::new(sink));
        Harness {
            runtime,
            types,
            events,
            throwable,
            io_error,
            shape,
        }
    }

    /// Events posted so far
    pub fn drain_events(&self) -> Vec<CodeEvent> {
        self.events.try_iter().collect()
    }
}

/// A candidate with `len` bytes of code
pub fn candidate(method: MethodId, len: usize) -> UnitCandidate {
    UnitCandidate::new(method, vec![0xCC; len])
}

/// A thread whose stack guard is intact and nothing else going on
#[derive(Default)]
pub struct TestThread {
    pub guard_disabled: bool,
    pub deopt_pc: Option<CodeAddress>,
    pub caller_deoptimized: bool,
    pub deoptimize_requests: usize,
    pub pending_load_errors: Vec<ExceptionObject>,
    pub method_handle_return: bool,
}

impl ExceptionThread for TestThread {
    fn stack_guard_enabled(&self) -> bool {
        !self.guard_disabled
    }

    fn reguard_stack(&mut self) -> bool {
        false
    }

    fn deoptimized_frame_pc(&self) -> CodeAddress {
        self.deopt_pc.expect("deoptimized frame pc not set")
    }

    fn caller_is_deoptimized(&self) -> bool {
        self.caller_deoptimized
    }

    fn deoptimize_caller(&mut self) {
        self.deoptimize_requests += 1;
        self.caller_deoptimized = true;
    }

    fn load_catch_klass(&mut self, _klass: KlassId) -> Result<(), ExceptionObject> {
        match self.pending_load_errors.pop() {
            Some(raised) => Err(raised),
            None => Ok(()),
        }
    }

    fn set_is_method_handle_return(&mut self, value: bool) {
        self.method_handle_return = value;
    }
}
