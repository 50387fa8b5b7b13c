//! Exception dispatch for compiled frames
//!
//! Resolution is a small state machine:
//!
//! ```text
//! Dispatched -> Adjusted -> HandlerSearch -> Resolved -> (exit)
//!                   |                           |
//!                   +----> RedirectedToDeopt <--+
//! ```
//!
//! Loading a catch klass during the handler search may suspend the thread
//! (class loading, safepoints), and the unit or its caller frame may be
//! deoptimized meanwhile. `Resolved` is therefore not terminal: before
//! leaving it the resolver re-checks the frame and falls back to the
//! deoptimization blob when anything changed.

use std::sync::Arc;

use crate::code::{CodeRepository, CompiledUnit};
use crate::error::FatalError;
use crate::hierarchy::TypeSystem;
use crate::ids::{CodeAddress, KlassId};
use crate::instrumentation::Instrumentation;

/// Upper bound on search restarts caused by exceptions raised while loading
/// catch klasses
const MAX_SEARCH_RESTARTS: usize = 4;

/// A thrown exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionObject {
    /// Klass of the exception
    pub klass: KlassId,
    /// Heap identity
    pub identity: u64,
}

/// The thread on which an exception is being dispatched
pub trait ExceptionThread {
    /// Whether the stack overflow guard pages are armed
    fn stack_guard_enabled(&self) -> bool;

    /// Try to re-arm disabled guard pages
    fn reguard_stack(&mut self) -> bool;

    /// Original pc of the deoptimized frame when dispatch started at a deopt
    /// re-entry stub
    fn deoptimized_frame_pc(&self) -> CodeAddress;

    /// Whether the frame that called the throwing code was deoptimized
    fn caller_is_deoptimized(&self) -> bool;

    /// Deoptimize the calling frame
    fn deoptimize_caller(&mut self);

    /// Make sure `klass` is loaded. May suspend; an exception raised while
    /// loading is returned and replaces the one being dispatched.
    fn load_catch_klass(&mut self, klass: KlassId) -> Result<(), ExceptionObject>;

    /// Record whether the faulting pc is a method-handle call return
    fn set_is_method_handle_return(&mut self, value: bool);
}

/// States visited while resolving one exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    /// Entered with the raw fault pc
    Dispatched,
    /// Effective pc computed
    Adjusted,
    /// Searching the unit's handlers
    HandlerSearch,
    /// A continuation was computed, pending the exit re-check
    Resolved,
    /// Execution continues in the deoptimization blob
    RedirectedToDeopt,
}

/// Where execution continues after dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// A matching handler in the unit
    Handler(CodeAddress),
    /// The unit's unwind stub: no handler in this frame
    UnwindStub(CodeAddress),
    /// The runtime's deoptimization blob
    Deoptimize(CodeAddress),
    /// Guard pages are down: unwind unconditionally
    None,
}

/// Result of resolving one exception
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Where to continue
    pub continuation: Continuation,
    /// Exception to deliver; differs from the thrown one when the search
    /// itself raised
    pub exception: ExceptionObject,
    /// Effective pc after adjustment
    pub pc: CodeAddress,
    /// States visited, in order
    pub trace: Vec<ResolverState>,
    /// Whether the handler came from the unit's exception cache
    pub from_cache: bool,
}

/// Resolves exceptions thrown in compiled code
pub struct ExceptionResolver<'a> {
    repository: &'a CodeRepository,
    types: &'a dyn TypeSystem,
    instrumentation: &'a Instrumentation,
    trace_exceptions: bool,
}

struct Search {
    continuation: Continuation,
    exception: ExceptionObject,
    recursive: bool,
}

impl<'a> ExceptionResolver<'a> {
    /// Borrow the collaborators
    pub fn new(
        repository: &'a CodeRepository,
        types: &'a dyn TypeSystem,
        instrumentation: &'a Instrumentation,
        trace_exceptions: bool,
    ) -> Self {
        ExceptionResolver {
            repository,
            types,
            instrumentation,
            trace_exceptions,
        }
    }

    /// Resolve `exception` thrown at `pc`
    pub fn resolve(
        &self,
        thread: &mut dyn ExceptionThread,
        pc: CodeAddress,
        exception: ExceptionObject,
    ) -> Result<Resolution, FatalError> {
        let mut unit = self.unit_at(pc)?;
        let mut pc = pc;
        let mut exception = exception;
        let mut continuation = Continuation::None;
        let mut from_cache = false;
        let mut guards_ok = false;
        let mut trace = Vec::with_capacity(5);
        let mut state = ResolverState::Dispatched;

        loop {
            trace.push(state);
            state = match state {
                ResolverState::Dispatched => {
                    if unit.is_deopt_pc(pc) {
                        pc = thread.deoptimized_frame_pc();
                        unit = self.unit_at(pc)?;
                    }
                    ResolverState::Adjusted
                }
                ResolverState::Adjusted => {
                    guards_ok = thread.stack_guard_enabled() || thread.reguard_stack();
                    if self.instrumentation.can_post_on_exceptions() {
                        // Observers are notified by the interpreter once the
                        // frame is deoptimized
                        thread.deoptimize_caller();
                        ResolverState::RedirectedToDeopt
                    } else {
                        ResolverState::HandlerSearch
                    }
                }
                ResolverState::HandlerSearch => {
                    if guards_ok {
                        if let Some(handler) = unit.handler_for_exception_and_pc(exception.klass, pc) {
                            continuation = Continuation::Handler(handler);
                            from_cache = true;
                        } else {
                            let search = self.search(thread, &unit, pc, exception);
                            exception = search.exception;
                            continuation = search.continuation;
                            if let Continuation::Handler(handler) = continuation {
                                if !search.recursive && handler != self.repository.deopt_blob() {
                                    unit.add_handler_for_exception_and_pc(exception.klass, pc, handler);
                                }
                            }
                        }
                    }
                    thread.set_is_method_handle_return(unit.is_method_handle_return(pc));
                    ResolverState::Resolved
                }
                ResolverState::Resolved => {
                    if thread.caller_is_deoptimized() || !unit.is_in_use() || unit.is_marked_for_deoptimization() {
                        ResolverState::RedirectedToDeopt
                    } else {
                        break;
                    }
                }
                ResolverState::RedirectedToDeopt => {
                    continuation = Continuation::Deoptimize(self.repository.deopt_blob());
                    from_cache = false;
                    break;
                }
            };
        }

        if self.trace_exceptions {
            tracing::debug!(
                target: "raya_jitrt::exceptions",
                unit = %unit.id(),
                %pc,
                klass = %exception.klass,
                ?continuation,
                ?trace,
                "exception dispatched"
            );
        }

        Ok(Resolution {
            continuation,
            exception,
            pc,
            trace,
            from_cache,
        })
    }

    fn unit_at(&self, pc: CodeAddress) -> Result<Arc<CompiledUnit>, FatalError> {
        self.repository
            .find_by_pc(pc)
            .ok_or(FatalError::NotCompiledCode { pc })
    }

    fn search(
        &self,
        thread: &mut dyn ExceptionThread,
        unit: &CompiledUnit,
        pc: CodeAddress,
        exception: ExceptionObject,
    ) -> Search {
        let offset = unit.pc_offset(pc);
        let mut exception = exception;
        let mut recursive = false;

        'restart: for _ in 0..=MAX_SEARCH_RESTARTS {
            for range in unit.exception_table().covering(offset) {
                let matches = match range.catch_klass {
                    None => true,
                    Some(catch) => match thread.load_catch_klass(catch) {
                        Ok(()) => self.types.is_subtype(exception.klass, catch),
                        Err(raised) => {
                            exception = raised;
                            recursive = true;
                            continue 'restart;
                        }
                    },
                };
                if matches {
                    return Search {
                        continuation: Continuation::Handler(unit.start().offset(range.handler_offset as usize)),
                        exception,
                        recursive,
                    };
                }
            }
            break;
        }

        Search {
            continuation: Continuation::UnwindStub(unit.unwind_handler()),
            exception,
            recursive,
        }
    }
}
