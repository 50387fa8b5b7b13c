//! Compile-request flow
//!
//! Drives one compilation from request to installed code: gate checks,
//! runtime initialization, the compiler call, and installation of whatever
//! the compiler produced.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::code::UnitCandidate;
use crate::compile_state::CompileState;
use crate::deps::Dependencies;
use crate::error::FatalError;
use crate::events::CodeEvent;
use crate::ids::{MethodId, MirrorId};
use crate::installer::InstallRequest;
use crate::runtime::JitRuntime;

/// A request to compile one method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileRequest {
    /// Method to compile
    pub method: MethodId,
    /// OSR entry bci, None for a standard compilation
    pub entry_bci: Option<u32>,
}

/// What the compiler handed back
#[derive(Debug)]
pub enum CompilationOutcome {
    /// Code to install
    Produced {
        /// Code and side tables
        candidate: UnitCandidate,
        /// Recorded assumptions
        dependencies: Dependencies,
        /// Mirror to bind
        mirror: Option<MirrorId>,
    },
    /// The compiler gave up
    Failed {
        /// Why
        message: String,
        /// Whether a later attempt may succeed
        retryable: bool,
    },
    /// The compiler returned without code or a reason
    NothingProduced,
}

/// The compiler itself failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompilerError {
    /// An unexpected error escaped the compiler
    #[error("uncaught exception in compiler: {0}")]
    Uncaught(String),
}

/// A JIT compiler driven by the runtime
pub trait JitCompiler: Send + Sync {
    /// Whether the compiler is still compiling itself
    fn is_bootstrapping(&self) -> bool {
        false
    }

    /// Compile `request`. Implementations may inspect `state` and the
    /// runtime (for example to read failed speculations).
    fn compile(
        &self,
        runtime: &JitRuntime,
        request: &CompileRequest,
        state: &CompileState,
    ) -> Result<CompilationOutcome, CompilerError>;
}

impl JitRuntime {
    /// Compile and install `method`.
    ///
    /// The returned state records the installed unit or why there is none.
    /// A compiler error is fatal.
    pub fn compile_method(
        &self,
        compiler: &dyn JitCompiler,
        method: MethodId,
        entry_bci: Option<u32>,
    ) -> Result<Arc<CompileState>, FatalError> {
        let state = Arc::new(self.begin_compile(method, entry_bci));

        if entry_bci.is_some() && compiler.is_bootstrapping() {
            self.fail_compile(&state, true, "No OSR during bootstrap");
            return Ok(state);
        }
        if self.is_shutting_down() {
            self.fail_compile(&state, false, "Avoiding compilation during shutdown");
            return Ok(state);
        }
        if self.method_counters(method).is_some_and(|c| c.is_not_compilable()) {
            self.fail_compile(&state, false, "method is not compilable");
            return Ok(state);
        }

        self.initialize()?;

        let request = CompileRequest { method, entry_bci };
        let outcome = compiler
            .compile(self, &request, &state)
            .map_err(|e| FatalError::CompilerCrashed(e.to_string()))?;

        match outcome {
            CompilationOutcome::Produced {
                candidate,
                dependencies,
                mirror,
            } => {
                if candidate.method != method || candidate.entry_bci != entry_bci {
                    let reason = format!(
                        "compiler produced code for {} at entry {:?}, expected {} at entry {:?}",
                        candidate.method, candidate.entry_bci, method, entry_bci
                    );
                    tracing::warn!(target: "raya_jitrt::broker", %method, "{}", reason);
                    self.fail_compile(&state, false, &reason);
                    return Ok(state);
                }
                let mut install = InstallRequest::new(candidate, dependencies).with_compile_state(&state);
                install.mirror = mirror;
                if self.install(install)?.is_ok() {
                    self.methods_compiled.fetch_add(1, Ordering::Relaxed);
                }
            }
            CompilationOutcome::Failed { message, retryable } => {
                self.fail_compile(&state, retryable, &message);
            }
            CompilationOutcome::NothingProduced => {
                self.fail_compile(&state, true, "no unit produced");
            }
        }
        Ok(state)
    }

    fn fail_compile(&self, state: &CompileState, retryable: bool, reason: &str) {
        state.set_failure(retryable, reason);
        self.events.post(&CodeEvent::CompilationFailed {
            method: state.method(),
            entry_bci: state.entry_bci(),
            reason: reason.to_string(),
            retryable,
        });
    }
}
