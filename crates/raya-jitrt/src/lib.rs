//! Raya JIT Runtime
//!
//! The runtime side of the JIT compiler: everything between "the compiler
//! produced machine code" and "that code is running, or has been retired".
//!
//! - **Installation**: dependency validation and atomic publication of
//!   compiled units into method dispatch (`installer`, `deps`, `code`)
//! - **Mirrors**: the managed program's weak view of installed code (`mirror`)
//! - **Exceptions**: handler lookup in compiled frames that stays correct
//!   under concurrent deoptimization (`resolver`)
//! - **Bootstrap**: one-time, thread-safe initialization (`init`)
//! - **Handles**: cross-domain handle tables (`handles`)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use raya_jitrt::{ClassHierarchy, Dependencies, InstallRequest, JitRuntime, MethodId, RuntimeConfig, UnitCandidate};
//!
//! let types = Arc::new(ClassHierarchy::new());
//! let runtime = JitRuntime::new(RuntimeConfig::default(), types)?;
//!
//! let method = MethodId::new(1);
//! let state = runtime.begin_compile(method, None);
//! let candidate = UnitCandidate::new(method, machine_code);
//! let outcome = runtime.install(
//!     InstallRequest::new(candidate, Dependencies::new()).with_compile_state(&state),
//! )?;
//! assert!(outcome.is_ok());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Identifiers for klasses, methods, units, mirrors, and code addresses
pub mod ids;

/// Install results and fatal errors
pub mod error;

/// Runtime configuration
pub mod config;

/// Tracing subscriber setup
pub mod logging;

// ============================================================================
// Collaborators
// ============================================================================

/// Type-system view and the in-memory class hierarchy
pub mod hierarchy;

/// Debugger / profiler observer capabilities
pub mod instrumentation;

/// Garbage-collector hooks
pub mod gc;

/// Code lifecycle events
pub mod events;

// ============================================================================
// Components
// ============================================================================

/// Chained handle tables
pub mod handles;

/// Dependencies and their validation
pub mod deps;

/// Per-compilation state
pub mod compile_state;

/// Compiled units and the code repository
pub mod code;

/// Installed-code mirrors
pub mod mirror;

/// Exception dispatch in compiled frames
pub mod resolver;

/// Runtime initialization
pub mod init;

/// Per-method counters
pub mod counters;

/// Failed speculation decoding
pub mod speculation;

/// The runtime facade
pub mod runtime;

/// Compiled-unit installation
pub mod installer;

/// Compile-request flow
pub mod broker;

// ============================================================================
// Re-exports
// ============================================================================

pub use broker::{CompilationOutcome, CompileRequest, CompilerError, JitCompiler};
pub use code::{
    Activation, CodeRepository, CompiledUnit, DeoptSite, ExceptionTable, ObjectRef, StackMapEntry,
    SweepReport, UnitCandidate, UnitState,
};
pub use compile_state::{CompileFailure, CompileState};
pub use config::{ConfigError, RuntimeConfig};
pub use deps::{validate_dependencies, Dependencies, Dependency, Validation};
pub use error::{exit_on_fatal, CodeInstallResult, FatalError, MirrorError};
pub use events::{ChannelSink, CodeEvent, CodeEventSink, InvalidationReason, JsonLinesSink, TracingSink};
pub use gc::{AllocationSite, CodeRootSet, GcHooks, NoGc};
pub use handles::{Handle, HandleTable};
pub use hierarchy::{ClassHierarchy, CompileLock, KlassKind, KlassSpec, TypeSystem};
pub use ids::{CodeAddress, KlassId, MethodId, MirrorId, UnitId};
pub use init::{BasicType, Bootstrap, BootstrapError, InitState, PrimitiveTypes, StandaloneBootstrap};
pub use installer::{InstallOutcome, InstallRequest};
pub use instrumentation::Instrumentation;
pub use mirror::MirrorTable;
pub use resolver::{Continuation, ExceptionObject, ExceptionThread, Resolution, ResolverState};
pub use runtime::{JitRuntime, MetadataRef};
