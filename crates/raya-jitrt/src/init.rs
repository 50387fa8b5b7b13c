//! One-time runtime bootstrap
//!
//! `RuntimeInit` moves Uninitialized -> BeingInitialized and then to either
//! FullyInitialized or Failed, exactly once. The thread that wins the
//! transition runs the bootstrap without holding the lock; every other
//! thread blocks on the condvar until it finishes. A failed or panicking
//! bootstrap poisons the state: the failure is handed to every waiter and
//! every later caller, and nothing is retried.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::code::ObjectRef;
use crate::error::FatalError;
use crate::handles::Handle;

/// Initialization progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Nobody has started
    Uninitialized,
    /// A thread is running the bootstrap
    BeingInitialized,
    /// Done
    FullyInitialized,
    /// The bootstrap failed or panicked; initialization is never retried
    Failed,
}

/// Primitive types the compiler needs mirrors for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    /// boolean
    Boolean,
    /// byte
    Byte,
    /// char
    Char,
    /// short
    Short,
    /// int
    Int,
    /// long
    Long,
    /// float
    Float,
    /// double
    Double,
    /// void
    Void,
}

impl BasicType {
    /// All primitive types, in table order
    pub const ALL: [BasicType; 9] = [
        BasicType::Boolean,
        BasicType::Byte,
        BasicType::Char,
        BasicType::Short,
        BasicType::Int,
        BasicType::Long,
        BasicType::Float,
        BasicType::Double,
        BasicType::Void,
    ];

    /// Source-level name
    pub fn name(self) -> &'static str {
        match self {
            BasicType::Boolean => "boolean",
            BasicType::Byte => "byte",
            BasicType::Char => "char",
            BasicType::Short => "short",
            BasicType::Int => "int",
            BasicType::Long => "long",
            BasicType::Float => "float",
            BasicType::Double => "double",
            BasicType::Void => "void",
        }
    }
}

/// Global handles of the primitive type mirrors, built once at bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveTypes {
    handles: [Handle; 9],
}

impl PrimitiveTypes {
    pub(crate) fn new(handles: [Handle; 9]) -> Self {
        PrimitiveTypes { handles }
    }

    /// Handle of the mirror for `ty`
    pub fn get(&self, ty: BasicType) -> Handle {
        self.handles[ty as usize]
    }
}

/// Failure reported by a `Bootstrap` implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    /// Runtime ids could not be registered with the compiler side
    #[error("id registration failed: {0}")]
    Registration(String),

    /// A primitive type mirror could not be created
    #[error("cannot create mirror for primitive type {0}")]
    PrimitiveType(&'static str),
}

/// Compiler-side half of the bootstrap
pub trait Bootstrap: Send + Sync {
    /// Register the runtime's ids and constants with the compiler
    fn register_ids(&self) -> Result<(), BootstrapError> {
        Ok(())
    }

    /// Create the mirror object for a primitive type
    fn primitive_mirror(&self, ty: BasicType) -> Result<ObjectRef, BootstrapError>;
}

/// Bootstrap for a runtime with no compiler-side peer
#[derive(Debug, Default, Clone, Copy)]
pub struct StandaloneBootstrap;

impl Bootstrap for StandaloneBootstrap {
    fn primitive_mirror(&self, ty: BasicType) -> Result<ObjectRef, BootstrapError> {
        Ok(ObjectRef {
            id: ty as u64 + 1,
            movable: false,
        })
    }
}

#[derive(Debug)]
struct InitInner {
    state: InitState,
    failure: Option<FatalError>,
}

/// The initialization state machine
#[derive(Debug)]
pub struct RuntimeInit {
    inner: Mutex<InitInner>,
    changed: Condvar,
    ready: AtomicBool,
}

impl RuntimeInit {
    /// Uninitialized
    pub fn new() -> Self {
        RuntimeInit {
            inner: Mutex::new(InitInner {
                state: InitState::Uninitialized,
                failure: None,
            }),
            changed: Condvar::new(),
            ready: AtomicBool::new(false),
        }
    }

    /// Current state
    pub fn state(&self) -> InitState {
        self.inner.lock().state
    }

    /// Whether initialization completed successfully (lock-free)
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Run `bootstrap` once across all threads.
    ///
    /// Returns once the runtime is fully initialized, or with the bootstrap's
    /// failure if it failed (now or on an earlier call).
    pub fn initialize<F>(&self, bootstrap: F) -> Result<(), FatalError>
    where
        F: FnOnce() -> Result<(), FatalError>,
    {
        if self.is_initialized() {
            return Ok(());
        }

        {
            let mut inner = self.inner.lock();
            while inner.state == InitState::BeingInitialized {
                self.changed.wait(&mut inner);
            }
            if let Some(failure) = &inner.failure {
                return Err(failure.clone());
            }
            if inner.state == InitState::FullyInitialized {
                return Ok(());
            }
            inner.state = InitState::BeingInitialized;
        }

        tracing::debug!(target: "raya_jitrt::init", "bootstrapping runtime");
        let mut guard = BootstrapGuard { init: self, armed: true };
        let result = bootstrap();
        guard.armed = false;
        self.finish(result.clone());
        result
    }

    fn finish(&self, result: Result<(), FatalError>) {
        let mut inner = self.inner.lock();
        match result {
            Ok(()) => {
                inner.state = InitState::FullyInitialized;
                self.ready.store(true, Ordering::Release);
                tracing::info!(target: "raya_jitrt::init", "runtime initialized");
            }
            Err(e) => {
                e.report();
                inner.state = InitState::Failed;
                inner.failure = Some(e);
            }
        }
        self.changed.notify_all();
    }
}

/// Publishes a failure if the bootstrap unwinds, so waiters wake up
struct BootstrapGuard<'a> {
    init: &'a RuntimeInit,
    armed: bool,
}

impl Drop for BootstrapGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.init
                .finish(Err(FatalError::InitializationFailed("bootstrap panicked".to_string())));
        }
    }
}

impl Default for RuntimeInit {
    fn default() -> Self {
        Self::new()
    }
}
