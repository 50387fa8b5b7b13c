//! Per-compilation state
//!
//! Captured when a compilation starts and consulted when its result is
//! installed. The captured counters are what lets the validator tell a race
//! (the world changed underneath the compiler) from a compiler defect.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::hierarchy::TypeSystem;
use crate::ids::{MethodId, UnitId};
use crate::instrumentation::Instrumentation;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Why a compilation produced no installed code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFailure {
    /// Human-readable reason
    pub reason: String,
    /// Whether the request may be retried later
    pub retryable: bool,
}

/// State of one compilation request
#[derive(Debug)]
pub struct CompileState {
    task_id: u64,
    method: MethodId,
    entry_bci: Option<u32>,
    modification_counter: u64,
    instrumentation_epoch: u64,
    dispatch_version: u64,
    failure: Mutex<Option<CompileFailure>>,
    installed: Mutex<Option<UnitId>>,
}

impl CompileState {
    /// Snapshot the live counters for a new compilation of `method`
    pub fn capture(
        method: MethodId,
        entry_bci: Option<u32>,
        type_system: &dyn TypeSystem,
        instrumentation: &Instrumentation,
        dispatch_version: u64,
    ) -> Self {
        Self::with_counters(
            method,
            entry_bci,
            type_system.modification_counter(),
            instrumentation.epoch(),
            dispatch_version,
        )
    }

    /// Build a state from explicit counter values
    pub fn with_counters(
        method: MethodId,
        entry_bci: Option<u32>,
        modification_counter: u64,
        instrumentation_epoch: u64,
        dispatch_version: u64,
    ) -> Self {
        CompileState {
            task_id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            method,
            entry_bci,
            modification_counter,
            instrumentation_epoch,
            dispatch_version,
            failure: Mutex::new(None),
            installed: Mutex::new(None),
        }
    }

    /// Unique id of this compilation
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Method being compiled
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// OSR entry bci, or None for a standard compilation
    pub fn entry_bci(&self) -> Option<u32> {
        self.entry_bci
    }

    /// Whether this is an on-stack-replacement compilation
    pub fn is_osr(&self) -> bool {
        self.entry_bci.is_some()
    }

    /// Type-system modification counter at compile start
    pub fn modification_counter(&self) -> u64 {
        self.modification_counter
    }

    /// Method dispatch version at compile start
    pub fn dispatch_version(&self) -> u64 {
        self.dispatch_version
    }

    /// Whether observer capabilities changed since compile start
    pub fn instrumentation_state_changed(&self, instrumentation: &Instrumentation) -> bool {
        self.instrumentation_epoch != instrumentation.epoch()
    }

    /// Record why the compilation failed
    pub fn set_failure(&self, retryable: bool, reason: impl Into<String>) {
        *self.failure.lock() = Some(CompileFailure {
            reason: reason.into(),
            retryable,
        });
    }

    /// Recorded failure, if any
    pub fn failure(&self) -> Option<CompileFailure> {
        self.failure.lock().clone()
    }

    pub(crate) fn set_installed(&self, unit: UnitId) {
        *self.installed.lock() = Some(unit);
    }

    /// Unit installed by this compilation, if any
    pub fn installed(&self) -> Option<UnitId> {
        *self.installed.lock()
    }
}
