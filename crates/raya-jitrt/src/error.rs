//! Error types for the JIT runtime
//!
//! Two families live here. `CodeInstallResult` is the non-fatal outcome of an
//! installation attempt and tells the compiler whether to retry.
//! `FatalError` covers broken runtime invariants; callers propagate it to
//! process teardown and never retry.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::ids::{CodeAddress, MirrorId, UnitId};

/// Outcome of installing a compiled unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeInstallResult {
    /// The unit was published
    Ok,
    /// A dependency failed while the type hierarchy was changing; recompile
    DependenciesFailed,
    /// A dependency failed with no concurrent change; the compiler produced
    /// an impossible assumption
    DependenciesInvalid,
    /// The code heap (or method counters table) is exhausted
    CacheFull,
}

impl CodeInstallResult {
    /// Whether this outcome means the unit was published
    pub fn is_ok(self) -> bool {
        self == CodeInstallResult::Ok
    }

    /// Whether the compiler may retry the compilation later
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            CodeInstallResult::DependenciesFailed | CodeInstallResult::CacheFull
        )
    }

    /// Short name used in logs and failure messages
    pub fn name(self) -> &'static str {
        match self {
            CodeInstallResult::Ok => "ok",
            CodeInstallResult::DependenciesFailed => "dependencies failed",
            CodeInstallResult::DependenciesInvalid => "dependencies invalid",
            CodeInstallResult::CacheFull => "code cache full",
        }
    }
}

/// Unrecoverable runtime corruption
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    /// A mirror was bound to a unit while it was, or had been, bound already
    #[error("cannot bind {mirror} to {unit}: mirror already bound to {existing:?}")]
    DoubleBind {
        /// Mirror being bound
        mirror: MirrorId,
        /// Unit the caller tried to bind
        unit: UnitId,
        /// Unit currently referenced by the mirror (None if cleared)
        existing: Option<UnitId>,
    },

    /// A mirror id that no longer names a live mirror reached the runtime
    #[error("stale mirror {mirror} used while binding {unit}")]
    StaleMirror {
        /// Mirror id presented
        mirror: MirrorId,
        /// Unit being bound
        unit: UnitId,
    },

    /// A handle that is not live was released or the free list is broken
    #[error("corrupted handle table: {reason} (handle {handle})")]
    CorruptedHandleTable {
        /// Raw handle index
        handle: u32,
        /// What was found
        reason: &'static str,
    },

    /// An exception was dispatched for a pc outside any compiled unit
    #[error("pc {pc} is not in compiled code")]
    NotCompiledCode {
        /// Faulting pc
        pc: CodeAddress,
    },

    /// A failed speculation referenced bytes outside the unit's speculation log
    #[error("speculation {speculation:#x} [index: {index}, length: {length}] out of bounds wrt encoded speculations of length {available}")]
    SpeculationOutOfBounds {
        /// Raw encoded speculation
        speculation: i64,
        /// Decoded index
        index: u32,
        /// Decoded length
        length: u32,
        /// Size of the unit's speculation log
        available: usize,
    },

    /// A unit's encoded dependency side table could not be decoded
    #[error("dependency table of {unit} is corrupted: {reason}")]
    DependencyTableCorrupted {
        /// Unit whose side table is broken
        unit: UnitId,
        /// Decoder message
        reason: String,
    },

    /// The one-time runtime bootstrap failed
    #[error("runtime initialization failed: {0}")]
    InitializationFailed(String),

    /// The compiler failed in a way that leaves it unusable
    #[error("compiler crashed: {0}")]
    CompilerCrashed(String),
}

static FATAL_REPORTED: AtomicBool = AtomicBool::new(false);

impl FatalError {
    /// Log the full diagnostic for this error.
    ///
    /// Only the first fatal error in the process is reported; later ones are
    /// racing threads observing the same corruption.
    pub fn report(&self) {
        if FATAL_REPORTED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::error!(target: "raya_jitrt::fatal", error = ?self, "{}", self);
        }
    }
}

/// Report a fatal error and terminate the process.
pub fn exit_on_fatal(err: FatalError) -> ! {
    err.report();
    eprintln!("fatal error in JIT runtime: {}", err);
    std::process::exit(-1)
}

/// Errors raised to the managed program by mirror operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MirrorError {
    /// The mirror no longer refers to invocable code
    #[error("invalid installed code{}", .name.as_ref().map(|n| format!(" '{}'", n)).unwrap_or_default())]
    InvalidInstalledCode {
        /// Mirror name, if one was given
        name: Option<String>,
    },

    /// The mirror id does not name a live mirror
    #[error("unknown mirror {0}")]
    UnknownMirror(MirrorId),
}
