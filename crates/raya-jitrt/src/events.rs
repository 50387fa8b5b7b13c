//! Code lifecycle events for observability tooling
//!
//! Events are posted after the compile lock is released. Sinks must not call
//! back into the runtime's installation paths.

use std::io::Write;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::ids::{CodeAddress, MethodId, UnitId};

/// Why a unit stopped being entrant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    /// A newer standard unit was installed for the method
    Replaced,
    /// A newer OSR unit was installed at the same bci
    OsrReplaced,
    /// A recorded dependency no longer holds
    DependencyViolated,
    /// Invalidated through its mirror
    Explicit,
}

/// A code lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CodeEvent {
    /// A unit was published
    Installed {
        /// Unit id
        unit: UnitId,
        /// Method compiled
        method: MethodId,
        /// OSR bci, None for the standard entry
        entry_bci: Option<u32>,
        /// Start of the unit in the code heap
        address: CodeAddress,
        /// Bytes occupied
        size: usize,
        /// Diagnostic name
        name: Option<String>,
    },
    /// A unit was made not entrant
    Invalidated {
        /// Unit id
        unit: UnitId,
        /// Method compiled
        method: MethodId,
        /// Why
        reason: InvalidationReason,
    },
    /// A unit was removed from the code heap
    Unloaded {
        /// Unit id
        unit: UnitId,
        /// Method compiled
        method: MethodId,
    },
    /// A compilation produced no installed code
    CompilationFailed {
        /// Method compiled
        method: MethodId,
        /// OSR bci, None for the standard entry
        entry_bci: Option<u32>,
        /// Human-readable reason
        reason: String,
        /// Whether the compilation may be retried
        retryable: bool,
    },
}

/// Receiver of code events
pub trait CodeEventSink: Send + Sync {
    /// Deliver one event
    fn post(&self, event: &CodeEvent);
}

/// Emits events as `tracing` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl CodeEventSink for TracingSink {
    fn post(&self, event: &CodeEvent) {
        match event {
            CodeEvent::Installed {
                unit,
                method,
                entry_bci,
                address,
                size,
                ..
            } => tracing::info!(
                target: "raya_jitrt::events",
                %unit, %method, ?entry_bci, %address, size,
                "code installed"
            ),
            CodeEvent::Invalidated { unit, method, reason } => tracing::info!(
                target: "raya_jitrt::events",
                %unit, %method, ?reason,
                "code invalidated"
            ),
            CodeEvent::Unloaded { unit, method } => tracing::debug!(
                target: "raya_jitrt::events",
                %unit, %method,
                "code unloaded"
            ),
            CodeEvent::CompilationFailed {
                method,
                entry_bci,
                reason,
                retryable,
            } => tracing::info!(
                target: "raya_jitrt::events",
                %method, ?entry_bci, retryable,
                "compilation failed: {}", reason
            ),
        }
    }
}

/// Forwards events into a crossbeam channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<CodeEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn new() -> (Self, Receiver<CodeEvent>) {
        let (tx, rx) = channel::unbounded();
        (ChannelSink { tx }, rx)
    }
}

impl CodeEventSink for ChannelSink {
    fn post(&self, event: &CodeEvent) {
        // Receiver gone: nobody is listening any more
        let _ = self.tx.send(event.clone());
    }
}

/// Writes one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        JsonLinesSink {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> CodeEventSink for JsonLinesSink<W> {
    fn post(&self, event: &CodeEvent) {
        let mut writer = self.writer.lock();
        let result = serde_json::to_writer(&mut *writer, event)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"));
        if let Err(e) = result {
            tracing::warn!(target: "raya_jitrt::events", error = %e, "failed to write code event");
        }
    }
}
