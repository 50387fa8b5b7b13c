//! Per-method compilation counters
//!
//! Tracks how often a method's compiled code was thrown away at install time
//! and which speculations failed in its code, so the compiler can stop
//! retrying hopeless compilations and avoid speculating the same way twice.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::ids::MethodId;

/// Counters for a single method
#[derive(Debug, Default)]
pub struct MethodCounters {
    /// Number of installs rejected by dependency validation
    decompile_count: AtomicU32,
    /// Set once the recompilation cutoff is exceeded
    not_compilable: AtomicBool,
    /// Encoded speculations that failed in this method's code
    failed_speculations: Mutex<Vec<Box<[u8]>>>,
}

impl MethodCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rejected install, return the new count
    pub fn record_decompile(&self) -> u32 {
        self.decompile_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of rejected installs
    pub fn decompile_count(&self) -> u32 {
        self.decompile_count.load(Ordering::Relaxed)
    }

    /// Stop compiling this method
    pub fn set_not_compilable(&self) {
        self.not_compilable.store(true, Ordering::Release);
    }

    /// Whether the method must no longer be compiled
    pub fn is_not_compilable(&self) -> bool {
        self.not_compilable.load(Ordering::Acquire)
    }

    /// Record a failed speculation; returns false if it was already known
    pub fn add_failed_speculation(&self, speculation: &[u8]) -> bool {
        let mut list = self.failed_speculations.lock();
        if list.iter().any(|s| &s[..] == speculation) {
            return false;
        }
        list.push(speculation.into());
        true
    }

    /// Snapshot of the failed speculations
    pub fn failed_speculations(&self) -> Vec<Vec<u8>> {
        self.failed_speculations.lock().iter().map(|s| s.to_vec()).collect()
    }
}

/// Bounded registry of method counters
pub struct CountersRegistry {
    counters: DashMap<MethodId, Arc<MethodCounters>>,
    max_entries: usize,
}

impl CountersRegistry {
    /// Create a registry holding at most `max_entries` methods
    pub fn new(max_entries: usize) -> Self {
        CountersRegistry {
            counters: DashMap::new(),
            max_entries,
        }
    }

    /// Counters for `method`, created on first use.
    ///
    /// Returns None when the registry is full and `method` has none yet.
    pub fn get_or_create(&self, method: MethodId) -> Option<Arc<MethodCounters>> {
        if let Some(existing) = self.counters.get(&method) {
            return Some(existing.clone());
        }
        if self.counters.len() >= self.max_entries {
            return None;
        }
        Some(
            self.counters
                .entry(method)
                .or_insert_with(|| Arc::new(MethodCounters::new()))
                .clone(),
        )
    }

    /// Counters for `method` if they exist
    pub fn get(&self, method: MethodId) -> Option<Arc<MethodCounters>> {
        self.counters.get(&method).map(|entry| entry.clone())
    }

    /// Number of methods with counters
    pub fn count(&self) -> usize {
        self.counters.len()
    }
}
