//! Debugger / profiler observer state
//!
//! Observers change how compiled code may behave: while catch/throw events
//! must be posted, exceptions in compiled frames are always handled by
//! deoptimizing. Every capability change bumps an epoch so compilations that
//! straddle the change can be rejected at install time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Live observer capabilities
#[derive(Debug, Default)]
pub struct Instrumentation {
    can_post_on_exceptions: AtomicBool,
    can_redefine_classes: AtomicBool,
    epoch: AtomicU64,
}

impl Instrumentation {
    /// No observers attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether catch/throw events must be posted (single atomic load)
    #[inline(always)]
    pub fn can_post_on_exceptions(&self) -> bool {
        self.can_post_on_exceptions.load(Ordering::Acquire)
    }

    /// Whether classes may be redefined by an agent
    pub fn can_redefine_classes(&self) -> bool {
        self.can_redefine_classes.load(Ordering::Acquire)
    }

    /// Enable or disable exception event posting
    pub fn set_can_post_on_exceptions(&self, enabled: bool) {
        if self.can_post_on_exceptions.swap(enabled, Ordering::AcqRel) != enabled {
            self.bump();
        }
    }

    /// Enable or disable class redefinition
    pub fn set_can_redefine_classes(&self, enabled: bool) {
        if self.can_redefine_classes.swap(enabled, Ordering::AcqRel) != enabled {
            self.bump();
        }
    }

    /// Current capability epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(target: "raya_jitrt::instrumentation", epoch, "observer capabilities changed");
    }
}
