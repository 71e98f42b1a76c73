//! Continuation predicate for an activity's tick sequence
//!
//! A `Schedule` answers one question: should the current activity run
//! another tick? The first tick of each plan invocation always proceeds;
//! after a tick the schedule stops unless the predicate opts in to more.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Mutable continuation flag shared between a plan and its tasks
#[derive(Debug, Clone)]
pub struct Schedule {
    proceed: Arc<AtomicBool>,
}

impl Schedule {
    /// Create a schedule armed for its first tick
    pub fn new() -> Self {
        Self {
            proceed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Atomically read the flag and re-arm it
    ///
    /// Returns the previous value. Re-arming means a drained sequence starts
    /// fresh on the next plan invocation without explicit reset.
    pub fn proceed(&self) -> bool {
        self.proceed.swap(true, Ordering::SeqCst)
    }

    /// Set the flag from a predicate
    pub fn next<F: FnOnce() -> bool>(&self, predicate: F) {
        self.proceed.store(predicate(), Ordering::SeqCst);
    }

    /// Set the flag with the default predicate: stop after this tick
    pub fn next_default(&self) {
        self.next(|| false);
    }

    /// Suppress the pending tick without consuming it
    pub fn suppress(&self) {
        self.proceed.store(false, Ordering::SeqCst);
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}
