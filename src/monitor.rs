//! Cooperative stop checks, polled once per reference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait ResourceMonitor {
    /// Whether the run should stop before the next reference, given how many
    /// references have been read so far.
    fn should_stop(&self, read: u64) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoMonitor;

impl ResourceMonitor for NoMonitor {
    fn should_stop(&self, _read: u64) -> bool {
        false
    }
}

/// Stops once tripped, from any thread.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl ResourceMonitor for StopFlag {
    fn should_stop(&self, _read: u64) -> bool {
        self.is_tripped()
    }
}

/// Stops after a fixed number of references have been read, rejected ones
/// included.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceBudget(pub u64);

impl ResourceMonitor for ReferenceBudget {
    fn should_stop(&self, read: u64) -> bool {
        read >= self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_shared_between_clones() {
        let flag = StopFlag::new();
        let observer = flag.clone();
        assert!(!observer.should_stop(10));
        flag.trip();
        assert!(observer.should_stop(10));
    }

    #[test]
    fn test_reference_budget() {
        let budget = ReferenceBudget(2);
        assert!(!budget.should_stop(1));
        assert!(budget.should_stop(2));
        assert!(!NoMonitor.should_stop(u64::MAX));
    }
}
