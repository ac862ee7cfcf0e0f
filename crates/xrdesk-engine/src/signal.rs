//! Level-triggered monitor change notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set by whoever notices a display change, consumed by the coordinator.
///
/// Any number of notifications before the next [`MonitorChangeSignal::take`]
/// collapse into one.
#[derive(Debug, Clone, Default)]
pub struct MonitorChangeSignal {
    pending: Arc<AtomicBool>,
}

impl MonitorChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the monitor layout as changed.
    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Returns true if a change was signalled since the last call, clearing it.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_collapse() {
        let signal = MonitorChangeSignal::new();
        assert!(!signal.take());

        let watcher = signal.clone();
        watcher.notify();
        watcher.notify();
        assert!(signal.is_pending());
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test]
    fn test_notify_from_other_thread() {
        let signal = MonitorChangeSignal::new();
        let remote = signal.clone();
        std::thread::spawn(move || remote.notify()).join().unwrap();
        assert!(signal.take());
    }
}
