//! Utilities shared by the test cases
use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks the progress of a test case. Each checkpoint asserts that the
/// previous checkpoint was reached.
pub struct SeqTracker {
    counter: AtomicUsize,
}

impl SeqTracker {
    /// Construct `SeqTracker`.
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    /// Assert that the counter is equal to `old` and then replace it with
    /// `new`.
    #[track_caller]
    pub fn expect_and_replace(&self, old: usize, new: usize) {
        let got = self.counter.load(Ordering::Relaxed);
        log::debug!("{} (expected: {}) → {}", got, old, new);
        assert_eq!(got, old, "expected {}, got {}", old, got);
        self.counter.store(new, Ordering::Relaxed);
    }
}

/// Get the task owning `mutex`.
#[track_caller]
pub fn owner_of<Traits: kmutex_port_std::PortInstance>(
    mutex: kmutex::Mutex<Traits>,
) -> Option<kmutex_port_std::Task<Traits>> {
    mutex
        .owner()
        .unwrap()
        .map(kmutex_port_std::Task::from_cb)
}
