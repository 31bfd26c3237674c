use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot flag: the first caller of [`ErrorLatch::try_fire`] wins, every
/// later call sees `false`. Guards per-turn error handling so duplicate
/// provider error events roll back (and refund) exactly once.
#[derive(Debug, Default)]
pub struct ErrorLatch {
    fired: AtomicBool,
}

impl ErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
