//! Process-wide exit flag shared by every long-lived loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Blocking sleep that wakes early on shutdown. Returns `true` if
    /// shutdown was requested before `duration` elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_triggered() {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
        self.is_triggered()
    }
}
