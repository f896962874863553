//! Thread wake implementation for the executor.
use futures::task::ArcWake;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

pub struct ThreadNotify {
    /// The (single) executor thread.
    thread: Thread,
    /// Set by every wake until `block_on` consumes it.
    unparked: AtomicBool,
}

impl ThreadNotify {
    pub fn new() -> Self {
        ThreadNotify {
            thread: thread::current(),
            unparked: AtomicBool::new(false),
        }
    }

    /// Consumes a pending wakeup, if any.
    pub fn take_wakeup(&self) -> bool {
        self.unparked.swap(false, Ordering::Acquire)
    }
}

impl Default for ThreadNotify {
    fn default() -> Self {
        Self::new()
    }
}

impl ArcWake for ThreadNotify {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let unparked = arc_self.unparked.swap(true, Ordering::Release);
        if !unparked {
            // Only the first wake since the last take needs to unpark.
            arc_self.thread.unpark();
        }
    }
}
