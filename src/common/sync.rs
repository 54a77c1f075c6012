//! Async coordination primitives

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// An async countdown latch.
///
/// `wait` resolves once `count_down` has been called as many times as the
/// initial count. Used by the flow bridge, where each splice direction
/// counts down once and a watcher task waits for both.
pub struct Latch {
    count: AtomicUsize,
    notify: Notify,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    /// Decrement the counter, waking waiters when it reaches zero.
    pub fn count_down(&self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "latch counted below zero");
        if previous == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait until the counter reaches zero.
    pub async fn wait(&self) {
        loop {
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before re-checking, so a concurrent
            // count_down cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}
