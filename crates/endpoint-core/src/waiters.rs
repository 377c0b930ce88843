//! Registry of threads blocked on a messenger, so they can be interrupted.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use parking_lot::Mutex;

/// Something a thread can be blocked on
pub trait Interruptible: Send + Sync {
    /// Wake every thread currently blocked here with an interruption
    fn interrupt(&self);
}

/// Weak set of blocking points; dead entries are pruned on registration
#[derive(Default)]
pub(crate) struct WaiterRegistry {
    waiters: Mutex<Vec<Weak<dyn Interruptible>>>,
}

impl WaiterRegistry {
    pub(crate) fn register(&self, waiter: Arc<dyn Interruptible>) {
        let mut waiters = self.waiters.lock();
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(Arc::downgrade(&waiter));
    }

    pub(crate) fn interrupt_all(&self) -> usize {
        let live: Vec<Arc<dyn Interruptible>> = {
            let mut waiters = self.waiters.lock();
            let live = waiters.iter().filter_map(Weak::upgrade).collect();
            waiters.clear();
            live
        };
        for waiter in &live {
            waiter.interrupt();
        }
        live.len()
    }
}
