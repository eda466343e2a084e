//! Drop-time notification for values that weak containers index.
//!
//! A container that holds a `Weak<T>` registers a hook on the value's notifier. When the
//! value is dropped the hooks run once, typically pushing a tombstone into the
//! container's reap queue so the dead slot is unlinked on the next mutation.

use std::fmt;

use parking_lot::Mutex;

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct ReclaimNotifier {
    hooks: Mutex<Vec<Hook>>,
}

impl ReclaimNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_reclaim<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.lock().push(Box::new(hook));
    }

    pub fn pending_hooks(&self) -> usize {
        self.hooks.lock().len()
    }
}

impl Drop for ReclaimNotifier {
    fn drop(&mut self) {
        for hook in self.hooks.get_mut().drain(..) {
            hook();
        }
    }
}

impl fmt::Debug for ReclaimNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimNotifier")
            .field("hooks", &self.pending_hooks())
            .finish()
    }
}

/// Implemented by values that weak containers may index.
pub trait Reclaimable: Send + Sync {
    fn reclaim_notifier(&self) -> &ReclaimNotifier;
}
