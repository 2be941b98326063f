use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::RwLock;

use crate::jobs::runnable::panic_message;

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Callback registry for one kind of event.
///
/// Emitters own the single-firing guarantee; this type only fans a value out
/// to every subscriber in subscription order. A panicking listener is logged
/// and skipped.
pub struct EventHandlers<T> {
    listeners: RwLock<Vec<Listener<T>>>,
}

impl<T> Default for EventHandlers<T> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<T> std::fmt::Debug for EventHandlers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl<T> EventHandlers<T> {
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listeners.write().push(Box::new(listener));
    }

    pub(crate) fn emit(&self, event: &T) {
        for listener in self.listeners.read().iter() {
            notify("listener", || listener(event));
        }
    }
}

/// Invoke callback code, logging a panic instead of unwinding into the caller.
pub(crate) fn notify(event: &str, callback: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        tracing::error!(event, panic = %panic_message(panic.as_ref()), "Callback panicked");
    }
}
