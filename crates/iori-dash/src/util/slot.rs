use std::sync::{Arc, Mutex};

/// A single-value hand-off cell.
///
/// The writer replaces whatever is staged, the reader takes it out. Only the
/// latest staged value is ever observed.
#[derive(Debug)]
pub struct Slot<T> {
    value: Mutex<Option<Arc<T>>>,
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    /// Stages `value`, returning the previously staged one.
    pub fn put(&self, value: Arc<T>) -> Option<Arc<T>> {
        self.lock().replace(value)
    }

    pub fn take(&self) -> Option<Arc<T>> {
        self.lock().take()
    }

    pub fn peek(&self) -> Option<Arc<T>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<T>>> {
        self.value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}
