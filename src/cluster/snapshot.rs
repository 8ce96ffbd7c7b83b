//! Swappable immutable snapshots.
//!
//! Readers clone the inner `Arc` and keep using that version for as long as
//! they like. Writers build a new value and swap it in. An old version is
//! freed when its last reader drops it.

use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Snapshot<T> {
    current: RwLock<Arc<T>>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the current version and returns the previous one.
    pub fn store(&self, value: Arc<T>) -> Arc<T> {
        std::mem::replace(&mut *self.current.write(), value)
    }
}
