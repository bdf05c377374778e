//! Live-updatable shared values.
//!
//! `DynamicConfig` wraps an `ArcSwap` so the request path can take a snapshot
//! without locking while operators (or the load monitor) publish replacements.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared values.
///
/// Clones share the same slot: a `set` through one handle is visible through all.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Default> Default for DynamicConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> DynamicConfig<T> {
    /// Create a new `DynamicConfig` with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely, returning the previous snapshot.
    pub fn set(&self, value: T) -> Arc<T> {
        self.inner.swap(Arc::new(value))
    }

    /// Update via closure. Concurrent updates may race; the last store wins.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let cur = self.inner.load_full();
        self.inner.store(Arc::new(f(&cur)));
    }
}
