//! Validation result caching.
//!
//! Handler code is static document data, so the same snippet is validated
//! over and over as handlers fire. This module provides a thread-safe cache
//! of validation results keyed by the code text.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::validator::{CodeValidator, ValidationResult};

/// Results kept by [`ValidationCache::new`] before it starts over.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A thread-safe cache of [`ValidationResult`]s.
///
/// There is no process-wide instance: construct one and hand it to every
/// dispatcher that should share it.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use event_sandbox_rs::sandbox::cache::ValidationCache;
///
/// let cache = ValidationCache::new();
///
/// // First call runs the validator
/// let first = cache.get_or_validate("return eval('1');");
///
/// // Second call returns the cached result
/// let second = cache.get_or_validate("return eval('1');");
///
/// assert!(Arc::ptr_eq(&first, &second));
/// assert!(!first.valid);
/// ```
#[derive(Debug)]
pub struct ValidationCache {
    entries: RwLock<HashMap<String, Arc<ValidationResult>>>,
    capacity: Option<usize>,
}

impl Default for ValidationCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ValidationCache {
    /// Create a cache bounded at [`DEFAULT_CAPACITY`] results.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache holding at most `capacity` results. When full, the
    /// cache is emptied before the next insertion.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    /// Create a cache that never evicts. Only for a known, finite set of
    /// handler snippets.
    pub fn unbounded() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: None,
        }
    }

    /// Maximum number of cached results, if bounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Get the cached result for `code` or validate it now.
    pub fn get_or_validate(&self, code: &str) -> Arc<ValidationResult> {
        if let Some(hit) = self.read().get(code) {
            return Arc::clone(hit);
        }

        // Validate outside any lock
        let result = Arc::new(CodeValidator::validate(code));

        let mut entries = self.write();
        // Another caller may have validated the same code meanwhile
        if let Some(existing) = entries.get(code) {
            return Arc::clone(existing);
        }
        if self.capacity.is_some_and(|cap| entries.len() >= cap) {
            entries.clear();
        }
        if self.capacity != Some(0) {
            entries.insert(code.to_string(), Arc::clone(&result));
        }
        result
    }

    /// Check if a result for `code` is cached.
    pub fn contains(&self, code: &str) -> bool {
        self.read().contains_key(code)
    }

    /// Remove the result for `code`. Returns `true` if it was present.
    pub fn remove(&self, code: &str) -> bool {
        self.write().remove(code).is_some()
    }

    /// Clear all cached results.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Get the number of cached results.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ValidationResult>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<ValidationResult>>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_new() {
        let cache = ValidationCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.capacity(), Some(DEFAULT_CAPACITY));
        assert_eq!(ValidationCache::unbounded().capacity(), None);
    }

    #[test]
    fn test_default_cache_stays_bounded() {
        let cache = ValidationCache::new();
        for i in 0..DEFAULT_CAPACITY + 10 {
            cache.get_or_validate(&format!("return {i};"));
        }
        assert!(cache.len() <= DEFAULT_CAPACITY);
        assert!(cache.contains(&format!("return {};", DEFAULT_CAPACITY + 9)));
    }

    #[test]
    fn test_cache_hit_shares_result() {
        let cache = ValidationCache::new();
        let first = cache.get_or_validate("fetch('/x')");
        let second = cache.get_or_validate("fetch('/x')");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.contains("fetch('/x')"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = ValidationCache::new();
        cache.get_or_validate("a");
        cache.get_or_validate("b");

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_bounded_cache() {
        let cache = ValidationCache::with_capacity(2);
        cache.get_or_validate("a");
        cache.get_or_validate("b");
        cache.get_or_validate("c");

        assert_eq!(cache.len(), 1);
        assert!(cache.contains("c"));

        let disabled = ValidationCache::with_capacity(0);
        disabled.get_or_validate("a");
        assert!(disabled.is_empty());
    }

    #[test]
    fn test_shared_between_threads() {
        let cache = Arc::new(ValidationCache::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.get_or_validate("eval('x')").valid)
            })
            .collect();

        for handle in handles {
            assert!(!handle.join().unwrap());
        }
        assert_eq!(cache.len(), 1);
    }
}
