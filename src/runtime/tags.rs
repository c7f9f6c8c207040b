//! Typed key/value tag bag scoped to a session's lifetime.
//!
//! Values are stored type-erased but read back through explicit typed
//! accessors: asking for the wrong type yields `None`, never a cast.

use std::any::Any;
use std::collections::HashMap;

/// Per-session tag storage.
#[derive(Default)]
pub struct TagBag {
    entries: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl TagBag {
    /// Create an empty tag bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Box::new(value));
    }

    /// Borrow the value under `key` if it exists and has type `T`.
    pub fn get_ref<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Clone out the value under `key` if it exists and has type `T`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.get_ref::<T>(key).cloned()
    }

    /// Take the value under `key` if it has type `T`.
    ///
    /// A value of another type is left in place.
    pub fn take<T: Any>(&mut self, key: &str) -> Option<T> {
        if !self.entries.get(key).is_some_and(|v| v.is::<T>()) {
            return None;
        }
        self.entries
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    /// Whether any value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove the value under `key` regardless of its type.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for TagBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_roundtrip() {
        let mut tags = TagBag::new();
        tags.set("authenticated", true);
        tags.set("nickname", "alice".to_string());

        assert_eq!(tags.get::<bool>("authenticated"), Some(true));
        assert_eq!(tags.get_ref::<String>("nickname").map(String::as_str), Some("alice"));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn test_wrong_type_is_none() {
        let mut tags = TagBag::new();
        tags.set("count", 3u32);

        assert_eq!(tags.get::<u64>("count"), None);
        assert_eq!(tags.take::<String>("count"), None);
        // Still there after a mistyped take
        assert_eq!(tags.get::<u32>("count"), Some(3));
        assert_eq!(tags.take::<u32>("count"), Some(3));
        assert!(!tags.contains("count"));
    }

    #[test]
    fn test_clear() {
        let mut tags = TagBag::new();
        tags.set("a", 1i32);
        tags.set("b", 2i32);
        assert!(tags.remove("a"));
        assert!(!tags.remove("a"));
        tags.clear();
        assert!(tags.is_empty());
    }
}
