//! Bounded path → digest cache. Full means full: there is no eviction.

use std::collections::HashMap;

pub struct DigestCache {
    entries: HashMap<String, String>,
    capacity: usize,
}

impl DigestCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn lookup(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    /// First write wins. Returns false when the path is already present or the
    /// cache is at capacity.
    pub fn insert_if_absent(&mut self, path: &str, digest: &str) -> bool {
        if self.entries.contains_key(path) || self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.insert(path.to_string(), digest.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
