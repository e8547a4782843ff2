/*
 * Copyright 2022 Cargill Incorporated
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 * -----------------------------------------------------------------------------
 */

//! A byte-capacity LRU cache for point reads against the durable backend.
//!
//! Entries are whole values behind shared immutable pointers, so a cache hit
//! costs a reference count rather than a copy. A key known to be absent from
//! the store is cached as a negative entry. When the total byte cost of the
//! cached values exceeds the configured capacity, whole entries are evicted
//! in least-recently-used order.

use std::sync::Arc;

use lru::LruCache;

/// Cache of values (or known-absent markers) keyed by backend key.
pub struct ObjectCache {
    capacity: usize,
    size: usize,
    cache: LruCache<Vec<u8>, Option<Arc<Vec<u8>>>>,
}

impl ObjectCache {
    /// Constructs a cache bounded by `capacity` total value bytes.
    pub fn new(capacity: usize) -> Self {
        ObjectCache {
            capacity,
            size: 0,
            cache: LruCache::unbounded(),
        }
    }

    /// Looks up a key, refreshing its recency.
    ///
    /// The outer `Option` distinguishes a cache miss from a hit; a hit on a
    /// negative entry yields `Some(None)`.
    pub fn get(&mut self, key: &[u8]) -> Option<Option<Arc<Vec<u8>>>> {
        self.cache.get(&key.to_vec()).cloned()
    }

    /// Records the value (or known absence) for a key, evicting older
    /// entries if the byte capacity is exceeded.
    ///
    /// Returns `true` if a value was cached, `false` for a negative entry.
    pub fn put(&mut self, key: &[u8], value: Option<Arc<Vec<u8>>>) -> bool {
        let cached = value.is_some();

        if let Some(old) = self.cache.pop(&key.to_vec()) {
            self.size -= cost(&old);
        }
        self.size += cost(&value);
        self.cache.put(key.to_vec(), value);

        while self.size > self.capacity {
            match self.cache.pop_lru() {
                Some((_, evicted)) => self.size -= cost(&evicted),
                None => break,
            }
        }

        cached
    }

    /// Drops the entry for a key, if cached.
    pub fn remove(&mut self, key: &[u8]) {
        if let Some(old) = self.cache.pop(&key.to_vec()) {
            self.size -= cost(&old);
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.size = 0;
    }
}

fn cost(value: &Option<Arc<Vec<u8>>>) -> usize {
    value.as_ref().map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_miss_and_negative_entries() {
        let mut cache = ObjectCache::new(1024);

        assert!(cache.get(b"a").is_none());

        assert!(cache.put(b"a", Some(Arc::new(b"alice".to_vec()))));
        match cache.get(b"a") {
            Some(Some(value)) => assert_eq!(value.as_slice(), b"alice"),
            other => panic!("unexpected cache state: {:?}", other.is_some()),
        }

        // a negative entry is a hit that carries no value
        assert!(!cache.put(b"n", None));
        assert_eq!(cache.get(b"n"), Some(None));
    }

    /// Filling the cache past its byte capacity evicts the least recently
    /// used entry, not the most recently inserted one.
    #[test]
    fn eviction_follows_recency() {
        let cache_size = 1024;
        let mut cache = ObjectCache::new(cache_size);

        let a_val = b"alice".to_vec();
        let b_val = b"bob".to_vec();

        cache.put(b"a", Some(Arc::new(a_val.clone())));
        cache.put(b"b", Some(Arc::new(b_val.clone())));

        // touch 'a' so that 'b' is the eviction candidate
        assert!(cache.get(b"a").is_some());

        let fill = vec![b'f'; cache_size - a_val.len() - b_val.len() + 1];
        assert!(cache.put(b"f", Some(Arc::new(fill))));

        assert!(cache.get(b"b").is_none());
        match cache.get(b"a") {
            Some(Some(value)) => assert_eq!(value.as_slice(), b"alice"),
            _ => panic!("'a' should have survived eviction"),
        }
    }

    #[test]
    fn remove_and_overwrite_adjust_size() {
        let mut cache = ObjectCache::new(10);

        cache.put(b"a", Some(Arc::new(vec![0; 6])));
        cache.put(b"b", Some(Arc::new(vec![0; 4])));
        assert!(cache.get(b"a").is_some());
        assert!(cache.get(b"b").is_some());

        // overwriting replaces the old cost; both entries still fit
        cache.put(b"a", Some(Arc::new(vec![0; 5])));
        assert!(cache.get(b"b").is_some());

        cache.remove(b"a");
        assert!(cache.get(b"a").is_none());

        // freed capacity admits a new entry without evicting 'b'
        cache.put(b"c", Some(Arc::new(vec![0; 6])));
        assert!(cache.get(b"b").is_some());
        assert!(cache.get(b"c").is_some());
    }
}
