/*
 * Copyright 2019 Bitwise IO, Inc.
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

//! A transient, in-memory ordered key-value backend.
//!
//! `BTreeBackend` holds the writes of a single non-root state delta. The
//! data map is shared with outstanding cursors, which navigate by re-seeking
//! with `BTreeMap::range` on every step so that they never pin a borrow of
//! the map across calls.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::{Arc, PoisonError, RwLock};

use crate::database::error::DatabaseError;
use crate::database::{Backend, Cursor, Metadata};

type DataMap = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

pub struct BTreeBackend {
    map: DataMap,
    metadata: Metadata,
}

impl BTreeBackend {
    pub fn new() -> Self {
        BTreeBackend {
            map: Arc::new(RwLock::new(BTreeMap::new())),
            metadata: Metadata::default(),
        }
    }
}

impl Default for BTreeBackend {
    fn default() -> Self {
        BTreeBackend::new()
    }
}

impl Backend for BTreeBackend {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn erase(&mut self, key: &[u8]) -> Result<(), DatabaseError> {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DatabaseError> {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.metadata = Metadata::default();
        Ok(())
    }

    fn size(&self) -> Result<u64, DatabaseError> {
        Ok(self
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64)
    }

    fn begin(&self) -> Result<Box<dyn Cursor>, DatabaseError> {
        let position = self
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .next()
            .cloned();
        Ok(Box::new(BTreeCursor {
            map: Arc::clone(&self.map),
            position,
        }))
    }

    fn end(&self) -> Result<Box<dyn Cursor>, DatabaseError> {
        Ok(Box::new(BTreeCursor {
            map: Arc::clone(&self.map),
            position: None,
        }))
    }

    fn find(&self, key: &[u8]) -> Result<Box<dyn Cursor>, DatabaseError> {
        let position = if self
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
        {
            Some(key.to_vec())
        } else {
            None
        };
        Ok(Box::new(BTreeCursor {
            map: Arc::clone(&self.map),
            position,
        }))
    }

    fn lower_bound(&self, key: &[u8]) -> Result<Box<dyn Cursor>, DatabaseError> {
        let position = self
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range(key.to_vec()..)
            .next()
            .map(|(k, _)| k.clone());
        Ok(Box::new(BTreeCursor {
            map: Arc::clone(&self.map),
            position,
        }))
    }

    // The transient backend applies writes immediately; batching only exists
    // to satisfy the common backend contract.
    fn start_write_batch(&mut self) -> Result<(), DatabaseError> {
        Ok(())
    }

    fn end_write_batch(&mut self) -> Result<(), DatabaseError> {
        Ok(())
    }

    fn store_metadata(&mut self) -> Result<(), DatabaseError> {
        Ok(())
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn clone_backend(&self) -> Result<Box<dyn Backend>, DatabaseError> {
        let copy = self
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(Box::new(BTreeBackend {
            map: Arc::new(RwLock::new(copy)),
            metadata: self.metadata.clone(),
        }))
    }
}

struct BTreeCursor {
    map: DataMap,
    /// The key under the cursor; `None` is the end sentinel.
    position: Option<Vec<u8>>,
}

impl Cursor for BTreeCursor {
    fn key(&self) -> Result<&[u8], DatabaseError> {
        self.position
            .as_deref()
            .ok_or(DatabaseError::OutOfRange)
    }

    fn value(&self) -> Result<Vec<u8>, DatabaseError> {
        let key = self.position.as_ref().ok_or(DatabaseError::OutOfRange)?;
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| {
                DatabaseError::InternalError("cursor entry no longer exists".into())
            })
    }

    fn next(&mut self) -> Result<(), DatabaseError> {
        let key = self.position.take().ok_or(DatabaseError::OutOfRange)?;
        self.position = self
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(k, _)| k.clone());
        Ok(())
    }

    fn prev(&mut self) -> Result<(), DatabaseError> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        let previous = match &self.position {
            Some(key) => map
                .range((Unbounded, Excluded(key.clone())))
                .next_back()
                .map(|(k, _)| k.clone()),
            None => map.keys().next_back().cloned(),
        };
        match previous {
            Some(key) => {
                self.position = Some(key);
                Ok(())
            }
            None => Err(DatabaseError::OutOfRange),
        }
    }

    fn is_end(&self) -> bool {
        self.position.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk the backend forwards and backwards with begin/end/find/
    /// lower_bound, mirroring the expectations of an ordered map.
    #[test]
    fn cursor_navigation() {
        let mut backend = BTreeBackend::new();

        let itr = backend.begin().unwrap();
        assert!(itr.is_end());

        backend.put(b"foo", b"bar").unwrap();
        let itr = backend.begin().unwrap();
        assert!(!itr.is_end());
        assert_eq!(itr.value().unwrap(), b"bar");

        backend.put(b"alice", b"bob").unwrap();

        let mut itr = backend.begin().unwrap();
        assert_eq!(itr.key().unwrap(), b"alice");
        assert_eq!(itr.value().unwrap(), b"bob");

        itr.next().unwrap();
        assert_eq!(itr.value().unwrap(), b"bar");

        itr.next().unwrap();
        assert!(itr.is_end());
        assert!(itr.next().is_err());

        itr.prev().unwrap();
        assert_eq!(itr.value().unwrap(), b"bar");

        let itr = backend.lower_bound(b"charlie").unwrap();
        assert_eq!(itr.value().unwrap(), b"bar");

        let itr = backend.lower_bound(b"foo").unwrap();
        assert_eq!(itr.value().unwrap(), b"bar");

        backend.put(b"foo", b"blob").unwrap();
        let mut itr = backend.find(b"foo").unwrap();
        assert_eq!(itr.value().unwrap(), b"blob");

        itr.prev().unwrap();
        assert_eq!(itr.value().unwrap(), b"bob");
        assert!(itr.prev().is_err());

        backend.erase(b"foo").unwrap();
        let itr = backend.begin().unwrap();
        assert_eq!(itr.value().unwrap(), b"bob");

        let itr = backend.find(b"foo").unwrap();
        assert!(itr.is_end());

        // erasing an absent key is a no-op
        backend.erase(b"foo").unwrap();

        backend.erase(b"alice").unwrap();
        assert!(backend.is_empty().unwrap());
    }

    #[test]
    fn clone_is_independent() {
        let mut backend = BTreeBackend::new();
        backend.put(b"a", b"1").unwrap();
        backend.metadata_mut().revision = 4;

        let mut copy = backend.clone_backend().unwrap();
        assert_eq!(copy.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(copy.metadata().revision, 4);

        copy.put(b"b", b"2").unwrap();
        copy.erase(b"a").unwrap();

        assert_eq!(backend.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get(b"b").unwrap(), None);
    }

    #[test]
    fn clear_resets_metadata() {
        let mut backend = BTreeBackend::new();
        backend.put(b"a", b"1").unwrap();
        backend.metadata_mut().revision = 7;
        backend.metadata_mut().id = [1; 32];

        backend.clear().unwrap();

        assert!(backend.is_empty().unwrap());
        assert_eq!(backend.metadata(), &Metadata::default());
    }
}
