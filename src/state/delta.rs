/*
 * Copyright 2018 Bitwise IO, Inc.
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

//! One node of the state version tree.
//!
//! A delta owns a backend holding only the writes made against it, a set of
//! tombstoned keys, and a shared handle to its parent. A lookup consults the
//! delta's own writes, then its tombstones, then the parent chain, so a leaf
//! delta behaves as a complete snapshot while storing one block's changes.
//!
//! The root delta owns the durable backend. `commit` flattens a delta's
//! ancestor chain into that backend inside one atomic write batch and
//! re-parents the delta as the new root; `squash` folds an anonymous delta's
//! changes into its parent instead.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::database::btree::BTreeBackend;
use crate::database::rocksdb::RocksDbBackend;
use crate::database::{Backend, Cursor};
use crate::state::error::StateDatabaseError;
use crate::state::merkle;
use crate::state::{BlockHeader, NodeId};

pub struct StateDelta {
    id: NodeId,
    revision: u64,
    parent: RwLock<Option<Arc<StateDelta>>>,
    /// The delta's own writes. Taken out of the old root during a commit;
    /// any later operation against the detached delta fails.
    backend: RwLock<Option<Box<dyn Backend>>>,
    /// Keys deleted on this delta that are still visible through an
    /// ancestor.
    removed: RwLock<HashSet<Vec<u8>>>,
    merkle_root: Mutex<Option<[u8; 32]>>,
    finalized: Mutex<bool>,
    finalized_cv: Condvar,
}

impl StateDelta {
    /// Opens a root delta over the durable store at `path`, or over a
    /// transient in-memory backend when no path is given. Identity and
    /// revision are restored from the backend's metadata.
    pub fn new_root(
        path: Option<&std::path::Path>,
    ) -> Result<Arc<StateDelta>, StateDatabaseError> {
        let backend: Box<dyn Backend> = match path {
            Some(path) => {
                let mut backend = RocksDbBackend::new();
                backend.open(path)?;
                Box::new(backend)
            }
            None => Box::new(BTreeBackend::new()),
        };
        Ok(Self::root_from_backend(backend))
    }

    /// Wraps an already-initialized backend as a root delta.
    pub(crate) fn root_from_backend(backend: Box<dyn Backend>) -> Arc<StateDelta> {
        let id = NodeId::new(backend.metadata().id);
        let revision = backend.metadata().revision;
        let merkle_root = backend.metadata().merkle_root;

        Arc::new(StateDelta {
            id,
            revision,
            parent: RwLock::new(None),
            merkle_root: Mutex::new(Some(merkle_root)),
            backend: RwLock::new(Some(backend)),
            removed: RwLock::new(HashSet::new()),
            finalized: Mutex::new(false),
            finalized_cv: Condvar::new(),
        })
    }

    /// Creates a writable child delta at `revision + 1`.
    pub fn make_child(
        self: &Arc<Self>,
        id: NodeId,
        header: BlockHeader,
    ) -> Result<Arc<StateDelta>, StateDatabaseError> {
        let mut backend = BTreeBackend::new();
        backend.metadata_mut().id = *id.as_bytes();
        backend.metadata_mut().revision = self.revision + 1;
        backend.metadata_mut().block_header = header.to_bytes()?;

        Ok(Arc::new(StateDelta {
            id,
            revision: self.revision + 1,
            parent: RwLock::new(Some(Arc::clone(self))),
            backend: RwLock::new(Some(Box::new(backend))),
            removed: RwLock::new(HashSet::new()),
            merkle_root: Mutex::new(None),
            finalized: Mutex::new(false),
            finalized_cv: Condvar::new(),
        }))
    }

    /// Creates a transaction-scoped child sharing this delta's id and
    /// revision. Anonymous deltas are squashed into their parent rather
    /// than committed.
    pub fn make_anonymous_child(
        self: &Arc<Self>,
    ) -> Result<Arc<StateDelta>, StateDatabaseError> {
        let mut backend = BTreeBackend::new();
        backend.metadata_mut().id = *self.id.as_bytes();
        backend.metadata_mut().revision = self.revision;
        backend.metadata_mut().block_header = self.header_bytes()?;

        Ok(Arc::new(StateDelta {
            id: self.id,
            revision: self.revision,
            parent: RwLock::new(Some(Arc::clone(self))),
            backend: RwLock::new(Some(Box::new(backend))),
            removed: RwLock::new(HashSet::new()),
            merkle_root: Mutex::new(None),
            finalized: Mutex::new(false),
            finalized_cv: Condvar::new(),
        }))
    }

    /// Creates an independent sibling with the given identity: same parent,
    /// same revision, and a deep copy of this delta's writes and tombstones.
    pub fn clone_delta(
        &self,
        id: NodeId,
        header: BlockHeader,
    ) -> Result<Arc<StateDelta>, StateDatabaseError> {
        let mut backend = {
            let guard = self.read_backend()?;
            let backend = guard
                .as_ref()
                .ok_or_else(detached)?;
            backend.clone_backend()?
        };
        backend.metadata_mut().id = *id.as_bytes();
        backend.metadata_mut().block_header = header.to_bytes()?;

        let removed = self
            .removed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let merkle_root = *self
            .merkle_root
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(root) = merkle_root {
            backend.metadata_mut().merkle_root = root;
        }

        Ok(Arc::new(StateDelta {
            id,
            revision: self.revision,
            parent: RwLock::new(self.parent()),
            backend: RwLock::new(Some(backend)),
            removed: RwLock::new(removed),
            merkle_root: Mutex::new(merkle_root),
            finalized: Mutex::new(self.is_finalized()),
            finalized_cv: Condvar::new(),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn parent(&self) -> Option<Arc<StateDelta>> {
        self.parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The parent's id, or the zero sentinel for the root.
    pub fn parent_id(&self) -> NodeId {
        self.parent().map(|p| p.id()).unwrap_or_else(NodeId::zero)
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// The root of this delta's ancestor chain, or `None` when called on
    /// the root itself.
    pub fn get_root(self: &Arc<Self>) -> Option<Arc<StateDelta>> {
        let mut node = self.parent()?;
        while let Some(parent) = node.parent() {
            node = parent;
        }
        Some(node)
    }

    pub fn block_header(&self) -> Result<BlockHeader, StateDatabaseError> {
        BlockHeader::from_bytes(&self.header_bytes()?)
    }

    fn header_bytes(&self) -> Result<Vec<u8>, StateDatabaseError> {
        let guard = self.read_backend()?;
        let backend = guard.as_ref().ok_or_else(detached)?;
        Ok(backend.metadata().block_header.clone())
    }

    /// Writes an entry into this delta, superseding any tombstone for the
    /// key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StateDatabaseError> {
        {
            let mut guard = self.write_backend()?;
            let backend = guard.as_mut().ok_or_else(detached)?;
            backend.put(key, value)?;
        }
        self.removed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    /// Deletes a key from the logical view. The key is tombstoned only if
    /// it remains visible through an ancestor; a key written solely on this
    /// delta is simply dropped.
    pub fn erase(&self, key: &[u8]) -> Result<(), StateDatabaseError> {
        if self.find(key)?.is_none() {
            return Ok(());
        }

        {
            let mut guard = self.write_backend()?;
            let backend = guard.as_mut().ok_or_else(detached)?;
            backend.erase(key)?;
        }

        let in_ancestors = match self.parent() {
            Some(parent) => parent.find(key)?.is_some(),
            None => false,
        };
        if in_ancestors {
            self.removed
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.to_vec());
        }
        Ok(())
    }

    /// Looks up a key through this delta and its ancestors.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateDatabaseError> {
        if let Some(value) = self.get_local(key)? {
            return Ok(Some(value));
        }
        if self.is_removed(key) {
            return Ok(None);
        }

        let mut node = self.parent();
        while let Some(delta) = node {
            if let Some(value) = delta.get_local(key)? {
                return Ok(Some(value));
            }
            if delta.is_removed(key) {
                return Ok(None);
            }
            node = delta.parent();
        }
        Ok(None)
    }

    /// Whether this delta itself writes or tombstones the key.
    pub fn is_modified(&self, key: &[u8]) -> Result<bool, StateDatabaseError> {
        Ok(self.get_local(key)?.is_some() || self.is_removed(key))
    }

    pub(crate) fn is_removed(&self, key: &[u8]) -> bool {
        self.removed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// A value from this delta's own backend, ignoring ancestors.
    pub(crate) fn get_local(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateDatabaseError> {
        let guard = self.read_backend()?;
        let backend = guard.as_ref().ok_or_else(detached)?;
        Ok(backend.get(key)?)
    }

    /// The delta is empty if neither it nor any ancestor holds an entry.
    pub fn is_empty(&self) -> Result<bool, StateDatabaseError> {
        let local_empty = {
            let guard = self.read_backend()?;
            let backend = guard.as_ref().ok_or_else(detached)?;
            backend.is_empty()?
        };
        if !local_empty {
            return Ok(false);
        }
        match self.parent() {
            Some(parent) => parent.is_empty(),
            None => Ok(true),
        }
    }

    /// Folds this delta's writes and tombstones into its parent, leaving
    /// this delta empty. A no-op on the root.
    ///
    /// Tombstones erase in the parent and, unless the parent is the root,
    /// tombstone there as well; writes land in the parent and clear any
    /// matching parent tombstone. The cost is proportional to this delta's
    /// change set, which is why only small anonymous deltas squash.
    pub fn squash(&self) -> Result<(), StateDatabaseError> {
        let parent = match self.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        };
        let parent_is_root = parent.is_root();

        let removed: Vec<Vec<u8>> = self
            .removed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for key in &removed {
            {
                let mut guard = parent.write_backend()?;
                let backend = guard.as_mut().ok_or_else(detached)?;
                backend.erase(key)?;
            }
            if !parent_is_root {
                parent
                    .removed
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.clone());
            }
        }

        let entries = self.local_entries()?;
        for (key, value) in &entries {
            {
                let mut guard = parent.write_backend()?;
                let backend = guard.as_mut().ok_or_else(detached)?;
                backend.put(key, value)?;
            }
            if !parent_is_root {
                parent
                    .removed
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(key);
            }
        }

        let mut guard = self.write_backend()?;
        let backend = guard.as_mut().ok_or_else(detached)?;
        for (key, _) in &entries {
            backend.erase(key)?;
        }
        Ok(())
    }

    /// Collapses the ancestor chain into the old root's durable backend in
    /// one atomic write batch, making this delta the new root.
    ///
    /// The chain is first walked up to the root, which surrenders its
    /// backend; the stack is then unwound oldest first, applying each
    /// delta's tombstones and writes. The metadata of this delta is stored
    /// within the same batch, so observers see either the old root or the
    /// new one, never a partial merge.
    pub fn commit(self: &Arc<Self>) -> Result<(), StateDatabaseError> {
        if self.is_root() {
            return Err(StateDatabaseError::InternalError(
                "cannot commit the root delta".into(),
            ));
        }

        let mut stack = vec![Arc::clone(self)];
        while let Some(parent) = stack.last().and_then(|node| node.parent()) {
            stack.push(parent);
        }

        // the stack holds at least self and the root
        let root = stack.pop().ok_or_else(|| {
            StateDatabaseError::InternalError("commit stack cannot be empty".into())
        })?;
        let mut backend = root
            .write_backend()?
            .take()
            .ok_or_else(detached)?;

        let header = self.header_bytes()?;
        let merkle_root = self.merkle_root()?;

        backend.start_write_batch()?;

        while let Some(node) = stack.pop() {
            let mut removed: Vec<Vec<u8>> = node
                .removed
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect();
            removed.sort();
            for key in removed {
                backend.erase(&key)?;
            }

            for (key, value) in node.local_entries()? {
                backend.put(&key, &value)?;
            }
        }

        backend.metadata_mut().revision = self.revision;
        backend.metadata_mut().id = *self.id.as_bytes();
        backend.metadata_mut().merkle_root = merkle_root;
        backend.metadata_mut().block_header = header;
        backend.store_metadata()?;

        backend.end_write_batch()?;

        *self.backend.write().unwrap_or_else(PoisonError::into_inner) = Some(backend);
        self.removed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    /// The merkle root over this delta's changes, computed once and cached.
    ///
    /// Leaves are the digests of each changed key and of its value, sorted
    /// by key; a tombstone contributes an empty value leaf.
    pub fn merkle_root(&self) -> Result<[u8; 32], StateDatabaseError> {
        let mut cached = self
            .merkle_root
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(root) = *cached {
            return Ok(root);
        }

        let keys = self.delta_keys()?;
        let mut leaves = Vec::with_capacity(keys.len() * 2);
        for key in keys {
            leaves.push(merkle::hash_leaf(&key));
            let value = self.get_local(&key)?.unwrap_or_default();
            leaves.push(merkle::hash_leaf(&value));
        }

        let root = merkle::merkle_root(leaves);
        *cached = Some(root);
        Ok(root)
    }

    /// The sorted union of this delta's written and tombstoned keys.
    pub(crate) fn delta_keys(&self) -> Result<Vec<Vec<u8>>, StateDatabaseError> {
        let mut keys: Vec<Vec<u8>> =
            self.local_entries()?.into_iter().map(|(k, _)| k).collect();
        keys.extend(
            self.removed
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        keys.sort();
        Ok(keys)
    }

    fn local_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateDatabaseError> {
        let guard = self.read_backend()?;
        let backend = guard.as_ref().ok_or_else(detached)?;

        let mut entries = Vec::new();
        let mut cursor = backend.begin()?;
        while !cursor.is_end() {
            entries.push((cursor.key()?.to_vec(), cursor.value()?));
            cursor.next()?;
        }
        Ok(entries)
    }

    pub fn is_finalized(&self) -> bool {
        *self
            .finalized
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Seals the delta and wakes every thread waiting on finalization.
    pub fn finalize(&self) {
        let mut finalized = self
            .finalized
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *finalized = true;
        self.finalized_cv.notify_all();
    }

    /// Blocks until the delta is finalized or the timeout elapses,
    /// returning whether it is finalized. Tolerates spurious wakeups.
    pub fn wait_finalized(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut finalized = self
            .finalized
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*finalized {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .finalized_cv
                .wait_timeout(finalized, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            finalized = guard;
        }
        true
    }

    pub(crate) fn cursor_begin(&self) -> Result<Box<dyn Cursor>, StateDatabaseError> {
        let guard = self.read_backend()?;
        let backend = guard.as_ref().ok_or_else(detached)?;
        Ok(backend.begin()?)
    }

    pub(crate) fn cursor_end(&self) -> Result<Box<dyn Cursor>, StateDatabaseError> {
        let guard = self.read_backend()?;
        let backend = guard.as_ref().ok_or_else(detached)?;
        Ok(backend.end()?)
    }

    pub(crate) fn cursor_find(&self, key: &[u8]) -> Result<Box<dyn Cursor>, StateDatabaseError> {
        let guard = self.read_backend()?;
        let backend = guard.as_ref().ok_or_else(detached)?;
        Ok(backend.find(key)?)
    }

    pub(crate) fn cursor_lower_bound(
        &self,
        key: &[u8],
    ) -> Result<Box<dyn Cursor>, StateDatabaseError> {
        let guard = self.read_backend()?;
        let backend = guard.as_ref().ok_or_else(detached)?;
        Ok(backend.lower_bound(key)?)
    }

    /// Surrenders the backend, leaving the delta detached.
    pub(crate) fn take_backend(&self) -> Result<Box<dyn Backend>, StateDatabaseError> {
        self.write_backend()?.take().ok_or_else(detached)
    }

    fn read_backend(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<Option<Box<dyn Backend>>>, StateDatabaseError> {
        Ok(self.backend.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write_backend(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<Option<Box<dyn Backend>>>, StateDatabaseError> {
        Ok(self.backend.write().unwrap_or_else(PoisonError::into_inner))
    }
}

fn detached() -> StateDatabaseError {
    StateDatabaseError::InternalError(
        "the delta's backend has been moved by a commit".into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> NodeId {
        NodeId::hash(&[n])
    }

    #[test]
    fn find_resolves_through_ancestors() {
        let root = StateDelta::new_root(None).unwrap();
        root.put(b"a", b"1").unwrap();
        root.put(b"b", b"2").unwrap();

        let child = root.make_child(id(1), BlockHeader::default()).unwrap();
        assert_eq!(child.revision(), 1);
        assert_eq!(child.parent_id(), root.id());

        child.put(b"a", b"10").unwrap();

        assert_eq!(child.find(b"a").unwrap(), Some(b"10".to_vec()));
        assert_eq!(child.find(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(child.find(b"c").unwrap(), None);
        assert_eq!(root.find(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn erase_tombstones_only_inherited_keys() {
        let root = StateDelta::new_root(None).unwrap();
        root.put(b"inherited", b"1").unwrap();

        let child = root.make_child(id(1), BlockHeader::default()).unwrap();
        child.put(b"own", b"2").unwrap();

        // deleting a key that exists only on this delta leaves no tombstone
        child.erase(b"own").unwrap();
        assert!(!child.is_removed(b"own"));
        assert!(!child.is_modified(b"own").unwrap());

        // deleting an inherited key leaves one
        child.erase(b"inherited").unwrap();
        assert!(child.is_removed(b"inherited"));
        assert!(child.is_modified(b"inherited").unwrap());
        assert_eq!(child.find(b"inherited").unwrap(), None);
        assert_eq!(root.find(b"inherited").unwrap(), Some(b"1".to_vec()));

        // erasing an absent key is a no-op
        child.erase(b"missing").unwrap();
        assert!(!child.is_modified(b"missing").unwrap());

        // a write supersedes the tombstone
        child.put(b"inherited", b"3").unwrap();
        assert!(!child.is_removed(b"inherited"));
        assert_eq!(child.find(b"inherited").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn squash_folds_into_parent() {
        let root = StateDelta::new_root(None).unwrap();
        root.put(b"a", b"1").unwrap();
        root.put(b"b", b"2").unwrap();

        let block = root.make_child(id(1), BlockHeader::default()).unwrap();
        block.put(b"c", b"3").unwrap();
        block.erase(b"b").unwrap();

        let txn = block.make_anonymous_child().unwrap();
        assert_eq!(txn.id(), block.id());
        assert_eq!(txn.revision(), block.revision());

        txn.put(b"b", b"20").unwrap();
        txn.put(b"d", b"4").unwrap();
        txn.erase(b"c").unwrap();

        // the parent is untouched until the squash
        assert_eq!(block.find(b"b").unwrap(), None);
        assert_eq!(block.find(b"c").unwrap(), Some(b"3".to_vec()));

        txn.squash().unwrap();

        assert_eq!(block.find(b"b").unwrap(), Some(b"20".to_vec()));
        assert!(!block.is_removed(b"b"));
        assert_eq!(block.find(b"c").unwrap(), None);
        assert_eq!(block.find(b"d").unwrap(), Some(b"4".to_vec()));

        // the anonymous delta is empty afterwards and may be reused
        assert!(txn.delta_keys().unwrap().is_empty());

        // squash on the root is a no-op
        root.squash().unwrap();
        assert_eq!(root.find(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn commit_flattens_the_chain() {
        let root = StateDelta::new_root(None).unwrap();
        root.put(b"a", b"1").unwrap();

        let block_1 = root.make_child(id(1), BlockHeader::default()).unwrap();
        block_1.put(b"b", b"2").unwrap();

        let block_2 = block_1.make_child(id(2), BlockHeader::default()).unwrap();
        block_2.put(b"c", b"3").unwrap();
        block_2.erase(b"a").unwrap();

        assert!(matches!(
            root.commit(),
            Err(StateDatabaseError::InternalError(_))
        ));

        block_2.commit().unwrap();

        assert!(block_2.is_root());
        assert_eq!(block_2.revision(), 2);
        assert_eq!(block_2.id(), id(2));
        assert_eq!(block_2.find(b"a").unwrap(), None);
        assert_eq!(block_2.find(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(block_2.find(b"c").unwrap(), Some(b"3".to_vec()));

        // the old root surrendered its backend
        assert!(root.find(b"a").is_err());
    }

    #[test]
    fn merkle_root_is_cached_and_deterministic() {
        let root = StateDelta::new_root(None).unwrap();
        let make = || {
            let child = root.make_child(id(1), BlockHeader::default()).unwrap();
            child.put(b"a", b"alice").unwrap();
            child.put(b"b", b"bob").unwrap();
            child
        };

        let first = make();
        let second = make();
        assert_eq!(first.merkle_root().unwrap(), second.merkle_root().unwrap());

        let expected = merkle::merkle_root(vec![
            merkle::hash_leaf(b"a"),
            merkle::hash_leaf(b"alice"),
            merkle::hash_leaf(b"b"),
            merkle::hash_leaf(b"bob"),
        ]);
        assert_eq!(first.merkle_root().unwrap(), expected);

        // a tombstone contributes an empty value leaf
        let third = root.make_child(id(3), BlockHeader::default()).unwrap();
        root.put(b"b", b"bob").unwrap();
        third.put(b"a", b"alice").unwrap();
        third.erase(b"b").unwrap();
        let expected = merkle::merkle_root(vec![
            merkle::hash_leaf(b"a"),
            merkle::hash_leaf(b"alice"),
            merkle::hash_leaf(b"b"),
            merkle::hash_leaf(b""),
        ]);
        assert_eq!(third.merkle_root().unwrap(), expected);
    }

    #[test]
    fn finalization_barrier() {
        let root = StateDelta::new_root(None).unwrap();
        let child = root.make_child(id(1), BlockHeader::default()).unwrap();

        assert!(!child.is_finalized());
        assert!(!child.wait_finalized(Duration::from_millis(10)));

        let waiter = Arc::clone(&child);
        let handle = std::thread::spawn(move || waiter.wait_finalized(Duration::from_secs(5)));

        child.finalize();
        assert!(child.is_finalized());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn clone_is_independent() {
        let root = StateDelta::new_root(None).unwrap();
        root.put(b"a", b"1").unwrap();

        let original = root.make_child(id(1), BlockHeader::default()).unwrap();
        original.put(b"b", b"2").unwrap();
        original.erase(b"a").unwrap();

        let copy = original
            .clone_delta(id(2), BlockHeader::default())
            .unwrap();
        assert_eq!(copy.id(), id(2));
        assert_eq!(copy.revision(), original.revision());
        assert_eq!(copy.parent_id(), root.id());
        assert_eq!(copy.find(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(copy.find(b"a").unwrap(), None);

        copy.put(b"c", b"3").unwrap();
        copy.put(b"a", b"4").unwrap();

        assert_eq!(original.find(b"c").unwrap(), None);
        assert_eq!(original.find(b"a").unwrap(), None);
    }

    #[test]
    fn get_root_walks_the_chain() {
        let root = StateDelta::new_root(None).unwrap();
        let block_1 = root.make_child(id(1), BlockHeader::default()).unwrap();
        let block_2 = block_1.make_child(id(2), BlockHeader::default()).unwrap();

        assert!(root.get_root().is_none());
        assert_eq!(block_1.get_root().unwrap().id(), root.id());
        assert_eq!(block_2.get_root().unwrap().id(), root.id());
    }
}
