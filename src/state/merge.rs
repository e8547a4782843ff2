/*
 * Copyright 2018 Intel Corporation
 * Copyright 2022 Bitwise IO, Inc.
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
 * ------------------------------------------------------------------------------
 */

//! Ordered iteration over a delta chain's effective contents.
//!
//! A [MergeIterator] walks one cursor per ancestor of a leaf delta
//! simultaneously, presenting the chain as a single flat, key-ordered map
//! without materializing it. At each position the smallest key among the
//! cursors is considered: the delta nearest the leaf that locally holds the
//! key supplies the value, unless a still-nearer delta tombstones it, in
//! which case the key is skipped entirely.
//!
//! Iteration is bidirectional. With `n` ancestors each step costs `O(n)`
//! cursor comparisons plus the per-backend seek; callers keep chains short
//! by squashing anonymous deltas promptly.

use std::sync::Arc;

use crate::database::error::DatabaseError;
use crate::database::Cursor;
use crate::state::delta::StateDelta;
use crate::state::error::StateDatabaseError;

/// The effective key-ordered view over a leaf delta and its ancestors.
///
/// Holds a shared handle to the leaf, keeping the whole ancestor chain
/// alive for as long as iterators are outstanding.
pub struct MergeState {
    leaf: Arc<StateDelta>,
}

impl MergeState {
    pub fn new(leaf: Arc<StateDelta>) -> Self {
        MergeState { leaf }
    }

    /// An iterator on the first effective entry.
    pub fn begin(&self) -> Result<MergeIterator, StateDatabaseError> {
        let mut itr = self.make_iterator(|delta| delta.cursor_begin())?;
        itr.resolve_forward()?;
        Ok(itr)
    }

    /// An iterator on the end sentinel.
    pub fn end(&self) -> Result<MergeIterator, StateDatabaseError> {
        self.make_iterator(|delta| delta.cursor_end())
    }

    /// An iterator on exactly the given key, or on end if the key is not
    /// visible in the effective view.
    pub fn find(&self, key: &[u8]) -> Result<MergeIterator, StateDatabaseError> {
        let mut itr = self.make_iterator(|delta| delta.cursor_find(key))?;
        if !itr.is_visible(key)? {
            for entry in &mut itr.cursors {
                entry.cursor = entry.delta.cursor_end()?;
            }
            itr.current = None;
        } else {
            itr.current = Some(key.to_vec());
        }
        Ok(itr)
    }

    /// An iterator on the first effective entry with key >= the given key.
    pub fn lower_bound(&self, key: &[u8]) -> Result<MergeIterator, StateDatabaseError> {
        let mut itr = self.make_iterator(|delta| delta.cursor_lower_bound(key))?;
        itr.resolve_forward()?;
        Ok(itr)
    }

    fn make_iterator<F>(&self, position: F) -> Result<MergeIterator, StateDatabaseError>
    where
        F: Fn(&StateDelta) -> Result<Box<dyn Cursor>, StateDatabaseError>,
    {
        let mut cursors = Vec::new();
        let mut node = Some(Arc::clone(&self.leaf));
        while let Some(delta) = node {
            let cursor = position(&delta)?;
            node = delta.parent();
            cursors.push(DeltaCursor { delta, cursor });
        }
        Ok(MergeIterator {
            cursors,
            current: None,
        })
    }
}

struct DeltaCursor {
    delta: Arc<StateDelta>,
    cursor: Box<dyn Cursor>,
}

/// A bidirectional cursor over the merged view; see the module
/// documentation for the selection rules.
pub struct MergeIterator {
    /// One cursor per ancestor, leaf first. Forward movement maintains the
    /// invariant that every cursor sits on its backend's first key at or
    /// beyond the current position.
    cursors: Vec<DeltaCursor>,
    /// The current effective key; `None` is the end sentinel.
    current: Option<Vec<u8>>,
}

impl MergeIterator {
    /// The key under the iterator; fails with `OutOfRange` at end.
    pub fn key(&self) -> Result<&[u8], StateDatabaseError> {
        self.current
            .as_deref()
            .ok_or(StateDatabaseError::OutOfRange)
    }

    /// The value under the iterator, supplied by the delta nearest the leaf
    /// that holds the key; fails with `OutOfRange` at end.
    pub fn value(&self) -> Result<Vec<u8>, StateDatabaseError> {
        let key = self.key()?.to_vec();
        for entry in &self.cursors {
            if let Some(value) = entry.delta.get_local(&key)? {
                return Ok(value);
            }
        }
        Err(StateDatabaseError::InternalError(
            "merge iterator is positioned on a key no delta holds".into(),
        ))
    }

    pub fn is_end(&self) -> bool {
        self.current.is_none()
    }

    /// Moves past the current key to the next visible one; fails with
    /// `OutOfRange` when already at end.
    pub fn next(&mut self) -> Result<(), StateDatabaseError> {
        let current = self
            .current
            .take()
            .ok_or(StateDatabaseError::OutOfRange)?;
        self.advance_cursors_at(&current)?;
        self.resolve_forward()
    }

    /// Moves to the previous visible key; from end this yields the last
    /// entry. Fails with `OutOfRange` when no earlier entry exists, leaving
    /// the position unchanged.
    pub fn prev(&mut self) -> Result<(), StateDatabaseError> {
        let bound = self.current.clone();

        let mut candidates: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.cursors.len());
        for entry in &self.cursors {
            candidates.push(greatest_key_below(&entry.delta, bound.as_deref())?);
        }

        loop {
            let best = match candidates.iter().flatten().max() {
                Some(best) => best.clone(),
                None => return Err(StateDatabaseError::OutOfRange),
            };

            if self.is_visible(&best)? {
                // re-seek every cursor so forward movement stays valid
                for entry in &mut self.cursors {
                    entry.cursor = entry.delta.cursor_lower_bound(&best)?;
                }
                self.current = Some(best);
                return Ok(());
            }

            for (index, candidate) in candidates.iter_mut().enumerate() {
                if candidate.as_deref() == Some(best.as_slice()) {
                    *candidate = greatest_key_below(&self.cursors[index].delta, Some(&best))?;
                }
            }
        }
    }

    /// Settles on the smallest visible key at or beyond the cursors'
    /// current positions, or on end.
    fn resolve_forward(&mut self) -> Result<(), StateDatabaseError> {
        loop {
            let mut smallest: Option<Vec<u8>> = None;
            for entry in &self.cursors {
                if entry.cursor.is_end() {
                    continue;
                }
                let key = entry.cursor.key().map_err(StateDatabaseError::from)?;
                if smallest.as_deref().map(|s| key < s).unwrap_or(true) {
                    smallest = Some(key.to_vec());
                }
            }

            let key = match smallest {
                Some(key) => key,
                None => {
                    self.current = None;
                    return Ok(());
                }
            };

            if self.is_visible(&key)? {
                self.current = Some(key);
                return Ok(());
            }
            self.advance_cursors_at(&key)?;
        }
    }

    /// Whether the key survives shadowing: the delta nearest the leaf that
    /// either writes or tombstones the key decides.
    fn is_visible(&self, key: &[u8]) -> Result<bool, StateDatabaseError> {
        for entry in &self.cursors {
            if entry.delta.get_local(key)?.is_some() {
                return Ok(true);
            }
            if entry.delta.is_removed(key) {
                return Ok(false);
            }
        }
        Ok(false)
    }

    fn advance_cursors_at(&mut self, key: &[u8]) -> Result<(), StateDatabaseError> {
        for entry in &mut self.cursors {
            if !entry.cursor.is_end()
                && entry.cursor.key().map_err(StateDatabaseError::from)? == key
            {
                entry.cursor.next().map_err(StateDatabaseError::from)?;
            }
        }
        Ok(())
    }
}

/// The greatest key in the delta's own backend strictly below `bound`, or
/// the greatest key overall when `bound` is `None`.
fn greatest_key_below(
    delta: &StateDelta,
    bound: Option<&[u8]>,
) -> Result<Option<Vec<u8>>, StateDatabaseError> {
    let mut cursor = match bound {
        Some(bound) => delta.cursor_lower_bound(bound)?,
        None => delta.cursor_end()?,
    };
    match cursor.prev() {
        Ok(()) => Ok(Some(cursor.key().map_err(StateDatabaseError::from)?.to_vec())),
        Err(DatabaseError::OutOfRange) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::state::{BlockHeader, NodeId};

    fn id(n: u8) -> NodeId {
        NodeId::hash(&[n])
    }

    fn expect_forward(
        m_state: &MergeState,
        expected: &[(&[u8], &[u8])],
    ) {
        let mut itr = m_state.begin().unwrap();
        for (key, value) in expected {
            assert!(!itr.is_end());
            assert_eq!(itr.key().unwrap(), *key);
            assert_eq!(itr.value().unwrap(), value.to_vec());
            itr.next().unwrap();
        }
        assert!(itr.is_end());
        assert!(itr.key().is_err());
        assert!(itr.value().is_err());
        assert!(itr.next().is_err());

        // walk back down from end
        for (key, value) in expected.iter().rev() {
            itr.prev().unwrap();
            assert_eq!(itr.key().unwrap(), *key);
            assert_eq!(itr.value().unwrap(), value.to_vec());
        }
        assert!(itr.prev().is_err());
    }

    /// The simple three-key chain: overwrites, a removal, and a
    /// reinstatement, checked after each generation.
    #[test]
    fn layered_overwrites_and_removals() {
        let root = StateDelta::new_root(None).unwrap();
        root.put(b"alice", b"1").unwrap();
        root.put(b"bob", b"2").unwrap();
        root.put(b"charlie", b"3").unwrap();

        expect_forward(
            &MergeState::new(Arc::clone(&root)),
            &[(b"alice", b"1"), (b"bob", b"2"), (b"charlie", b"3")],
        );

        let gen_2 = root.make_child(id(2), BlockHeader::default()).unwrap();
        gen_2.put(b"alice", b"4").unwrap();
        gen_2.put(b"bob", b"5").unwrap();

        expect_forward(
            &MergeState::new(Arc::clone(&gen_2)),
            &[(b"alice", b"4"), (b"bob", b"5"), (b"charlie", b"3")],
        );

        let gen_3 = gen_2.make_child(id(3), BlockHeader::default()).unwrap();
        gen_3.put(b"bob", b"6").unwrap();

        expect_forward(
            &MergeState::new(Arc::clone(&gen_3)),
            &[(b"alice", b"4"), (b"bob", b"6"), (b"charlie", b"3")],
        );

        let gen_4 = gen_3.make_child(id(4), BlockHeader::default()).unwrap();
        gen_4.erase(b"alice").unwrap();

        expect_forward(
            &MergeState::new(Arc::clone(&gen_4)),
            &[(b"bob", b"6"), (b"charlie", b"3")],
        );

        let gen_5 = gen_4.make_child(id(5), BlockHeader::default()).unwrap();
        gen_5.put(b"alice", b"4").unwrap();

        expect_forward(
            &MergeState::new(Arc::clone(&gen_5)),
            &[(b"alice", b"4"), (b"bob", b"6"), (b"charlie", b"3")],
        );
    }

    #[test]
    fn find_respects_shadowing() {
        let root = StateDelta::new_root(None).unwrap();
        root.put(b"a", b"1").unwrap();
        root.put(b"b", b"2").unwrap();

        let child = root.make_child(id(1), BlockHeader::default()).unwrap();
        child.erase(b"a").unwrap();
        child.put(b"b", b"20").unwrap();

        let m_state = MergeState::new(child);

        let itr = m_state.find(b"a").unwrap();
        assert!(itr.is_end());

        let itr = m_state.find(b"b").unwrap();
        assert_eq!(itr.key().unwrap(), b"b");
        assert_eq!(itr.value().unwrap(), b"20".to_vec());

        let itr = m_state.find(b"c").unwrap();
        assert!(itr.is_end());
    }

    #[test]
    fn lower_bound_skips_shadowed_keys() {
        let root = StateDelta::new_root(None).unwrap();
        root.put(b"a", b"1").unwrap();
        root.put(b"b", b"2").unwrap();
        root.put(b"c", b"3").unwrap();

        let child = root.make_child(id(1), BlockHeader::default()).unwrap();
        child.erase(b"b").unwrap();

        let m_state = MergeState::new(child);

        let itr = m_state.lower_bound(b"b").unwrap();
        assert_eq!(itr.key().unwrap(), b"c");

        let itr = m_state.lower_bound(b"z").unwrap();
        assert!(itr.is_end());
    }

    /// A merge iterator over a chain whose middle has been committed keeps
    /// working: commit re-parents the chain, not the view.
    #[test]
    fn survives_interior_commit() {
        let root = StateDelta::new_root(None).unwrap();
        root.put(b"alice", b"1").unwrap();

        let gen_2 = root.make_child(id(2), BlockHeader::default()).unwrap();
        gen_2.put(b"bob", b"2").unwrap();

        let gen_3 = gen_2.make_child(id(3), BlockHeader::default()).unwrap();
        gen_3.put(b"charlie", b"3").unwrap();

        gen_2.commit().unwrap();

        expect_forward(
            &MergeState::new(gen_3),
            &[(b"alice", b"1"), (b"bob", b"2"), (b"charlie", b"3")],
        );
    }
}
