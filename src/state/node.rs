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

//! The typed facade over a state delta.
//!
//! A [StateNode] addresses entries by `(object_space, key)`, encoding the
//! pair into the canonical backend key, and enforces the
//! writable-to-finalized state machine at the API boundary: writes against
//! a finalized node fail, and the merkle root is only defined once a node
//! has been finalized.

use std::sync::Arc;
use std::time::Duration;

use crate::state::delta::StateDelta;
use crate::state::error::StateDatabaseError;
use crate::state::merge::MergeState;
use crate::state::{
    decode_object_key, encode_object_key, BlockHeader, NodeId, ObjectSpace, StateDeltaEntry,
};

/// A handle to one state node of the version tree.
#[derive(Clone)]
pub struct StateNode {
    delta: Arc<StateDelta>,
}

impl StateNode {
    pub(crate) fn new(delta: Arc<StateDelta>) -> Self {
        StateNode { delta }
    }

    pub(crate) fn delta(&self) -> &Arc<StateDelta> {
        &self.delta
    }

    pub fn id(&self) -> NodeId {
        self.delta.id()
    }

    pub fn revision(&self) -> u64 {
        self.delta.revision()
    }

    /// The parent's id, or the zero sentinel for the root.
    pub fn parent_id(&self) -> NodeId {
        self.delta.parent_id()
    }

    pub fn block_header(&self) -> Result<BlockHeader, StateDatabaseError> {
        self.delta.block_header()
    }

    pub fn is_finalized(&self) -> bool {
        self.delta.is_finalized()
    }

    /// Blocks until the node is finalized or the timeout elapses, returning
    /// whether it is finalized.
    pub fn wait_finalized(&self, timeout: Duration) -> bool {
        self.delta.wait_finalized(timeout)
    }

    /// The node has no contents of its own and none inherited.
    pub fn is_empty(&self) -> Result<bool, StateDatabaseError> {
        self.delta.is_empty()
    }

    /// Returns the value stored for `(space, key)`, if any.
    pub fn get_object(
        &self,
        space: &ObjectSpace,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StateDatabaseError> {
        self.delta.find(&encode_object_key(space, key))
    }

    /// Writes an object and returns the net change in stored bytes: the
    /// full encoded size for a fresh key, or the value growth (possibly
    /// negative) for an overwrite.
    pub fn put_object(
        &self,
        space: &ObjectSpace,
        key: &[u8],
        value: &[u8],
    ) -> Result<i64, StateDatabaseError> {
        if self.is_finalized() {
            return Err(StateDatabaseError::NodeFinalized);
        }

        let encoded = encode_object_key(space, key);
        let previous = self.delta.find(&encoded)?;
        self.delta.put(&encoded, value)?;

        Ok(match previous {
            Some(old) => value.len() as i64 - old.len() as i64,
            None => (encoded.len() + value.len()) as i64,
        })
    }

    /// Removes an object from the node's view; absent keys are a no-op.
    pub fn remove_object(
        &self,
        space: &ObjectSpace,
        key: &[u8],
    ) -> Result<(), StateDatabaseError> {
        if self.is_finalized() {
            return Err(StateDatabaseError::NodeFinalized);
        }
        self.delta.erase(&encode_object_key(space, key))
    }

    /// The first object of `space` with a key strictly greater than `key`,
    /// as `(key, value)`, or `None` when the space is exhausted.
    pub fn get_next_object(
        &self,
        space: &ObjectSpace,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StateDatabaseError> {
        let encoded = encode_object_key(space, key);
        let m_state = MergeState::new(Arc::clone(&self.delta));

        let mut itr = m_state.lower_bound(&encoded)?;
        if !itr.is_end() && itr.key()? == encoded.as_slice() {
            itr.next()?;
        }
        if itr.is_end() {
            return Ok(None);
        }

        let (entry_space, entry_key) = decode_object_key(itr.key()?)?;
        if entry_space != *space {
            return Ok(None);
        }
        Ok(Some((entry_key, itr.value()?)))
    }

    /// The last object of `space` with a key strictly less than `key`,
    /// as `(key, value)`, or `None`.
    pub fn get_prev_object(
        &self,
        space: &ObjectSpace,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StateDatabaseError> {
        let encoded = encode_object_key(space, key);
        let m_state = MergeState::new(Arc::clone(&self.delta));

        let mut itr = m_state.lower_bound(&encoded)?;
        match itr.prev() {
            Ok(()) => {}
            Err(StateDatabaseError::OutOfRange) => return Ok(None),
            Err(err) => return Err(err),
        }

        let (entry_space, entry_key) = decode_object_key(itr.key()?)?;
        if entry_space != *space {
            return Ok(None);
        }
        Ok(Some((entry_key, itr.value()?)))
    }

    /// The changes this node carries relative to its parent, sorted by
    /// encoded key; a tombstone carries no value.
    pub fn get_delta_entries(&self) -> Result<Vec<StateDeltaEntry>, StateDatabaseError> {
        let mut entries = Vec::new();
        for encoded in self.delta.delta_keys()? {
            // keys that do not parse as object keys are not reportable
            let (object_space, key) = match decode_object_key(&encoded) {
                Ok(decoded) => decoded,
                Err(_) => continue,
            };
            entries.push(StateDeltaEntry {
                object_space,
                key,
                value: self.delta.get_local(&encoded)?,
            });
        }
        Ok(entries)
    }

    /// The merkle root over this node's changes. Only defined once the node
    /// has been finalized.
    pub fn merkle_root(&self) -> Result<[u8; 32], StateDatabaseError> {
        if !self.is_finalized() {
            return Err(StateDatabaseError::IllegalArgument(
                "the merkle root of a node is only defined once it is finalized".into(),
            ));
        }
        self.delta.merkle_root()
    }

    /// Creates a transaction-scoped child for speculative writes. The child
    /// shares this node's id and revision and publishes its effects with
    /// [AnonymousStateNode::commit], which squashes rather than commits.
    pub fn create_anonymous_node(&self) -> Result<AnonymousStateNode, StateDatabaseError> {
        if self.is_finalized() {
            return Err(StateDatabaseError::NodeFinalized);
        }
        Ok(AnonymousStateNode {
            node: StateNode::new(self.delta.make_anonymous_child()?),
            parent_id: self.parent_id(),
        })
    }
}

/// An ephemeral state node scoped to a transaction attempt.
///
/// The wrapped delta is an ordinary child of the enclosing node's delta,
/// but it reports the enclosing node's identity: same id, same revision,
/// same parent id. Dropping the node abandons its writes.
pub struct AnonymousStateNode {
    node: StateNode,
    parent_id: NodeId,
}

impl AnonymousStateNode {
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn revision(&self) -> u64 {
        self.node.revision()
    }

    pub fn parent_id(&self) -> NodeId {
        self.parent_id
    }

    pub fn get_object(
        &self,
        space: &ObjectSpace,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StateDatabaseError> {
        self.node.get_object(space, key)
    }

    pub fn put_object(
        &self,
        space: &ObjectSpace,
        key: &[u8],
        value: &[u8],
    ) -> Result<i64, StateDatabaseError> {
        self.node.put_object(space, key, value)
    }

    pub fn remove_object(
        &self,
        space: &ObjectSpace,
        key: &[u8],
    ) -> Result<(), StateDatabaseError> {
        self.node.remove_object(space, key)
    }

    pub fn get_next_object(
        &self,
        space: &ObjectSpace,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StateDatabaseError> {
        self.node.get_next_object(space, key)
    }

    pub fn get_prev_object(
        &self,
        space: &ObjectSpace,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StateDatabaseError> {
        self.node.get_prev_object(space, key)
    }

    /// Publishes this node's writes into the enclosing node by squashing
    /// the underlying delta, leaving this node empty for reuse.
    pub fn commit(&self) -> Result<(), StateDatabaseError> {
        self.node.delta().squash()
    }
}
