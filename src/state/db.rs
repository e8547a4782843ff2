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

//! The fork-aware state database.
//!
//! [StateDatabase] owns the version tree: the root delta over durable (or
//! transient) storage, an index of every live node, the set of fork heads,
//! and the fork-choice rule that selects the canonical head among them.
//!
//! # Locking
//!
//! Every public method takes a lock token, so the required mode is proven
//! by the caller in the type system. A [SharedDbLock] admits concurrent
//! readers and writers of individual deltas as well as node bookkeeping
//! (create, finalize, discard, clone), whose shared structures are guarded
//! by internal mutexes. A [UniqueDbLock] is required for operations that
//! replace the root or tear the tree down: `open`, `close`, `reset`, and
//! `commit_node`.
//!
//! Acquiring a unique lock while a shared token is held by the same thread
//! deadlocks, as with any reader-writer lock; callers drop their shared
//! token first.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::state::delta::StateDelta;
use crate::state::error::StateDatabaseError;
use crate::state::node::StateNode;
use crate::state::{BlockHeader, NodeId};

/// The pluggable total order used to pick the canonical head among the
/// fork heads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkResolutionAlgorithm {
    /// The first finalized node at the greatest revision stays head until a
    /// strictly longer fork appears.
    Fifo,
    /// Greater revision wins; among equal revisions the earlier block
    /// timestamp wins.
    BlockTime,
    /// As `BlockTime`, but a signer producing two blocks at the same height
    /// forfeits both: the head rolls back past the offending blocks.
    Pob,
}

struct OpenState {
    root: Arc<StateDelta>,
    head: Mutex<Arc<StateDelta>>,
    index: Mutex<HashMap<NodeId, Arc<StateDelta>>>,
    fork_heads: Mutex<HashMap<NodeId, Arc<StateDelta>>>,
    algorithm: ForkResolutionAlgorithm,
}

#[derive(Default)]
struct Inner {
    open: Option<OpenState>,
}

/// The versioned, fork-aware state database.
pub struct StateDatabase {
    lock: RwLock<Inner>,
}

/// Proof of shared (read) access to the database.
pub struct SharedDbLock<'a> {
    guard: RwLockReadGuard<'a, Inner>,
}

impl<'a> SharedDbLock<'a> {
    fn state(&self) -> Result<&OpenState, StateDatabaseError> {
        self.guard.open.as_ref().ok_or(StateDatabaseError::Closed)
    }
}

/// Proof of exclusive (write) access to the database.
pub struct UniqueDbLock<'a> {
    guard: RwLockWriteGuard<'a, Inner>,
}

impl<'a> UniqueDbLock<'a> {
    fn state(&self) -> Result<&OpenState, StateDatabaseError> {
        self.guard.open.as_ref().ok_or(StateDatabaseError::Closed)
    }

    fn state_mut(&mut self) -> Result<&mut OpenState, StateDatabaseError> {
        self.guard.open.as_mut().ok_or(StateDatabaseError::Closed)
    }
}

impl Default for StateDatabase {
    fn default() -> Self {
        StateDatabase::new()
    }
}

impl StateDatabase {
    /// Constructs a closed database; use [StateDatabase::open] to attach
    /// storage.
    pub fn new() -> Self {
        StateDatabase {
            lock: RwLock::new(Inner::default()),
        }
    }

    pub fn get_shared_lock(&self) -> SharedDbLock {
        SharedDbLock {
            guard: self.lock.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn get_unique_lock(&self) -> UniqueDbLock {
        UniqueDbLock {
            guard: self.lock.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Opens the database over the durable store at `path`, or over a
    /// transient in-memory backend when no path is given.
    ///
    /// If the store is freshly created (zero root id and no contents),
    /// `genesis_init` runs against the still-writable root so the embedder
    /// can seed system state; the root is finalized afterwards either way.
    pub fn open<F>(
        &self,
        path: Option<&Path>,
        genesis_init: F,
        algorithm: ForkResolutionAlgorithm,
        lock: &mut UniqueDbLock,
    ) -> Result<(), StateDatabaseError>
    where
        F: FnOnce(&StateNode) -> Result<(), StateDatabaseError>,
    {
        if lock.guard.open.is_some() {
            return Err(StateDatabaseError::IllegalArgument(
                "the database is already open".into(),
            ));
        }

        let root = StateDelta::new_root(path)?;
        if root.id().is_zero() && root.is_empty()? {
            debug!("seeding genesis state");
            genesis_init(&StateNode::new(Arc::clone(&root)))?;
        }
        root.finalize();

        info!(
            "opened state database with root {} at revision {}",
            root.id(),
            root.revision()
        );

        let mut index = HashMap::new();
        index.insert(root.id(), Arc::clone(&root));
        let mut fork_heads = HashMap::new();
        fork_heads.insert(root.id(), Arc::clone(&root));

        lock.guard.open = Some(OpenState {
            head: Mutex::new(Arc::clone(&root)),
            root,
            index: Mutex::new(index),
            fork_heads: Mutex::new(fork_heads),
            algorithm,
        });
        Ok(())
    }

    /// Closes the database, dropping the node index and the root. All
    /// operations fail until the database is reopened.
    pub fn close(&self, lock: &mut UniqueDbLock) -> Result<(), StateDatabaseError> {
        lock.state()?;
        lock.guard.open = None;
        info!("closed state database");
        Ok(())
    }

    /// Wipes the root backend and reinitializes the database to the
    /// genesis sentinel at revision 0.
    pub fn reset(&self, lock: &mut UniqueDbLock) -> Result<(), StateDatabaseError> {
        let open = lock.state_mut()?;

        let mut backend = open.root.take_backend()?;
        backend.clear()?;

        let root = StateDelta::root_from_backend(backend);
        root.finalize();

        warn!("state database was reset to genesis");

        let mut index = HashMap::new();
        index.insert(root.id(), Arc::clone(&root));
        let mut fork_heads = HashMap::new();
        fork_heads.insert(root.id(), Arc::clone(&root));

        open.root = Arc::clone(&root);
        *lock_mutex(&open.head) = root;
        *lock_mutex(&open.index) = index;
        *lock_mutex(&open.fork_heads) = fork_heads;
        Ok(())
    }

    /// Creates a writable child of the given parent.
    ///
    /// Returns `None` - not an error - when the parent is unknown or not
    /// yet finalized, or when a node with the new id already exists.
    pub fn create_writable_node(
        &self,
        parent_id: &NodeId,
        id: NodeId,
        header: BlockHeader,
        lock: &SharedDbLock,
    ) -> Result<Option<StateNode>, StateDatabaseError> {
        let open = lock.state()?;
        let mut index = lock_mutex(&open.index);

        let parent = match index.get(parent_id) {
            Some(parent) => Arc::clone(parent),
            None => return Ok(None),
        };
        if !parent.is_finalized() || index.contains_key(&id) {
            return Ok(None);
        }

        let child = parent.make_child(id, header)?;
        index.insert(id, Arc::clone(&child));
        debug!("created writable node {} at revision {}", id, child.revision());
        Ok(Some(StateNode::new(child)))
    }

    /// Creates a writable copy of a non-finalized node under a new id.
    pub fn clone_node(
        &self,
        id: &NodeId,
        new_id: NodeId,
        header: BlockHeader,
        lock: &SharedDbLock,
    ) -> Result<StateNode, StateDatabaseError> {
        let open = lock.state()?;
        let mut index = lock_mutex(&open.index);

        let node = index
            .get(id)
            .cloned()
            .ok_or_else(|| unknown_node(id))?;
        if node.is_finalized() {
            return Err(StateDatabaseError::IllegalArgument(
                "a finalized node cannot be cloned".into(),
            ));
        }
        if index.contains_key(&new_id) {
            return Err(StateDatabaseError::IllegalArgument(format!(
                "node {} already exists",
                new_id
            )));
        }

        let clone = node.clone_delta(new_id, header)?;
        index.insert(new_id, Arc::clone(&clone));
        Ok(StateNode::new(clone))
    }

    /// Seals a node, makes it a fork-head candidate, and re-evaluates the
    /// canonical head. Waiters blocked on the node's finalization are woken.
    pub fn finalize_node(
        &self,
        id: &NodeId,
        lock: &SharedDbLock,
    ) -> Result<(), StateDatabaseError> {
        let open = lock.state()?;
        let node = {
            let index = lock_mutex(&open.index);
            index.get(id).cloned().ok_or_else(|| unknown_node(id))?
        };
        if node.is_finalized() {
            return Err(StateDatabaseError::IllegalArgument(format!(
                "node {} is already finalized",
                id
            )));
        }

        node.finalize();
        debug!("finalized node {} at revision {}", id, node.revision());

        let mut fork_heads = lock_mutex(&open.fork_heads);
        fork_heads.remove(&node.parent_id());
        fork_heads.insert(node.id(), Arc::clone(&node));

        let mut head = lock_mutex(&open.head);
        let new_head = resolve_head(open.algorithm, &mut fork_heads, &head, &node)?;
        if new_head.id() != head.id() {
            info!(
                "head moved to {} at revision {}",
                new_head.id(),
                new_head.revision()
            );
        }
        *head = new_head;
        Ok(())
    }

    /// Removes a node and all of its descendants from the database. The
    /// head (or any of its ancestors) cannot be discarded. Outstanding
    /// handles to discarded nodes remain readable until dropped.
    pub fn discard_node(
        &self,
        id: &NodeId,
        lock: &SharedDbLock,
    ) -> Result<(), StateDatabaseError> {
        let open = lock.state()?;
        let mut index = lock_mutex(&open.index);

        let node = index.get(id).cloned().ok_or_else(|| unknown_node(id))?;
        if open.root.id() == *id {
            return Err(StateDatabaseError::IllegalArgument(
                "the root node cannot be discarded".into(),
            ));
        }

        // lock order: index, fork heads, head
        let mut fork_heads = lock_mutex(&open.fork_heads);
        {
            let head = lock_mutex(&open.head);
            if descends_from(&head, &node) {
                return Err(StateDatabaseError::CannotDiscard(format!(
                    "node {} is the head or an ancestor of the head",
                    id
                )));
            }
        }

        let doomed: Vec<NodeId> = index
            .values()
            .filter(|delta| descends_from(delta, &node))
            .map(|delta| delta.id())
            .collect();
        for doomed_id in &doomed {
            index.remove(doomed_id);
            fork_heads.remove(doomed_id);
        }
        debug!("discarded node {} and {} descendants", id, doomed.len() - 1);

        if let Some(parent) = node.parent() {
            let has_remaining_children = index
                .values()
                .any(|delta| delta.parent_id() == parent.id() && delta.id() != parent.id());
            if !has_remaining_children {
                fork_heads.insert(parent.id(), parent);
            }
        }
        Ok(())
    }

    /// Flattens the node's ancestor chain into durable storage, making the
    /// node the new root, and prunes every fork that does not descend from
    /// it.
    pub fn commit_node(
        &self,
        id: &NodeId,
        lock: &mut UniqueDbLock,
    ) -> Result<(), StateDatabaseError> {
        let node = {
            let open = lock.state()?;
            let index = lock_mutex(&open.index);
            index.get(id).cloned().ok_or_else(|| unknown_node(id))?
        };

        info!("committing node {} at revision {}", id, node.revision());
        node.commit()?;
        if !node.is_finalized() {
            node.finalize();
        }

        let open = lock.state_mut()?;
        open.root = Arc::clone(&node);

        let mut index = lock_mutex(&open.index);
        index.retain(|_, delta| descends_from(delta, &node));

        let mut fork_heads = lock_mutex(&open.fork_heads);
        fork_heads.clear();
        for delta in index.values() {
            if !delta.is_finalized() {
                continue;
            }
            let has_finalized_child = index.values().any(|child| {
                child.parent_id() == delta.id()
                    && child.id() != delta.id()
                    && child.is_finalized()
            });
            if !has_finalized_child {
                fork_heads.insert(delta.id(), Arc::clone(delta));
            }
        }

        // Head selection reruns the same per-algorithm rule finalize uses,
        // seeded with the surviving head so ties already settled by arrival
        // order stay settled. Under proof-of-burn this re-detects duplicate
        // signers among the rebuilt candidates and evicts them again.
        let mut head = lock_mutex(&open.head);
        let mut best = if index.contains_key(&head.id()) {
            Arc::clone(&head)
        } else {
            Arc::clone(&node)
        };
        let candidates: Vec<Arc<StateDelta>> = fork_heads.values().cloned().collect();
        for candidate in candidates {
            if candidate.id() == best.id() || !fork_heads.contains_key(&candidate.id()) {
                continue;
            }
            best = resolve_head(open.algorithm, &mut fork_heads, &best, &candidate)?;
        }
        *head = best;
        Ok(())
    }

    /// Looks up a node by id; unknown ids are `None`, not an error.
    pub fn get_node(
        &self,
        id: &NodeId,
        lock: &SharedDbLock,
    ) -> Result<Option<StateNode>, StateDatabaseError> {
        let open = lock.state()?;
        let index = lock_mutex(&open.index);
        Ok(index.get(id).cloned().map(StateNode::new))
    }

    /// The node at the given revision on the path from `descendant`
    /// (default: the head) down to the root.
    pub fn get_node_at_revision(
        &self,
        revision: u64,
        descendant: Option<&NodeId>,
        lock: &SharedDbLock,
    ) -> Result<StateNode, StateDatabaseError> {
        let open = lock.state()?;

        let anchor = match descendant {
            Some(id) => {
                let index = lock_mutex(&open.index);
                index.get(id).cloned().ok_or_else(|| unknown_node(id))?
            }
            None => Arc::clone(&lock_mutex(&open.head)),
        };

        if revision > anchor.revision() {
            return Err(StateDatabaseError::IllegalArgument(format!(
                "revision {} is beyond node {}",
                revision,
                anchor.id()
            )));
        }
        if revision < open.root.revision() {
            return Err(StateDatabaseError::IllegalArgument(format!(
                "revision {} predates the root",
                revision
            )));
        }

        let mut node = anchor;
        while node.revision() > revision {
            node = node.parent().ok_or_else(|| {
                StateDatabaseError::InternalError(
                    "ancestor chain ended above the requested revision".into(),
                )
            })?;
        }
        Ok(StateNode::new(node))
    }

    pub fn get_head(&self, lock: &SharedDbLock) -> Result<StateNode, StateDatabaseError> {
        let open = lock.state()?;
        Ok(StateNode::new(Arc::clone(&lock_mutex(&open.head))))
    }

    pub fn get_root(&self, lock: &SharedDbLock) -> Result<StateNode, StateDatabaseError> {
        let open = lock.state()?;
        Ok(StateNode::new(Arc::clone(&open.root)))
    }

    /// Every fork head: finalized nodes without finalized descendants.
    pub fn get_fork_heads(
        &self,
        lock: &SharedDbLock,
    ) -> Result<Vec<StateNode>, StateDatabaseError> {
        let open = lock.state()?;
        let fork_heads = lock_mutex(&open.fork_heads);
        Ok(fork_heads.values().cloned().map(StateNode::new).collect())
    }

    /// Every live node, in a depth-first preorder walk from the root with
    /// children visited in id order.
    pub fn get_all_nodes(
        &self,
        lock: &SharedDbLock,
    ) -> Result<Vec<StateNode>, StateDatabaseError> {
        let open = lock.state()?;
        let index = lock_mutex(&open.index);

        let mut nodes = Vec::with_capacity(index.len());
        let mut stack = vec![Arc::clone(&open.root)];
        while let Some(current) = stack.pop() {
            let mut children: Vec<Arc<StateDelta>> = index
                .values()
                .filter(|delta| {
                    delta.parent_id() == current.id() && delta.id() != current.id()
                })
                .cloned()
                .collect();
            children.sort_by_key(|delta| *delta.id().as_bytes());
            // reversed so the smallest id is popped first
            children.reverse();
            stack.extend(children);
            nodes.push(StateNode::new(current));
        }
        Ok(nodes)
    }
}

fn lock_mutex<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unknown_node(id: &NodeId) -> StateDatabaseError {
    StateDatabaseError::IllegalArgument(format!("node {} does not exist", id))
}

/// Whether `node` is `ancestor` itself or one of its descendants.
fn descends_from(node: &Arc<StateDelta>, ancestor: &Arc<StateDelta>) -> bool {
    let mut current = Arc::clone(node);
    while current.revision() > ancestor.revision() {
        match current.parent() {
            Some(parent) => current = parent,
            None => return false,
        }
    }
    current.revision() == ancestor.revision() && current.id() == ancestor.id()
}

/// Whether `candidate` beats `best` under the algorithm's simple order
/// (revision, then timestamp where the algorithm considers it).
fn prefers(
    algorithm: ForkResolutionAlgorithm,
    best: &Arc<StateDelta>,
    candidate: &Arc<StateDelta>,
) -> Result<bool, StateDatabaseError> {
    if candidate.revision() != best.revision() {
        return Ok(candidate.revision() > best.revision());
    }
    match algorithm {
        ForkResolutionAlgorithm::Fifo => Ok(false),
        ForkResolutionAlgorithm::BlockTime | ForkResolutionAlgorithm::Pob => Ok(
            candidate.block_header()?.timestamp < best.block_header()?.timestamp,
        ),
    }
}

/// Picks the head after `candidate` finalized, given the current head.
///
/// For proof-of-burn, detecting double production may rewrite the fork-head
/// set: the offender's blocks lose candidacy and the head rolls back to the
/// best surviving fork head or to the offenders' common ancestor, which
/// then replaces its evicted descendants in the set.
fn resolve_head(
    algorithm: ForkResolutionAlgorithm,
    fork_heads: &mut HashMap<NodeId, Arc<StateDelta>>,
    head: &Arc<StateDelta>,
    candidate: &Arc<StateDelta>,
) -> Result<Arc<StateDelta>, StateDatabaseError> {
    match algorithm {
        ForkResolutionAlgorithm::Fifo | ForkResolutionAlgorithm::BlockTime => {
            Ok(if prefers(algorithm, head, candidate)? {
                Arc::clone(candidate)
            } else {
                Arc::clone(head)
            })
        }
        ForkResolutionAlgorithm::Pob => {
            if candidate.revision() != head.revision() {
                return Ok(if candidate.revision() > head.revision() {
                    Arc::clone(candidate)
                } else {
                    Arc::clone(head)
                });
            }

            let candidate_signer = candidate.block_header()?.signer;
            if candidate_signer != head.block_header()?.signer {
                return Ok(if prefers(algorithm, head, candidate)? {
                    Arc::clone(candidate)
                } else {
                    Arc::clone(head)
                });
            }

            warn!(
                "double production by signer {} at revision {}",
                hex::encode(&candidate_signer),
                candidate.revision()
            );

            let ancestor = common_ancestor(head, candidate)?;
            let mut best = Arc::clone(&ancestor);
            for fork_head in fork_heads.values() {
                if fork_head.revision() == candidate.revision()
                    && fork_head.block_header()?.signer == candidate_signer
                {
                    continue;
                }
                if prefers(algorithm, &best, fork_head)? {
                    best = Arc::clone(fork_head);
                }
            }

            if !fork_heads.contains_key(&best.id()) {
                fork_heads.retain(|_, fork_head| !descends_from(fork_head, &best));
                fork_heads.insert(best.id(), Arc::clone(&best));
            }
            Ok(best)
        }
    }
}

/// The nearest common ancestor of two nodes of the version tree.
fn common_ancestor(
    left: &Arc<StateDelta>,
    right: &Arc<StateDelta>,
) -> Result<Arc<StateDelta>, StateDatabaseError> {
    let missing_parent = || {
        StateDatabaseError::InternalError(
            "nodes of one tree must share a common ancestor".into(),
        )
    };

    let mut left = Arc::clone(left);
    let mut right = Arc::clone(right);
    while left.revision() > right.revision() {
        left = left.parent().ok_or_else(missing_parent)?;
    }
    while right.revision() > left.revision() {
        right = right.parent().ok_or_else(missing_parent)?;
    }
    while left.id() != right.id() {
        left = left.parent().ok_or_else(missing_parent)?;
        right = right.parent().ok_or_else(missing_parent)?;
    }
    Ok(left)
}
