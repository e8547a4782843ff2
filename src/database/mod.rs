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

//! Traits for reading and writing ordered key-value backends.
//!
//! Stratadb operates on key-value entries at the backend level, where both
//! keys and values are opaque bytes and iteration follows byte-lexicographic
//! key order.
//!
//! Every state delta exclusively owns one backend holding only that delta's
//! writes. Non-root deltas use the transient [btree::BTreeBackend]; the root
//! delta of a persistent database uses the durable
//! [rocksdb::RocksDbBackend]. Alongside the data, a backend carries four
//! metadata slots - revision, node id, merkle root, and block header - which
//! identify the state the backend contents represent.
//!
//! # Cursors
//!
//! Backends hand out owned, bidirectional cursors. A cursor either sits on
//! an entry or on the one-past-the-end sentinel. Advancing or dereferencing
//! the end sentinel, or stepping backwards from the first entry, fails with
//! `DatabaseError::OutOfRange`; stepping backwards from end yields the last
//! entry. Cursors share ownership of the underlying storage, so they remain
//! valid for as long as the caller holds them.
//!
//! # Write batches
//!
//! Mutations between `start_write_batch` and `end_write_batch` are buffered
//! and applied atomically, together with any metadata written through
//! `store_metadata`. Nested batches are not supported.

pub mod btree;
pub mod cache;
pub mod error;
pub mod rocksdb;

pub use crate::database::error::DatabaseError;

/// The metadata slots carried by every backend.
///
/// `id` and `merkle_root` are raw 32-byte digests and `block_header` is an
/// opaque serialized header; interpretation of all three belongs to the
/// state layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub revision: u64,
    pub id: [u8; 32],
    pub merkle_root: [u8; 32],
    pub block_header: Vec<u8>,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            revision: 0,
            id: [0; 32],
            merkle_root: [0; 32],
            block_header: Vec::new(),
        }
    }
}

/// An ordered key-value store with metadata slots and atomic write batches.
pub trait Backend: Send + Sync {
    /// Inserts the given entry, overwriting any previous value.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError>;

    /// Returns the value stored at the given key, if present.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Removes the entry at the given key. Removing an absent key is a no-op.
    fn erase(&mut self, key: &[u8]) -> Result<(), DatabaseError>;

    /// Removes all entries and resets the metadata slots.
    fn clear(&mut self) -> Result<(), DatabaseError>;

    /// Returns the number of entries.
    fn size(&self) -> Result<u64, DatabaseError>;

    fn is_empty(&self) -> Result<bool, DatabaseError> {
        Ok(self.size()? == 0)
    }

    /// Returns a cursor positioned on the first entry, or on end if the
    /// backend is empty.
    fn begin(&self) -> Result<Box<dyn Cursor>, DatabaseError>;

    /// Returns a cursor positioned on the end sentinel.
    fn end(&self) -> Result<Box<dyn Cursor>, DatabaseError>;

    /// Returns a cursor positioned on the given key, or on end if the key is
    /// not present.
    fn find(&self, key: &[u8]) -> Result<Box<dyn Cursor>, DatabaseError>;

    /// Returns a cursor positioned on the first entry with a key greater
    /// than or equal to the given key, or on end.
    fn lower_bound(&self, key: &[u8]) -> Result<Box<dyn Cursor>, DatabaseError>;

    /// Begins buffering mutations into an atomic batch.
    fn start_write_batch(&mut self) -> Result<(), DatabaseError>;

    /// Applies all buffered mutations atomically.
    fn end_write_batch(&mut self) -> Result<(), DatabaseError>;

    /// Persists the metadata slots; inside a write batch the slots become
    /// part of the batch.
    fn store_metadata(&mut self) -> Result<(), DatabaseError>;

    fn metadata(&self) -> &Metadata;

    fn metadata_mut(&mut self) -> &mut Metadata;

    /// Produces an independent backend with the same contents and metadata.
    fn clone_backend(&self) -> Result<Box<dyn Backend>, DatabaseError>;
}

/// A bidirectional cursor over a backend's entries.
pub trait Cursor: Send {
    /// Returns the key under the cursor; fails with `OutOfRange` at end.
    fn key(&self) -> Result<&[u8], DatabaseError>;

    /// Returns the value under the cursor; fails with `OutOfRange` at end.
    fn value(&self) -> Result<Vec<u8>, DatabaseError>;

    /// Moves to the next entry, or to end past the last entry; fails with
    /// `OutOfRange` if already at end.
    fn next(&mut self) -> Result<(), DatabaseError>;

    /// Moves to the previous entry; from end this yields the last entry.
    /// Fails with `OutOfRange` at the first entry or on an empty backend,
    /// leaving the position unchanged.
    fn prev(&mut self) -> Result<(), DatabaseError>;

    fn is_end(&self) -> bool;
}
