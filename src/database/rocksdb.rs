/*
 * Copyright 2019 Bitwise IO, Inc.
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

//! The durable ordered key-value backend, built on RocksDB.
//!
//! User entries live in the default column family; the metadata slots live
//! in a dedicated `metadata` column family so that data iteration never sees
//! them. An [ObjectCache] fronts point reads, caching both values and known
//! absences; `put` and `erase` invalidate the touched key before any write
//! batch is applied, so entries cached before a commit are re-fetched
//! afterwards.
//!
//! All operations on an unopened backend fail with `DatabaseError::NotOpen`.

use std::collections::HashMap;
use std::convert::TryInto;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use ::rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};

use crate::database::cache::ObjectCache;
use crate::database::error::DatabaseError;
use crate::database::{Backend, Cursor, Metadata};

const METADATA_CF: &str = "metadata";

const REVISION_KEY: &[u8] = b"r";
const ID_KEY: &[u8] = b"i";
const MERKLE_ROOT_KEY: &[u8] = b"m";
const BLOCK_HEADER_KEY: &[u8] = b"h";
const SIZE_KEY: &[u8] = b"s";

const DEFAULT_CACHE_SIZE: usize = 10 * 1024 * 1024;

/// A buffered mutation, applied when the enclosing write batch ends.
enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    StoreMetadata { metadata: Metadata, size: u64 },
}

pub struct RocksDbBackend {
    db: Option<Arc<DB>>,
    metadata: Metadata,
    cache: Mutex<ObjectCache>,
    size: u64,
    write_batch: Option<Vec<BatchOp>>,
    /// Presence overlay for entries touched by the active batch, used to
    /// keep the object count exact before the batch lands.
    batch_presence: HashMap<Vec<u8>, bool>,
}

impl RocksDbBackend {
    pub fn new() -> Self {
        RocksDbBackend {
            db: None,
            metadata: Metadata::default(),
            cache: Mutex::new(ObjectCache::new(DEFAULT_CACHE_SIZE)),
            size: 0,
            write_batch: None,
            batch_presence: HashMap::new(),
        }
    }

    /// Opens (or creates) the store rooted at the given path and loads the
    /// metadata slots. A freshly created store starts at revision 0 with the
    /// zero id and an empty header.
    pub fn open(&mut self, path: &Path) -> Result<(), DatabaseError> {
        if self.db.is_some() {
            return Err(DatabaseError::InitError(
                "backend is already open".to_string(),
            ));
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new("default", Options::default()),
            ColumnFamilyDescriptor::new(METADATA_CF, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|err| DatabaseError::InitError(err.to_string()))?;

        self.db = Some(Arc::new(db));

        match self.load_metadata() {
            Ok(Some((metadata, size))) => {
                self.metadata = metadata;
                self.size = size;
            }
            Ok(None) => {
                debug!("initializing fresh store at {:?}", path);
                self.metadata = Metadata::default();
                self.size = 0;
                self.store_metadata()?;
            }
            Err(err) => {
                self.db = None;
                return Err(err);
            }
        }

        Ok(())
    }

    fn db(&self) -> Result<&Arc<DB>, DatabaseError> {
        self.db.as_ref().ok_or(DatabaseError::NotOpen)
    }

    /// Reads the metadata slots; `None` indicates a freshly created store.
    fn load_metadata(&self) -> Result<Option<(Metadata, u64)>, DatabaseError> {
        let db = self.db()?;
        let cf = db
            .cf_handle(METADATA_CF)
            .ok_or_else(|| DatabaseError::InitError("missing metadata column family".into()))?;

        let id = match db.get_cf(cf, ID_KEY)? {
            Some(bytes) => to_digest(&bytes)?,
            None => return Ok(None),
        };

        let revision = match db.get_cf(cf, REVISION_KEY)? {
            Some(bytes) => to_u64(&bytes)?,
            None => return Err(DatabaseError::CorruptionError(
                "metadata revision slot is missing".into(),
            )),
        };
        let merkle_root = match db.get_cf(cf, MERKLE_ROOT_KEY)? {
            Some(bytes) => to_digest(&bytes)?,
            None => return Err(DatabaseError::CorruptionError(
                "metadata merkle root slot is missing".into(),
            )),
        };
        let block_header = db.get_cf(cf, BLOCK_HEADER_KEY)?.unwrap_or_default();
        let size = match db.get_cf(cf, SIZE_KEY)? {
            Some(bytes) => to_u64(&bytes)?,
            None => return Err(DatabaseError::CorruptionError(
                "metadata size slot is missing".into(),
            )),
        };

        Ok(Some((
            Metadata {
                revision,
                id,
                merkle_root,
                block_header,
            },
            size,
        )))
    }

    /// Whether the key currently exists, seen through the active batch.
    fn contains(&self, key: &[u8]) -> Result<bool, DatabaseError> {
        if let Some(present) = self.batch_presence.get(key) {
            return Ok(*present);
        }
        Ok(self.db()?.get_pinned(key)?.is_some())
    }

    fn invalidate_cached(&self, key: &[u8]) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

impl Default for RocksDbBackend {
    fn default() -> Self {
        RocksDbBackend::new()
    }
}

impl Backend for RocksDbBackend {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        let existed = self.contains(key)?;
        self.invalidate_cached(key);

        match self.write_batch.as_mut() {
            Some(batch) => {
                batch.push(BatchOp::Put {
                    key: key.to_vec(),
                    value: value.to_vec(),
                });
                self.batch_presence.insert(key.to_vec(), true);
            }
            None => self.db()?.put(key, value)?,
        }

        if !existed {
            self.size += 1;
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        let db = self.db()?;

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = cache.get(key) {
            return Ok(hit.map(|value| value.as_ref().clone()));
        }

        let value = db.get(key)?;
        cache.put(key, value.clone().map(Arc::new));
        Ok(value)
    }

    fn erase(&mut self, key: &[u8]) -> Result<(), DatabaseError> {
        let existed = self.contains(key)?;
        self.invalidate_cached(key);

        match self.write_batch.as_mut() {
            Some(batch) => {
                batch.push(BatchOp::Delete { key: key.to_vec() });
                self.batch_presence.insert(key.to_vec(), false);
            }
            None => self.db()?.delete(key)?,
        }

        if existed {
            self.size -= 1;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DatabaseError> {
        if self.write_batch.is_some() {
            return Err(DatabaseError::InternalError(
                "cannot clear during a write batch".into(),
            ));
        }

        let db = self.db()?;
        let mut batch = WriteBatch::default();
        for entry in db.iterator(IteratorMode::Start) {
            let (key, _) = entry?;
            batch.delete(key);
        }
        db.write(batch)?;

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.metadata = Metadata::default();
        self.size = 0;
        self.store_metadata()
    }

    fn size(&self) -> Result<u64, DatabaseError> {
        self.db()?;
        Ok(self.size)
    }

    fn begin(&self) -> Result<Box<dyn Cursor>, DatabaseError> {
        let db = self.db()?;
        let position = match db.iterator(IteratorMode::Start).next() {
            Some(entry) => Some(entry?.0.to_vec()),
            None => None,
        };
        Ok(Box::new(RocksDbCursor {
            db: Arc::clone(db),
            position,
        }))
    }

    fn end(&self) -> Result<Box<dyn Cursor>, DatabaseError> {
        let db = self.db()?;
        Ok(Box::new(RocksDbCursor {
            db: Arc::clone(db),
            position: None,
        }))
    }

    fn find(&self, key: &[u8]) -> Result<Box<dyn Cursor>, DatabaseError> {
        let db = self.db()?;
        let position = if db.get_pinned(key)?.is_some() {
            Some(key.to_vec())
        } else {
            None
        };
        Ok(Box::new(RocksDbCursor {
            db: Arc::clone(db),
            position,
        }))
    }

    fn lower_bound(&self, key: &[u8]) -> Result<Box<dyn Cursor>, DatabaseError> {
        let db = self.db()?;
        let position = match db
            .iterator(IteratorMode::From(key, Direction::Forward))
            .next()
        {
            Some(entry) => Some(entry?.0.to_vec()),
            None => None,
        };
        Ok(Box::new(RocksDbCursor {
            db: Arc::clone(db),
            position,
        }))
    }

    fn start_write_batch(&mut self) -> Result<(), DatabaseError> {
        self.db()?;
        if self.write_batch.is_some() {
            return Err(DatabaseError::InternalError(
                "write batches cannot be nested".into(),
            ));
        }
        self.write_batch = Some(Vec::new());
        self.batch_presence.clear();
        Ok(())
    }

    fn end_write_batch(&mut self) -> Result<(), DatabaseError> {
        let ops = self.write_batch.take().ok_or_else(|| {
            DatabaseError::InternalError("no write batch in progress".into())
        })?;

        // Reads issued while the batch was buffering may have cached the
        // pre-batch state of keys the batch is about to change; those
        // entries must not survive the batch.
        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            for key in self.batch_presence.keys() {
                cache.remove(key);
            }
        }
        self.batch_presence.clear();

        let db = self.db()?;
        let cf = db
            .cf_handle(METADATA_CF)
            .ok_or_else(|| DatabaseError::InitError("missing metadata column family".into()))?;

        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.put(key, value),
                BatchOp::Delete { key } => batch.delete(key),
                BatchOp::StoreMetadata { metadata, size } => {
                    put_metadata(&mut batch, cf, &metadata, size)
                }
            }
        }
        db.write(batch)?;
        Ok(())
    }

    fn store_metadata(&mut self) -> Result<(), DatabaseError> {
        match self.write_batch.as_mut() {
            Some(batch) => {
                batch.push(BatchOp::StoreMetadata {
                    metadata: self.metadata.clone(),
                    size: self.size,
                });
                Ok(())
            }
            None => {
                let db = self.db()?;
                let cf = db.cf_handle(METADATA_CF).ok_or_else(|| {
                    DatabaseError::InitError("missing metadata column family".into())
                })?;

                let mut batch = WriteBatch::default();
                put_metadata(&mut batch, cf, &self.metadata, self.size);
                db.write(batch)?;
                Ok(())
            }
        }
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    // Only transient fork deltas are ever cloned; the durable root backend
    // has exactly one owner for its entire lifetime.
    fn clone_backend(&self) -> Result<Box<dyn Backend>, DatabaseError> {
        Err(DatabaseError::InternalError(
            "the durable backend cannot be cloned".into(),
        ))
    }
}

struct RocksDbCursor {
    db: Arc<DB>,
    /// The key under the cursor; `None` is the end sentinel. Every step
    /// re-seeks against the store, so the cursor holds no iterator state.
    position: Option<Vec<u8>>,
}

impl Cursor for RocksDbCursor {
    fn key(&self) -> Result<&[u8], DatabaseError> {
        self.position
            .as_deref()
            .ok_or(DatabaseError::OutOfRange)
    }

    fn value(&self) -> Result<Vec<u8>, DatabaseError> {
        let key = self.position.as_ref().ok_or(DatabaseError::OutOfRange)?;
        self.db.get(key)?.ok_or_else(|| {
            DatabaseError::InternalError("cursor entry no longer exists".into())
        })
    }

    fn next(&mut self) -> Result<(), DatabaseError> {
        let key = self.position.take().ok_or(DatabaseError::OutOfRange)?;
        let mut itr = self
            .db
            .iterator(IteratorMode::From(key.as_slice(), Direction::Forward));
        while let Some(entry) = itr.next() {
            let (entry_key, _) = entry?;
            if entry_key.as_ref() > key.as_slice() {
                self.position = Some(entry_key.to_vec());
                break;
            }
        }
        Ok(())
    }

    fn prev(&mut self) -> Result<(), DatabaseError> {
        let previous = match &self.position {
            Some(key) => {
                let mut found = None;
                let mut itr = self
                    .db
                    .iterator(IteratorMode::From(key.as_slice(), Direction::Reverse));
                while let Some(entry) = itr.next() {
                    let (entry_key, _) = entry?;
                    if entry_key.as_ref() < key.as_slice() {
                        found = Some(entry_key.to_vec());
                        break;
                    }
                }
                found
            }
            None => match self.db.iterator(IteratorMode::End).next() {
                Some(entry) => Some(entry?.0.to_vec()),
                None => None,
            },
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

fn put_metadata(batch: &mut WriteBatch, cf: &ColumnFamily, metadata: &Metadata, size: u64) {
    batch.put_cf(cf, REVISION_KEY, metadata.revision.to_be_bytes());
    batch.put_cf(cf, ID_KEY, metadata.id);
    batch.put_cf(cf, MERKLE_ROOT_KEY, metadata.merkle_root);
    batch.put_cf(cf, BLOCK_HEADER_KEY, &metadata.block_header);
    batch.put_cf(cf, SIZE_KEY, size.to_be_bytes());
}

fn to_u64(bytes: &[u8]) -> Result<u64, DatabaseError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| {
        DatabaseError::CorruptionError("metadata integer slot is malformed".into())
    })?;
    Ok(u64::from_be_bytes(array))
}

fn to_digest(bytes: &[u8]) -> Result<[u8; 32], DatabaseError> {
    bytes.try_into().map_err(|_| {
        DatabaseError::CorruptionError("metadata digest slot is malformed".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_DB_COUNT: AtomicUsize = AtomicUsize::new(1);

    fn run_test<T>(test: T)
    where
        T: FnOnce(&Path) + std::panic::UnwindSafe,
    {
        let count = TEST_DB_COUNT.fetch_add(1, Ordering::SeqCst);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "stratadb-rocksdb-test-{}-{}",
            std::process::id(),
            count
        ));

        let test_path: PathBuf = path.clone();
        let result = std::panic::catch_unwind(move || test(&test_path));

        if path.exists() {
            std::fs::remove_dir_all(&path).unwrap();
        }

        if let Err(err) = result {
            std::panic::resume_unwind(err);
        }
    }

    #[test]
    fn unopened_backend_fails() {
        let mut backend = RocksDbBackend::new();

        assert!(matches!(
            backend.put(b"foo", b"bar"),
            Err(DatabaseError::NotOpen)
        ));
        assert!(matches!(backend.get(b"foo"), Err(DatabaseError::NotOpen)));
        assert!(matches!(backend.erase(b"foo"), Err(DatabaseError::NotOpen)));
        assert!(matches!(backend.clear(), Err(DatabaseError::NotOpen)));
        assert!(matches!(backend.size(), Err(DatabaseError::NotOpen)));
        assert!(matches!(backend.begin(), Err(DatabaseError::NotOpen)));
        assert!(matches!(backend.end(), Err(DatabaseError::NotOpen)));
        assert!(matches!(backend.find(b"foo"), Err(DatabaseError::NotOpen)));
        assert!(matches!(
            backend.lower_bound(b"foo"),
            Err(DatabaseError::NotOpen)
        ));
        assert!(matches!(
            backend.start_write_batch(),
            Err(DatabaseError::NotOpen)
        ));

        assert_eq!(backend.metadata().revision, 0);
        assert_eq!(backend.metadata().id, [0; 32]);
    }

    #[test]
    fn cursor_navigation() {
        run_test(|path| {
            let mut backend = RocksDbBackend::new();
            backend.open(path).unwrap();

            let itr = backend.begin().unwrap();
            assert!(itr.is_end());

            backend.put(b"foo", b"bar").unwrap();
            backend.put(b"alice", b"bob").unwrap();
            assert_eq!(backend.size().unwrap(), 2);

            let mut itr = backend.begin().unwrap();
            assert_eq!(itr.key().unwrap(), b"alice");
            assert_eq!(itr.value().unwrap(), b"bob");

            itr.next().unwrap();
            assert_eq!(itr.value().unwrap(), b"bar");

            itr.next().unwrap();
            assert!(itr.is_end());

            itr.prev().unwrap();
            assert_eq!(itr.value().unwrap(), b"bar");

            let itr = backend.lower_bound(b"charlie").unwrap();
            assert_eq!(itr.value().unwrap(), b"bar");

            backend.put(b"foo", b"blob").unwrap();
            assert_eq!(backend.size().unwrap(), 2);
            let mut itr = backend.find(b"foo").unwrap();
            assert_eq!(itr.value().unwrap(), b"blob");

            itr.prev().unwrap();
            assert_eq!(itr.value().unwrap(), b"bob");

            backend.erase(b"foo").unwrap();
            assert_eq!(backend.size().unwrap(), 1);
            let itr = backend.find(b"foo").unwrap();
            assert!(itr.is_end());

            backend.erase(b"foo").unwrap();
            assert_eq!(backend.size().unwrap(), 1);
        })
    }

    #[test]
    fn write_batch_is_deferred() {
        run_test(|path| {
            let mut backend = RocksDbBackend::new();
            backend.open(path).unwrap();

            backend.put(b"a", b"1").unwrap();

            backend.start_write_batch().unwrap();
            assert!(matches!(
                backend.start_write_batch(),
                Err(DatabaseError::InternalError(_))
            ));

            backend.put(b"b", b"2").unwrap();
            backend.erase(b"a").unwrap();
            backend.metadata_mut().revision = 9;
            backend.store_metadata().unwrap();

            // nothing lands until the batch ends
            assert_eq!(backend.get(b"b").unwrap(), None);

            backend.end_write_batch().unwrap();

            assert_eq!(backend.get(b"b").unwrap(), Some(b"2".to_vec()));
            assert_eq!(backend.get(b"a").unwrap(), None);
            assert_eq!(backend.size().unwrap(), 1);
        })
    }

    #[test]
    fn metadata_survives_reopen() {
        run_test(|path| {
            {
                let mut backend = RocksDbBackend::new();
                backend.open(path).unwrap();

                assert_eq!(backend.metadata(), &Metadata::default());

                backend.put(b"foo", b"bar").unwrap();
                backend.metadata_mut().revision = 3;
                backend.metadata_mut().id = [7; 32];
                backend.metadata_mut().block_header = b"header".to_vec();
                backend.store_metadata().unwrap();
            }

            let mut backend = RocksDbBackend::new();
            backend.open(path).unwrap();

            assert_eq!(backend.metadata().revision, 3);
            assert_eq!(backend.metadata().id, [7; 32]);
            assert_eq!(backend.metadata().block_header, b"header".to_vec());
            assert_eq!(backend.size().unwrap(), 1);
            assert_eq!(backend.get(b"foo").unwrap(), Some(b"bar".to_vec()));

            backend.clear().unwrap();
            assert!(backend.is_empty().unwrap());
            assert_eq!(backend.metadata(), &Metadata::default());
        })
    }
}
