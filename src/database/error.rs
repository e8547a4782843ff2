/*
 * Copyright 2018 Bitwise IO, Inc.
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

use std::error::Error;
use std::fmt;

/// An error that may occur at the ordered key-value backend layer.
#[derive(Debug)]
pub enum DatabaseError {
    /// The backend could not be initialized or opened.
    InitError(String),
    /// An operation was attempted against a backend that has not been opened.
    NotOpen,
    /// A cursor was dereferenced or moved outside of the valid range.
    OutOfRange,
    /// A read against the backend failed.
    ReaderError(String),
    /// A write against the backend failed.
    WriterError(String),
    /// The underlying storage engine reported a failure.
    StorageError(String),
    /// Data read from the backend could not be interpreted.
    CorruptionError(String),
    /// An internal invariant of the backend was violated.
    InternalError(String),
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DatabaseError::InitError(msg) => write!(f, "Initialization Error: {}", msg),
            DatabaseError::NotOpen => write!(f, "Database is not open"),
            DatabaseError::OutOfRange => write!(f, "Iterator is out of range"),
            DatabaseError::ReaderError(msg) => write!(f, "Reader Error: {}", msg),
            DatabaseError::WriterError(msg) => write!(f, "Writer Error: {}", msg),
            DatabaseError::StorageError(msg) => write!(f, "Storage Error: {}", msg),
            DatabaseError::CorruptionError(msg) => write!(f, "Corruption Error: {}", msg),
            DatabaseError::InternalError(msg) => write!(f, "Internal Error: {}", msg),
        }
    }
}

impl Error for DatabaseError {}

impl From<rocksdb::Error> for DatabaseError {
    fn from(err: rocksdb::Error) -> Self {
        DatabaseError::StorageError(err.to_string())
    }
}
