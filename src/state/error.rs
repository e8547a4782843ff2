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

use std::error::Error;
use std::fmt;

use cbor::decoder::DecodeError;
use cbor::encoder::EncodeError;

use crate::database::error::DatabaseError;

/// An error that may occur at the state database boundary.
#[derive(Debug)]
pub enum StateDatabaseError {
    /// A write was attempted against a finalized state node.
    NodeFinalized,
    /// The node cannot be discarded; discarding the current head is not
    /// permitted.
    CannotDiscard(String),
    /// An argument did not satisfy the operation's preconditions.
    IllegalArgument(String),
    /// The database has not been opened, or has been closed.
    Closed,
    /// An iterator was dereferenced or moved outside of its valid range.
    OutOfRange,
    /// An internal invariant was violated.
    InternalError(String),
    /// An error occurred in the underlying storage backend.
    DatabaseError(DatabaseError),
}

impl fmt::Display for StateDatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StateDatabaseError::NodeFinalized => {
                write!(f, "Cannot write to a finalized state node")
            }
            StateDatabaseError::CannotDiscard(msg) => write!(f, "Cannot discard: {}", msg),
            StateDatabaseError::IllegalArgument(msg) => write!(f, "Illegal Argument: {}", msg),
            StateDatabaseError::Closed => write!(f, "State database is closed"),
            StateDatabaseError::OutOfRange => write!(f, "Iterator is out of range"),
            StateDatabaseError::InternalError(msg) => write!(f, "Internal Error: {}", msg),
            StateDatabaseError::DatabaseError(err) => write!(f, "Database Error: {}", err),
        }
    }
}

impl Error for StateDatabaseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StateDatabaseError::DatabaseError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DatabaseError> for StateDatabaseError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::OutOfRange => StateDatabaseError::OutOfRange,
            DatabaseError::NotOpen => {
                StateDatabaseError::InternalError("backend has not been opened".into())
            }
            err => StateDatabaseError::DatabaseError(err),
        }
    }
}

impl From<EncodeError> for StateDatabaseError {
    fn from(err: EncodeError) -> Self {
        StateDatabaseError::InternalError(format!("unable to encode block header: {}", err))
    }
}

impl From<DecodeError> for StateDatabaseError {
    fn from(err: DecodeError) -> Self {
        StateDatabaseError::InternalError(format!("unable to decode block header: {}", err))
    }
}
