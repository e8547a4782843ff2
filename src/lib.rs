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

//! Stratadb is a versioned, fork-aware key-value state database.
//!
//! World state is modeled as a tree of state deltas. Each delta records only
//! the writes and deletions produced by a single block (or by a speculative
//! transaction attempt) on top of its parent, while still presenting itself
//! as a complete key-value snapshot. The database tracks all live deltas,
//! maintains the set of fork heads, resolves the canonical head with a
//! pluggable fork-choice rule, and can atomically flatten a chosen delta
//! chain into durable storage, abandoning the competing forks.
//!
//! The crate is split into two layers:
//!
//! * `database`: the ordered key-value backend contract along with the
//!   in-memory and RocksDB-backed implementations.
//! * `state`: state deltas, the merge iterator, the typed state-node
//!   facade, and the fork-aware database itself.

pub mod database;
pub mod state;

#[macro_use]
extern crate log;
