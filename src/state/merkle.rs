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

//! Binary merkle tree over SHA-256 leaves.
//!
//! A delta's merkle root is computed over its sorted changes: for each key,
//! in byte-lexicographic order, the digest of the key and the digest of the
//! value (the empty string for a tombstone) are appended as leaves. Levels
//! are built by hashing the concatenation of each adjacent pair; an odd node
//! at the end of a level is promoted unchanged. The root of an empty leaf
//! set is the all-zeros digest.

use sha2::{Digest, Sha256};

pub fn hash_leaf(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn merkle_root(leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return [0; 32];
    }

    let mut level = leaves;
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                let mut hasher = Sha256::new();
                hasher.update(pair[0]);
                hasher.update(pair[1]);
                next.push(hasher.finalize().into());
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    level[0]
}
