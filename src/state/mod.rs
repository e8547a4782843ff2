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

//! Fork-aware versioned state.
//!
//! State is addressed by `(object_space, key)` pairs and organized as a tree
//! of [delta::StateDelta] nodes, each carrying one block's writes on top of
//! its parent. [db::StateDatabase] owns the tree, tracks fork heads, and
//! resolves the canonical head; [node::StateNode] is the typed facade over a
//! single delta; [merge::MergeState] provides ordered iteration over a
//! delta's effective contents.

pub mod db;
pub mod delta;
pub mod error;
pub mod merge;
pub mod merkle;
pub mod node;

use std::fmt;
use std::io::Cursor;

use cbor::decoder::GenericDecoder;
use cbor::encoder::GenericEncoder;
use cbor::value::{Bytes, Key, Text, Value};
use sha2::{Digest, Sha256};

pub use crate::state::db::{
    ForkResolutionAlgorithm, SharedDbLock, StateDatabase, UniqueDbLock,
};
pub use crate::state::error::StateDatabaseError;
pub use crate::state::node::{AnonymousStateNode, StateNode};

/// The content-hash identity of a state node.
///
/// The all-zeros id is the genesis sentinel: it identifies the root of a
/// store that has never had a node committed to it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn new(bytes: [u8; 32]) -> Self {
        NodeId(bytes)
    }

    /// The genesis sentinel id.
    pub fn zero() -> Self {
        NodeId([0; 32])
    }

    /// Derives an id as the SHA-256 digest of the given bytes.
    pub fn hash(data: &[u8]) -> Self {
        NodeId(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A namespace identifying a logical collection within the key space.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectSpace {
    pub system: bool,
    pub zone: Vec<u8>,
    pub id: u64,
}

/// The block header fields consumed by fork resolution, stored alongside a
/// state node's backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockHeader {
    pub height: u64,
    pub timestamp: u64,
    pub previous: Vec<u8>,
    pub signer: Vec<u8>,
}

impl BlockHeader {
    /// Serializes the header to CBOR for the backend's metadata slot.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StateDatabaseError> {
        let mut map = std::collections::BTreeMap::new();
        map.insert(text_key("h"), Value::U64(self.height));
        map.insert(text_key("t"), Value::U64(self.timestamp));
        map.insert(
            text_key("p"),
            Value::Bytes(Bytes::Bytes(self.previous.clone())),
        );
        map.insert(
            text_key("s"),
            Value::Bytes(Bytes::Bytes(self.signer.clone())),
        );

        let mut encoder = GenericEncoder::new(Cursor::new(Vec::new()));
        encoder.value(&Value::Map(map))?;
        Ok(encoder.into_inner().into_writer().into_inner())
    }

    /// Deserializes a header; an empty slot decodes as the default header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateDatabaseError> {
        if bytes.is_empty() {
            return Ok(BlockHeader::default());
        }

        let mut decoder = GenericDecoder::new(cbor::Config::default(), Cursor::new(bytes));
        let mut map = match decoder.value()? {
            Value::Map(map) => map,
            _ => {
                return Err(StateDatabaseError::InternalError(
                    "block header is not a cbor map".into(),
                ))
            }
        };

        Ok(BlockHeader {
            height: take_u64(&mut map, "h")?,
            timestamp: take_u64(&mut map, "t")?,
            previous: take_bytes(&mut map, "p")?,
            signer: take_bytes(&mut map, "s")?,
        })
    }
}

fn text_key(name: &str) -> Key {
    Key::Text(Text::Text(name.to_string()))
}

fn take_u64(
    map: &mut std::collections::BTreeMap<Key, Value>,
    name: &str,
) -> Result<u64, StateDatabaseError> {
    match map.remove(&text_key(name)) {
        Some(Value::U8(n)) => Ok(u64::from(n)),
        Some(Value::U16(n)) => Ok(u64::from(n)),
        Some(Value::U32(n)) => Ok(u64::from(n)),
        Some(Value::U64(n)) => Ok(n),
        _ => Err(StateDatabaseError::InternalError(format!(
            "block header field '{}' is missing or malformed",
            name
        ))),
    }
}

fn take_bytes(
    map: &mut std::collections::BTreeMap<Key, Value>,
    name: &str,
) -> Result<Vec<u8>, StateDatabaseError> {
    match map.remove(&text_key(name)) {
        Some(Value::Bytes(Bytes::Bytes(bytes))) => Ok(bytes),
        _ => Err(StateDatabaseError::InternalError(format!(
            "block header field '{}' is missing or malformed",
            name
        ))),
    }
}

/// One record of a state delta's contents: a write carries a value, a
/// tombstone does not.
#[derive(Clone, Debug, PartialEq)]
pub struct StateDeltaEntry {
    pub object_space: ObjectSpace,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Encodes `(object_space, key)` into the canonical backend key.
///
/// The encoding is order preserving: all entries of one object space are
/// contiguous under byte-lexicographic ordering and sorted by user key
/// within the space. Numeric fields are big-endian fixed width and the zone
/// is length prefixed so that no two spaces' encodings interleave.
pub fn encode_object_key(space: &ObjectSpace, key: &[u8]) -> Vec<u8> {
    let mut encoded =
        Vec::with_capacity(1 + 4 + space.zone.len() + 8 + key.len());
    encoded.push(space.system as u8);
    encoded.extend_from_slice(&(space.zone.len() as u32).to_be_bytes());
    encoded.extend_from_slice(&space.zone);
    encoded.extend_from_slice(&space.id.to_be_bytes());
    encoded.extend_from_slice(key);
    encoded
}

/// Decodes a backend key back into `(object_space, key)`.
pub fn decode_object_key(
    encoded: &[u8],
) -> Result<(ObjectSpace, Vec<u8>), StateDatabaseError> {
    if encoded.len() < 1 + 4 {
        return Err(StateDatabaseError::InternalError(
            "encoded object key is truncated".into(),
        ));
    }
    let system = encoded[0] != 0;
    let zone_len = u32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]) as usize;
    if encoded.len() < 1 + 4 + zone_len + 8 {
        return Err(StateDatabaseError::InternalError(
            "encoded object key is truncated".into(),
        ));
    }
    let zone = encoded[5..5 + zone_len].to_vec();
    let id_start = 5 + zone_len;
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&encoded[id_start..id_start + 8]);
    let key = encoded[id_start + 8..].to_vec();

    Ok((
        ObjectSpace {
            system,
            zone,
            id: u64::from_be_bytes(id_bytes),
        },
        key,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_sentinel_and_hash() {
        assert!(NodeId::zero().is_zero());
        assert_eq!(NodeId::zero().as_bytes(), &[0; 32]);

        let id = NodeId::hash(b"block 1");
        assert!(!id.is_zero());
        assert_eq!(id, NodeId::hash(b"block 1"));
        assert_ne!(id, NodeId::hash(b"block 2"));
        assert_eq!(format!("{}", id).len(), 64);
    }

    #[test]
    fn block_header_roundtrip() {
        let header = BlockHeader {
            height: 42,
            timestamp: 1_648_000_000,
            previous: vec![1, 2, 3],
            signer: b"signer1".to_vec(),
        };

        let bytes = header.to_bytes().unwrap();
        assert_eq!(BlockHeader::from_bytes(&bytes).unwrap(), header);

        // an empty metadata slot is the default header
        assert_eq!(
            BlockHeader::from_bytes(&[]).unwrap(),
            BlockHeader::default()
        );
    }

    #[test]
    fn object_key_roundtrip() {
        let space = ObjectSpace {
            system: true,
            zone: b"zone".to_vec(),
            id: 7,
        };
        let encoded = encode_object_key(&space, b"some-key");
        let (decoded_space, decoded_key) = decode_object_key(&encoded).unwrap();

        assert_eq!(decoded_space, space);
        assert_eq!(decoded_key, b"some-key".to_vec());
    }

    /// Entries of a space are contiguous: every key of one space sorts
    /// strictly before every key of a space with a greater identity, and
    /// user keys order the entries within a space.
    #[test]
    fn object_key_ordering() {
        let space_a = ObjectSpace {
            system: false,
            zone: b"ab".to_vec(),
            id: 1,
        };
        let space_b = ObjectSpace {
            system: false,
            zone: b"ab".to_vec(),
            id: 2,
        };
        let space_c = ObjectSpace {
            system: false,
            zone: b"abc".to_vec(),
            id: 0,
        };

        // within a space, user keys order entries
        assert!(encode_object_key(&space_a, b"a") < encode_object_key(&space_a, b"b"));

        // across spaces, even the greatest key of the lesser space sorts
        // before the least key of the greater space
        assert!(
            encode_object_key(&space_a, &[0xff; 16]) < encode_object_key(&space_b, b"")
        );
        assert!(
            encode_object_key(&space_b, &[0xff; 16]) < encode_object_key(&space_c, b"")
        );
    }
}
