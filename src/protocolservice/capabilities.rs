// Copyright 2022 The Agentd Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Protocol service capability verbs.
//!
//! Client authorization is a set of `(subject, verb, object)` triples:
//! the subject entity may apply the verb to the object entity. Verbs are
//! a closed set of UUIDs; the zero UUID as object means "any object".

use uuid::Uuid;

use std::collections::HashSet;

use crate::{zero_id, Id};

/// Get the latest block id.
pub const CAP_BLOCK_ID_LATEST_READ: Uuid = Uuid::from_bytes([
    0xc5, 0xb0, 0xeb, 0x04, 0x6b, 0x24, 0x48, 0xbe,
    0xb7, 0xd9, 0xbf, 0x90, 0x83, 0xa4, 0xbe, 0x5d,
]);

/// Submit a transaction.
pub const CAP_TRANSACTION_SUBMIT: Uuid = Uuid::from_bytes([
    0xef, 0x56, 0x0d, 0x24, 0xee, 0xa6, 0x48, 0x47,
    0x90, 0x09, 0x46, 0x4b, 0x12, 0x7f, 0x24, 0x9b,
]);

/// Read a block by id.
pub const CAP_BLOCK_READ: Uuid = Uuid::from_bytes([
    0xf3, 0x82, 0xe3, 0x65, 0x12, 0x24, 0x43, 0xb4,
    0x92, 0x4a, 0x1d, 0xe4, 0xd9, 0xf4, 0xcf, 0x25,
]);

/// Read a block id by block height.
pub const CAP_BLOCK_ID_BY_HEIGHT_READ: Uuid = Uuid::from_bytes([
    0x91, 0x5a, 0x5e, 0xf4, 0x8f, 0x96, 0x4e, 0xf5,
    0x95, 0x88, 0x0a, 0x75, 0xb1, 0xca, 0xe6, 0x8d,
]);

/// Read a transaction by id.
pub const CAP_TRANSACTION_READ: Uuid = Uuid::from_bytes([
    0x7d, 0xf2, 0x10, 0xd6, 0xf0, 0x0b, 0x47, 0xc4,
    0xa6, 0x08, 0x6f, 0x3f, 0x1d, 0xf7, 0x51, 0x1a,
]);

/// Read an artifact by id.
pub const CAP_ARTIFACT_READ: Uuid = Uuid::from_bytes([
    0xfc, 0x0e, 0x22, 0xea, 0x1e, 0x77, 0x4e, 0xa4,
    0xa2, 0xae, 0x08, 0xbe, 0x5f, 0xf7, 0x3c, 0xcc,
]);

/// Assert that a given block id is the latest.
pub const CAP_ASSERT_LATEST_BLOCK_ID: Uuid = Uuid::from_bytes([
    0x44, 0x76, 0x17, 0xb4, 0xa8, 0x47, 0x43, 0x7c,
    0xb6, 0x2b, 0x5b, 0xc6, 0xa9, 0x42, 0x06, 0xfa,
]);

/// Cancel a block assertion.
pub const CAP_ASSERT_LATEST_BLOCK_ID_CANCEL: Uuid = Uuid::from_bytes([
    0xd8, 0x48, 0xb1, 0x18, 0x7c, 0x34, 0x46, 0xc5,
    0x80, 0xdb, 0xd4, 0xff, 0xd9, 0x21, 0xbb, 0x50,
]);

/// Register as an extended-API provider.
pub const CAP_EXTENDED_API_ENABLE: Uuid = Uuid::from_bytes([
    0xc4, 0x1b, 0x05, 0x3c, 0x6b, 0x4a, 0x40, 0xa1,
    0x98, 0x1b, 0x88, 0x2b, 0xde, 0xff, 0xe9, 0x78,
]);

/// Respond to a client extended-API request.
pub const CAP_EXTENDED_API_RESP: Uuid = Uuid::from_bytes([
    0x25, 0x79, 0x5b, 0x47, 0xb0, 0xf0, 0x45, 0x6f,
    0xaa, 0xc4, 0x22, 0x13, 0x1f, 0x4e, 0xac, 0xe2,
]);

/// Send an extended-API request to a provider entity.
pub const CAP_EXTENDED_API_SENDRECV: Uuid = Uuid::from_bytes([
    0x51, 0xb9, 0xe4, 0x24, 0x0c, 0x45, 0x49, 0x1b,
    0x9b, 0xda, 0x69, 0x0e, 0x10, 0x87, 0x3c, 0x1c,
]);

/// Resolves a config-file verb name onto its capability UUID.
pub fn verb_by_name(name: &str) -> Option<Uuid> {
    Some(match name {
        "block_id_latest_read" | "latest_block_id_read" => CAP_BLOCK_ID_LATEST_READ,
        "transaction_submit" => CAP_TRANSACTION_SUBMIT,
        "block_read" => CAP_BLOCK_READ,
        "block_id_by_height_read" => CAP_BLOCK_ID_BY_HEIGHT_READ,
        "transaction_read" => CAP_TRANSACTION_READ,
        "artifact_read" => CAP_ARTIFACT_READ,
        "assert_latest_block_id" => CAP_ASSERT_LATEST_BLOCK_ID,
        "assert_latest_block_id_cancel" => CAP_ASSERT_LATEST_BLOCK_ID_CANCEL,
        "extended_api_enable" => CAP_EXTENDED_API_ENABLE,
        "extended_api_response" => CAP_EXTENDED_API_RESP,
        "extended_api_sendrecv" => CAP_EXTENDED_API_SENDRECV,
        _ => return None,
    })
}

/// The authorized capability triples.
#[derive(Debug, Default, Clone)]
pub struct CapabilityTable {
    grants: HashSet<(Id, Uuid, Id)>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `(subject, verb, object)`. The zero id as object grants the
    /// verb against any object.
    pub fn grant(&mut self, subject: Id, verb: Uuid, object: Id) {
        self.grants.insert((subject, verb, object));
    }

    /// Whether `subject` may apply `verb` to `object`.
    pub fn check(&self, subject: Id, verb: Uuid, object: Id) -> bool {
        self.grants.contains(&(subject, verb, object))
            || self.grants.contains(&(subject, verb, zero_id()))
    }

    /// Number of grants held.
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(tail: u8) -> Id {
        let mut bytes = [0u8; 16];
        bytes[15] = tail;
        Uuid::from_bytes(bytes)
    }

    #[test]
    fn exact_triple_matches() {
        let mut table = CapabilityTable::new();
        table.grant(id(1), CAP_BLOCK_READ, id(2));

        assert!(table.check(id(1), CAP_BLOCK_READ, id(2)));
        assert!(!table.check(id(1), CAP_BLOCK_READ, id(3)));
        assert!(!table.check(id(3), CAP_BLOCK_READ, id(2)));
        assert!(!table.check(id(1), CAP_TRANSACTION_READ, id(2)));
    }

    #[test]
    fn zero_object_means_any() {
        let mut table = CapabilityTable::new();
        table.grant(id(1), CAP_TRANSACTION_SUBMIT, zero_id());

        assert!(table.check(id(1), CAP_TRANSACTION_SUBMIT, id(9)));
        assert!(table.check(id(1), CAP_TRANSACTION_SUBMIT, zero_id()));
        assert!(!table.check(id(2), CAP_TRANSACTION_SUBMIT, id(9)));
    }

    #[test]
    fn verbs_are_distinct() {
        let verbs = [
            CAP_BLOCK_ID_LATEST_READ,
            CAP_TRANSACTION_SUBMIT,
            CAP_BLOCK_READ,
            CAP_BLOCK_ID_BY_HEIGHT_READ,
            CAP_TRANSACTION_READ,
            CAP_ARTIFACT_READ,
            CAP_ASSERT_LATEST_BLOCK_ID,
            CAP_ASSERT_LATEST_BLOCK_ID_CANCEL,
            CAP_EXTENDED_API_ENABLE,
            CAP_EXTENDED_API_RESP,
            CAP_EXTENDED_API_SENDRECV,
        ];
        let unique: HashSet<_> = verbs.iter().collect();
        assert_eq!(unique.len(), verbs.len());
    }
}
