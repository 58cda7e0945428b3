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

//! The key/value engine behind the data service.
//!
//! The daemon treats the storage engine as an oracle: tables of raw bytes
//! with fork/merge semantics. Mutating operations clone the current tables
//! into a fork, apply every change there and merge the fork back in one
//! step, so a failed operation leaves the store untouched. This binding is
//! in-memory; an embedded on-disk engine can replace it behind the same
//! surface.

use thiserror::Error;

use std::collections::BTreeMap;

use crate::{zero_id, Id};

/// Raw table key: a 128-bit identifier.
pub type Key = [u8; 16];

/// Storage failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("database would exceed its configured maximum size")]
    Full,
}

/// Every table of the store, plus the chain bookkeeping the engine keeps
/// transactional with them.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    /// Encoded block records keyed by block id.
    pub blocks: BTreeMap<Key, Vec<u8>>,
    /// Block id per height.
    pub block_heights: BTreeMap<u64, Key>,
    /// Canonized transaction records keyed by transaction id.
    pub transactions: BTreeMap<Key, Vec<u8>>,
    /// Process-queue transaction records keyed by transaction id.
    pub queue: BTreeMap<Key, Vec<u8>>,
    /// Artifact records keyed by artifact id.
    pub artifacts: BTreeMap<Key, Vec<u8>>,
    /// Global settings: 64-bit key to bytes.
    pub settings: BTreeMap<u64, Vec<u8>>,
    /// Head of the process queue, zero when empty.
    pub queue_head: Key,
    /// Tail of the process queue, zero when empty.
    pub queue_tail: Key,
    /// Latest block id, zero before the root block is installed.
    pub latest_block_id: Key,
}

impl Tables {
    fn new() -> Self {
        let zero = *zero_id().as_bytes();
        Self {
            queue_head: zero,
            queue_tail: zero,
            latest_block_id: zero,
            ..Self::default()
        }
    }

    /// Approximate stored size in bytes.
    fn size(&self) -> u64 {
        let map_size = |map: &BTreeMap<Key, Vec<u8>>| {
            map.values().map(|value| 16 + value.len() as u64).sum::<u64>()
        };
        map_size(&self.blocks)
            + map_size(&self.transactions)
            + map_size(&self.queue)
            + map_size(&self.artifacts)
            + self.block_heights.len() as u64 * 24
            + self
                .settings
                .values()
                .map(|value| 8 + value.len() as u64)
                .sum::<u64>()
    }
}

/// The store. One per root context.
#[derive(Debug)]
pub struct Database {
    max_size: u64,
    tables: Tables,
}

impl Database {
    /// Opens an empty store capped at `max_size` bytes.
    pub fn open(max_size: u64) -> Self {
        Self {
            max_size,
            tables: Tables::new(),
        }
    }

    /// The current committed tables.
    pub fn snapshot(&self) -> &Tables {
        &self.tables
    }

    /// Starts a fork carrying a copy of the committed tables.
    pub fn fork(&self) -> Fork {
        Fork {
            tables: self.tables.clone(),
        }
    }

    /// Merges a fork atomically, enforcing the size cap.
    pub fn merge(&mut self, fork: Fork) -> Result<(), DatabaseError> {
        if fork.tables.size() > self.max_size {
            return Err(DatabaseError::Full);
        }
        self.tables = fork.tables;
        Ok(())
    }
}

/// A mutable copy of the tables, merged or dropped wholesale.
#[derive(Debug)]
pub struct Fork {
    tables: Tables,
}

impl Fork {
    pub fn tables(&mut self) -> &mut Tables {
        &mut self.tables
    }

    pub fn tables_ref(&self) -> &Tables {
        &self.tables
    }
}

/// Converts an [`Id`] into a table key.
pub fn key_of(id: Id) -> Key {
    *id.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_isolation() {
        let mut db = Database::open(1 << 20);
        let mut fork = db.fork();
        fork.tables().settings.insert(7, vec![1, 2, 3]);

        // Uncommitted changes are invisible.
        assert!(db.snapshot().settings.get(&7).is_none());

        db.merge(fork).unwrap();
        assert_eq!(db.snapshot().settings.get(&7).unwrap(), &vec![1, 2, 3]);
    }

    #[test]
    fn dropped_fork_changes_nothing() {
        let mut db = Database::open(1 << 20);
        {
            let mut fork = db.fork();
            fork.tables().blocks.insert([1; 16], vec![0; 128]);
        }
        assert!(db.snapshot().blocks.is_empty());
        // Still mergeable afterwards.
        let fork = db.fork();
        db.merge(fork).unwrap();
    }

    #[test]
    fn size_cap_enforced() {
        let mut db = Database::open(64);
        let mut fork = db.fork();
        fork.tables().queue.insert([2; 16], vec![0u8; 256]);
        assert_eq!(db.merge(fork), Err(DatabaseError::Full));
        assert!(db.snapshot().queue.is_empty());

        // A fork that fits still merges.
        let mut fork = db.fork();
        fork.tables().settings.insert(1, vec![0u8; 8]);
        db.merge(fork).unwrap();
    }
}
