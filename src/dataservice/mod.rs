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

//! The data service.
//!
//! Owns the chain state: the block list, the process queue of pending
//! transactions, artifacts and global settings. One root context holds the
//! store and the master capability set; consumers operate through child
//! contexts whose bitcaps are intersections of the root's. Every method
//! validates its child context and capability bit before touching state.

pub mod api;
pub mod database;
pub mod dispatch;
pub mod method;
pub mod records;

use thiserror::Error;
use uuid::Uuid;

use crate::bitcap::Bitcap;
use crate::cert::{field, Certificate};
use crate::status::{self, StatusWord};
use crate::{zero_id, Id};

use self::database::{key_of, Database, DatabaseError, Tables};
use self::method::cap;
use self::records::{ArtifactRecord, BlockRecord, TransactionRecord, TransactionState};

/// Maximum number of live child contexts per data service process.
pub const MAX_CHILD_CONTEXTS: usize = 1024;

/// Domain and authorization failures of data-service operations.
///
/// These surface as response status words; the connection survives them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DataError {
    #[error("not found")]
    NotFound,
    #[error("operation not permitted by context capabilities")]
    NotAuthorized,
    #[error("request packet has an invalid size")]
    RequestPacketInvalidSize,
    #[error("request packet is malformed")]
    RequestPacketBad,
    #[error("child context index out of range")]
    ChildContextBadIndex,
    #[error("child context is not open")]
    ChildContextInvalid,
    #[error("all child context slots are in use")]
    ChildContextExhausted,
    #[error("root context has not been created")]
    RootContextMissing,
    #[error("root context already created")]
    RootContextAlreadyCreated,
    #[error("block height is not latest height plus one")]
    BlockMakeHeightMismatch,
    #[error("previous block id does not match the latest block")]
    BlockMakePreviousIdMismatch,
    #[error("block id is zero or already present")]
    BlockMakeBadBlockId,
    #[error("block references no child transactions")]
    BlockMakeNoChildTransactions,
    #[error("block references a transaction that is not queued")]
    BlockMakeChildTransactionFailure,
    #[error("transaction already exists")]
    TransactionExists,
    #[error("transaction is in the wrong state for this operation")]
    TransactionBadState,
    #[error("database is full")]
    DatabaseFull,
}

impl DataError {
    /// The wire status word for this failure.
    pub fn status(self) -> StatusWord {
        use status::data;
        match self {
            DataError::NotFound => data::NOT_FOUND,
            DataError::NotAuthorized => data::NOT_AUTHORIZED,
            DataError::RequestPacketInvalidSize => data::REQUEST_PACKET_INVALID_SIZE,
            DataError::RequestPacketBad => data::REQUEST_PACKET_BAD,
            DataError::ChildContextBadIndex => data::CHILD_CONTEXT_BAD_INDEX,
            DataError::ChildContextInvalid => data::CHILD_CONTEXT_INVALID,
            DataError::ChildContextExhausted => data::CHILD_CONTEXT_EXHAUSTED,
            DataError::RootContextMissing => data::ROOT_CONTEXT_MISSING,
            DataError::RootContextAlreadyCreated => data::ROOT_CONTEXT_ALREADY_CREATED,
            DataError::BlockMakeHeightMismatch => data::BLOCK_MAKE_HEIGHT_MISMATCH,
            DataError::BlockMakePreviousIdMismatch => data::BLOCK_MAKE_PREVIOUS_ID_MISMATCH,
            DataError::BlockMakeBadBlockId => data::BLOCK_MAKE_BAD_BLOCK_ID,
            DataError::BlockMakeNoChildTransactions => data::BLOCK_MAKE_NO_CHILD_TRANSACTIONS,
            DataError::BlockMakeChildTransactionFailure => {
                data::BLOCK_MAKE_CHILD_TRANSACTION_FAILURE
            }
            DataError::TransactionExists => data::TRANSACTION_EXISTS,
            DataError::TransactionBadState => data::TRANSACTION_BAD_STATE,
            DataError::DatabaseFull => data::DATABASE_FULL,
        }
    }
}

impl From<DatabaseError> for DataError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Full => DataError::DatabaseFull,
        }
    }
}

type OpResult<T> = Result<T, DataError>;

#[derive(Debug)]
struct RootContext {
    caps: Bitcap,
    db: Database,
}

#[derive(Debug)]
struct ChildContext {
    caps: Bitcap,
}

/// One data service instance: the root context plus its child contexts.
#[derive(Debug)]
pub struct DataService {
    root: Option<RootContext>,
    children: Vec<Option<ChildContext>>,
}

impl Default for DataService {
    fn default() -> Self {
        Self::new()
    }
}

impl DataService {
    pub fn new() -> Self {
        Self {
            root: None,
            children: (0..MAX_CHILD_CONTEXTS).map(|_| None).collect(),
        }
    }

    fn root(&self) -> OpResult<&RootContext> {
        self.root.as_ref().ok_or(DataError::RootContextMissing)
    }

    fn root_mut(&mut self) -> OpResult<&mut RootContext> {
        self.root.as_mut().ok_or(DataError::RootContextMissing)
    }

    /// Validates the child index, liveness and capability bit.
    fn check_child(&self, child: u32, cap_index: usize) -> OpResult<()> {
        let slot = self
            .children
            .get(child as usize)
            .ok_or(DataError::ChildContextBadIndex)?;
        let context = slot.as_ref().ok_or(DataError::ChildContextInvalid)?;
        if !context.caps.is_set(cap_index) {
            return Err(DataError::NotAuthorized);
        }
        Ok(())
    }

    /// Creates the root context, opening the store and installing the root
    /// block from its certificate.
    pub fn root_context_create(&mut self, max_size: u64, root_block_cert: &[u8]) -> OpResult<()> {
        if self.root.is_some() {
            return Err(DataError::RootContextAlreadyCreated);
        }

        let cert =
            Certificate::parse(root_block_cert).map_err(|_| DataError::RequestPacketBad)?;
        let root_id = cert
            .require_id(field::BLOCK_ID)
            .map_err(|_| DataError::RequestPacketBad)?;
        let height = cert
            .require_u64(field::BLOCK_HEIGHT)
            .map_err(|_| DataError::RequestPacketBad)?;
        if root_id == zero_id() || height != 0 {
            return Err(DataError::RequestPacketBad);
        }

        let mut db = Database::open(max_size);
        let mut fork = db.fork();
        let record = BlockRecord {
            block_id: root_id,
            prev: zero_id(),
            next: zero_id(),
            first_transaction_id: zero_id(),
            height: 0,
            cert: root_block_cert.to_vec(),
        };
        let tables = fork.tables();
        tables.blocks.insert(key_of(root_id), record.encode(true));
        tables.block_heights.insert(0, key_of(root_id));
        tables.latest_block_id = key_of(root_id);
        db.merge(fork)?;

        self.root = Some(RootContext {
            caps: Bitcap::new_true(cap::BITS),
            db,
        });
        Ok(())
    }

    /// Intersects the root capability set with `requested`.
    pub fn root_context_reduce_caps(&mut self, requested: &Bitcap) -> OpResult<()> {
        let root = self.root_mut()?;
        if !root.caps.is_set(cap::LL_ROOT_CONTEXT_REDUCE_CAPS) {
            return Err(DataError::NotAuthorized);
        }
        root.caps.intersect(requested);
        Ok(())
    }

    /// Opens a child context whose capabilities are `requested ∧ root`.
    pub fn child_context_create(&mut self, requested: &Bitcap) -> OpResult<u32> {
        let root = self.root()?;
        if !root.caps.is_set(cap::CHILD_CONTEXT_CREATE) {
            return Err(DataError::NotAuthorized);
        }
        let mut caps = requested.clone();
        caps.intersect(&root.caps);

        let slot = self
            .children
            .iter()
            .position(Option::is_none)
            .ok_or(DataError::ChildContextExhausted)?;
        self.children[slot] = Some(ChildContext { caps });
        Ok(slot as u32)
    }

    /// Closes a child context.
    pub fn child_context_close(&mut self, child: u32) -> OpResult<()> {
        self.check_child(child, cap::CHILD_CONTEXT_CLOSE)?;
        self.children[child as usize] = None;
        Ok(())
    }

    /// Closes every child context; used at root teardown.
    pub fn close_all_children(&mut self) {
        for slot in &mut self.children {
            *slot = None;
        }
    }

    pub fn global_setting_read(&self, child: u32, key: u64) -> OpResult<Vec<u8>> {
        self.check_child(child, cap::GLOBAL_SETTING_READ)?;
        self.root()?
            .db
            .snapshot()
            .settings
            .get(&key)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    pub fn global_setting_write(&mut self, child: u32, key: u64, value: &[u8]) -> OpResult<()> {
        self.check_child(child, cap::GLOBAL_SETTING_WRITE)?;
        let root = self.root_mut()?;
        let mut fork = root.db.fork();
        fork.tables().settings.insert(key, value.to_vec());
        root.db.merge(fork)?;
        Ok(())
    }

    pub fn block_id_latest_read(&self, child: u32) -> OpResult<Id> {
        self.check_child(child, cap::BLOCK_ID_LATEST_READ)?;
        let latest = self.root()?.db.snapshot().latest_block_id;
        if latest == *zero_id().as_bytes() {
            return Err(DataError::NotFound);
        }
        Ok(Uuid::from_bytes(latest))
    }

    pub fn block_id_by_height_read(&self, child: u32, height: u64) -> OpResult<Id> {
        self.check_child(child, cap::BLOCK_ID_BY_HEIGHT_READ)?;
        self.root()?
            .db
            .snapshot()
            .block_heights
            .get(&height)
            .map(|key| Uuid::from_bytes(*key))
            .ok_or(DataError::NotFound)
    }

    pub fn block_read(&self, child: u32, block_id: Id, with_cert: bool) -> OpResult<BlockRecord> {
        self.check_child(child, cap::BLOCK_READ)?;
        let raw = self
            .root()?
            .db
            .snapshot()
            .blocks
            .get(&key_of(block_id))
            .ok_or(DataError::NotFound)?;
        let mut record = BlockRecord::decode(raw).ok_or(DataError::RequestPacketBad)?;
        if !with_cert {
            record.cert.clear();
        }
        Ok(record)
    }

    /// Appends a transaction to the process queue.
    pub fn transaction_submit(
        &mut self,
        child: u32,
        transaction_id: Id,
        artifact_id: Id,
        cert: &[u8],
    ) -> OpResult<()> {
        self.check_child(child, cap::PQ_TRANSACTION_SUBMIT)?;
        if transaction_id == zero_id() || artifact_id == zero_id() || cert.is_empty() {
            return Err(DataError::RequestPacketBad);
        }
        let root = self.root_mut()?;
        let key = key_of(transaction_id);
        {
            let tables = root.db.snapshot();
            if tables.queue.contains_key(&key) || tables.transactions.contains_key(&key) {
                return Err(DataError::TransactionExists);
            }
        }

        let mut fork = root.db.fork();
        let tables = fork.tables();
        let zero = *zero_id().as_bytes();

        let record = TransactionRecord {
            transaction_id,
            prev: Uuid::from_bytes(tables.queue_tail),
            next: zero_id(),
            artifact_id,
            block_id: zero_id(),
            state: TransactionState::Submitted,
            cert: cert.to_vec(),
        };

        if tables.queue_tail != zero {
            let tail_key = tables.queue_tail;
            let mut tail = TransactionRecord::decode(&tables.queue[&tail_key])
                .ok_or(DataError::RequestPacketBad)?;
            tail.next = transaction_id;
            tables.queue.insert(tail_key, tail.encode(true));
        } else {
            tables.queue_head = key;
        }
        tables.queue_tail = key;
        tables.queue.insert(key, record.encode(true));

        root.db.merge(fork)?;
        Ok(())
    }

    /// Marks a submitted queue transaction as promoted.
    pub fn transaction_promote(&mut self, child: u32, transaction_id: Id) -> OpResult<()> {
        self.check_child(child, cap::PQ_TRANSACTION_PROMOTE)?;
        let root = self.root_mut()?;
        let key = key_of(transaction_id);

        let mut record = match root.db.snapshot().queue.get(&key) {
            Some(raw) => TransactionRecord::decode(raw).ok_or(DataError::RequestPacketBad)?,
            None => return Err(DataError::NotFound),
        };
        if record.state != TransactionState::Submitted {
            return Err(DataError::TransactionBadState);
        }
        record.state = TransactionState::Promoted;

        let mut fork = root.db.fork();
        fork.tables().queue.insert(key, record.encode(true));
        root.db.merge(fork)?;
        Ok(())
    }

    /// Removes a transaction from the process queue without canonizing it.
    pub fn transaction_drop(&mut self, child: u32, transaction_id: Id) -> OpResult<()> {
        self.check_child(child, cap::PQ_TRANSACTION_DROP)?;
        let root = self.root_mut()?;
        let mut fork = root.db.fork();
        unlink_from_queue(fork.tables(), transaction_id)?;
        root.db.merge(fork)?;
        Ok(())
    }

    /// Reads the head of the process queue.
    pub fn transaction_get_first(&self, child: u32) -> OpResult<TransactionRecord> {
        self.check_child(child, cap::PQ_TRANSACTION_FIRST_READ)?;
        let tables = self.root()?.db.snapshot();
        if tables.queue_head == *zero_id().as_bytes() {
            return Err(DataError::NotFound);
        }
        let raw = tables
            .queue
            .get(&tables.queue_head)
            .ok_or(DataError::NotFound)?;
        TransactionRecord::decode(raw).ok_or(DataError::RequestPacketBad)
    }

    /// Reads a process-queue transaction by id.
    pub fn transaction_get(&self, child: u32, transaction_id: Id) -> OpResult<TransactionRecord> {
        self.check_child(child, cap::PQ_TRANSACTION_READ)?;
        let raw = self
            .root()?
            .db
            .snapshot()
            .queue
            .get(&key_of(transaction_id))
            .ok_or(DataError::NotFound)?;
        TransactionRecord::decode(raw).ok_or(DataError::RequestPacketBad)
    }

    /// Reads a canonized transaction by id.
    pub fn canonized_transaction_read(
        &self,
        child: u32,
        transaction_id: Id,
        with_cert: bool,
    ) -> OpResult<TransactionRecord> {
        self.check_child(child, cap::TRANSACTION_READ)?;
        let raw = self
            .root()?
            .db
            .snapshot()
            .transactions
            .get(&key_of(transaction_id))
            .ok_or(DataError::NotFound)?;
        let mut record = TransactionRecord::decode(raw).ok_or(DataError::RequestPacketBad)?;
        if !with_cert {
            record.cert.clear();
        }
        Ok(record)
    }

    pub fn artifact_read(&self, child: u32, artifact_id: Id) -> OpResult<ArtifactRecord> {
        self.check_child(child, cap::ARTIFACT_READ)?;
        let raw = self
            .root()?
            .db
            .snapshot()
            .artifacts
            .get(&key_of(artifact_id))
            .ok_or(DataError::NotFound)?;
        ArtifactRecord::decode(raw).ok_or(DataError::RequestPacketBad)
    }

    /// The atomic canonization write.
    ///
    /// Validates the block certificate against the chain head, moves every
    /// referenced transaction off the process queue into the block, updates
    /// artifacts and the head pointer, and commits the lot in one merge.
    /// Any failure leaves the store exactly as it was.
    pub fn block_make(&mut self, child: u32, block_id: Id, block_cert: &[u8]) -> OpResult<()> {
        self.check_child(child, cap::BLOCK_WRITE)?;
        let root = self.root_mut()?;

        let cert = Certificate::parse(block_cert).map_err(|_| DataError::RequestPacketBad)?;
        let cert_block_id = cert
            .require_id(field::BLOCK_ID)
            .map_err(|_| DataError::RequestPacketBad)?;
        let height = cert
            .require_u64(field::BLOCK_HEIGHT)
            .map_err(|_| DataError::RequestPacketBad)?;
        let prev_block_id = cert
            .require_id(field::PREVIOUS_BLOCK_ID)
            .map_err(|_| DataError::RequestPacketBad)?;

        let tables = root.db.snapshot();
        if block_id == zero_id()
            || cert_block_id != block_id
            || tables.blocks.contains_key(&key_of(block_id))
        {
            return Err(DataError::BlockMakeBadBlockId);
        }

        let latest_key = tables.latest_block_id;
        let latest = BlockRecord::decode(
            tables
                .blocks
                .get(&latest_key)
                .ok_or(DataError::RootContextMissing)?,
        )
        .ok_or(DataError::RequestPacketBad)?;

        if height != latest.height + 1 {
            return Err(DataError::BlockMakeHeightMismatch);
        }
        if prev_block_id != latest.block_id {
            return Err(DataError::BlockMakePreviousIdMismatch);
        }

        // Collect the referenced child transactions before mutating.
        let mut wrapped = Vec::new();
        for raw_txn in cert.all(field::WRAPPED_TRANSACTION) {
            let txn_cert =
                Certificate::parse(raw_txn).map_err(|_| DataError::RequestPacketBad)?;
            let txn_id = txn_cert
                .require_id(field::CERTIFICATE_ID)
                .map_err(|_| DataError::RequestPacketBad)?;
            let artifact_id = txn_cert
                .require_id(field::ARTIFACT_ID)
                .map_err(|_| DataError::RequestPacketBad)?;
            wrapped.push((txn_id, artifact_id, raw_txn.to_vec()));
        }
        if wrapped.is_empty() {
            return Err(DataError::BlockMakeNoChildTransactions);
        }

        let mut fork = root.db.fork();
        let tables = fork.tables();

        let mut prev_txn = zero_id();
        let first_transaction_id = wrapped[0].0;
        for (txn_id, artifact_id, raw_txn) in wrapped {
            unlink_from_queue(tables, txn_id)
                .map_err(|_| DataError::BlockMakeChildTransactionFailure)?;

            let committed = TransactionRecord {
                transaction_id: txn_id,
                prev: prev_txn,
                next: zero_id(),
                artifact_id,
                block_id,
                state: TransactionState::Committed,
                cert: raw_txn,
            };
            if prev_txn != zero_id() {
                let prev_key = key_of(prev_txn);
                if let Some(raw_prev) = tables.transactions.get(&prev_key) {
                    if let Some(mut prev_record) = TransactionRecord::decode(raw_prev) {
                        prev_record.next = txn_id;
                        tables.transactions.insert(prev_key, prev_record.encode(true));
                    }
                }
            }
            tables
                .transactions
                .insert(key_of(txn_id), committed.encode(true));

            let artifact = ArtifactRecord {
                artifact_id,
                latest_transaction_id: txn_id,
                state: TransactionState::Committed as u32,
            };
            tables
                .artifacts
                .insert(key_of(artifact_id), artifact.encode());

            prev_txn = txn_id;
        }

        let record = BlockRecord {
            block_id,
            prev: latest.block_id,
            next: zero_id(),
            first_transaction_id,
            height,
            cert: block_cert.to_vec(),
        };
        tables.blocks.insert(key_of(block_id), record.encode(true));

        let mut latest_record = latest;
        latest_record.next = block_id;
        tables
            .blocks
            .insert(latest_key, latest_record.encode(true));
        tables.block_heights.insert(height, key_of(block_id));
        tables.latest_block_id = key_of(block_id);

        root.db.merge(fork)?;
        Ok(())
    }
}

/// Removes `transaction_id` from the process queue, restitching neighbor
/// links and the head/tail pointers. Returns the removed record.
fn unlink_from_queue(tables: &mut Tables, transaction_id: Id) -> OpResult<TransactionRecord> {
    let key = key_of(transaction_id);
    let raw = tables.queue.remove(&key).ok_or(DataError::NotFound)?;
    let record = TransactionRecord::decode(&raw).ok_or(DataError::RequestPacketBad)?;
    let zero = zero_id();

    if record.prev != zero {
        let prev_key = key_of(record.prev);
        if let Some(raw_prev) = tables.queue.get(&prev_key) {
            if let Some(mut prev) = TransactionRecord::decode(raw_prev) {
                prev.next = record.next;
                tables.queue.insert(prev_key, prev.encode(true));
            }
        }
    } else {
        tables.queue_head = *record.next.as_bytes();
    }

    if record.next != zero {
        let next_key = key_of(record.next);
        if let Some(raw_next) = tables.queue.get(&next_key) {
            if let Some(mut next) = TransactionRecord::decode(raw_next) {
                next.prev = record.prev;
                tables.queue.insert(next_key, next.encode(true));
            }
        }
    } else {
        tables.queue_tail = *record.prev.as_bytes();
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{cert_type, CertificateBuilder};

    fn id(tail: u8) -> Id {
        let mut bytes = [0u8; 16];
        bytes[15] = tail;
        Uuid::from_bytes(bytes)
    }

    fn root_block_cert(root_id: Id) -> Vec<u8> {
        let mut builder = CertificateBuilder::new(cert_type::BLOCK);
        builder
            .push_id(field::BLOCK_ID, root_id)
            .push_id(field::PREVIOUS_BLOCK_ID, zero_id())
            .push_u64(field::BLOCK_HEIGHT, 0);
        builder.build_unsigned()
    }

    fn txn_cert(txn_id: Id, artifact_id: Id) -> Vec<u8> {
        let mut builder = CertificateBuilder::new(cert_type::TRANSACTION);
        builder
            .push_id(field::CERTIFICATE_ID, txn_id)
            .push_id(field::ARTIFACT_ID, artifact_id);
        builder.build_unsigned()
    }

    fn block_cert(block_id: Id, prev: Id, height: u64, txns: &[Vec<u8>]) -> Vec<u8> {
        let mut builder = CertificateBuilder::new(cert_type::BLOCK);
        builder
            .push_id(field::BLOCK_ID, block_id)
            .push_id(field::PREVIOUS_BLOCK_ID, prev)
            .push_u64(field::BLOCK_HEIGHT, height);
        for txn in txns {
            builder.push(field::WRAPPED_TRANSACTION, txn);
        }
        builder.build_unsigned()
    }

    fn service_with_root() -> (DataService, Id) {
        let mut service = DataService::new();
        let root_id = id(0xA0);
        service
            .root_context_create(1 << 30, &root_block_cert(root_id))
            .unwrap();
        (service, root_id)
    }

    fn full_child(service: &mut DataService) -> u32 {
        service
            .child_context_create(&Bitcap::new_true(cap::BITS))
            .unwrap()
    }

    #[test]
    fn root_create_installs_root_block() {
        let (mut service, root_id) = service_with_root();
        let child = full_child(&mut service);
        assert_eq!(service.block_id_latest_read(child).unwrap(), root_id);
        assert_eq!(service.block_id_by_height_read(child, 0).unwrap(), root_id);

        let record = service.block_read(child, root_id, true).unwrap();
        assert_eq!(record.height, 0);
        assert!(!record.cert.is_empty());
    }

    #[test]
    fn root_create_twice_fails() {
        let (mut service, root_id) = service_with_root();
        assert_eq!(
            service.root_context_create(1 << 30, &root_block_cert(root_id)),
            Err(DataError::RootContextAlreadyCreated)
        );
    }

    #[test]
    fn capability_gates_dispatch() {
        let (mut service, _) = service_with_root();
        let mut caps = Bitcap::new_false(cap::BITS);
        caps.set(cap::BLOCK_READ, true);
        // Child creation itself must be granted in the request.
        caps.set(cap::CHILD_CONTEXT_CREATE, true);
        let child = service.child_context_create(&caps).unwrap();

        // A read-only child cannot submit.
        let err = service
            .transaction_submit(child, id(1), id(2), &txn_cert(id(1), id(2)))
            .unwrap_err();
        assert_eq!(err, DataError::NotAuthorized);
        // And the queue is untouched.
        let full = full_child(&mut service);
        assert_eq!(
            service.transaction_get_first(full),
            Err(DataError::NotFound)
        );
    }

    #[test]
    fn child_caps_are_subset_of_root() {
        let (mut service, _) = service_with_root();

        let mut reduced = Bitcap::new_true(cap::BITS);
        reduced.set(cap::PQ_TRANSACTION_SUBMIT, false);
        service.root_context_reduce_caps(&reduced).unwrap();

        let child = full_child(&mut service);
        let err = service
            .transaction_submit(child, id(1), id(2), &txn_cert(id(1), id(2)))
            .unwrap_err();
        assert_eq!(err, DataError::NotAuthorized);
    }

    #[test]
    fn queue_submit_iterate_drop() {
        let (mut service, _) = service_with_root();
        let child = full_child(&mut service);

        for tail in 1u8..=3 {
            service
                .transaction_submit(
                    child,
                    id(tail),
                    id(0x10 + tail),
                    &txn_cert(id(tail), id(0x10 + tail)),
                )
                .unwrap();
        }

        // Walk the queue front to back.
        let first = service.transaction_get_first(child).unwrap();
        assert_eq!(first.transaction_id, id(1));
        let second = service.transaction_get(child, first.next).unwrap();
        assert_eq!(second.transaction_id, id(2));
        let third = service.transaction_get(child, second.next).unwrap();
        assert_eq!(third.transaction_id, id(3));
        assert_eq!(third.next, zero_id());

        // Drop the middle entry and re-walk.
        service.transaction_drop(child, id(2)).unwrap();
        let first = service.transaction_get_first(child).unwrap();
        assert_eq!(first.next, id(3));
        let last = service.transaction_get(child, id(3)).unwrap();
        assert_eq!(last.prev, id(1));

        // Dropping it again is not found.
        assert_eq!(
            service.transaction_drop(child, id(2)),
            Err(DataError::NotFound)
        );
    }

    #[test]
    fn duplicate_submit_rejected() {
        let (mut service, _) = service_with_root();
        let child = full_child(&mut service);
        service
            .transaction_submit(child, id(1), id(2), &txn_cert(id(1), id(2)))
            .unwrap();
        assert_eq!(
            service.transaction_submit(child, id(1), id(2), &txn_cert(id(1), id(2))),
            Err(DataError::TransactionExists)
        );
    }

    #[test]
    fn promote_requires_submitted_state() {
        let (mut service, _) = service_with_root();
        let child = full_child(&mut service);
        service
            .transaction_submit(child, id(1), id(2), &txn_cert(id(1), id(2)))
            .unwrap();

        service.transaction_promote(child, id(1)).unwrap();
        assert_eq!(
            service.transaction_get(child, id(1)).unwrap().state,
            TransactionState::Promoted
        );
        assert_eq!(
            service.transaction_promote(child, id(1)),
            Err(DataError::TransactionBadState)
        );
        assert_eq!(
            service.transaction_promote(child, id(9)),
            Err(DataError::NotFound)
        );
    }

    #[test]
    fn block_make_commits_atomically() {
        let (mut service, root_id) = service_with_root();
        let child = full_child(&mut service);

        let txn_a = txn_cert(id(1), id(0x11));
        let txn_b = txn_cert(id(2), id(0x12));
        service
            .transaction_submit(child, id(1), id(0x11), &txn_a)
            .unwrap();
        service
            .transaction_submit(child, id(2), id(0x12), &txn_b)
            .unwrap();

        let new_block = id(0x20);
        let cert = block_cert(new_block, root_id, 1, &[txn_a.clone(), txn_b.clone()]);
        service.block_make(child, new_block, &cert).unwrap();

        // Chain advanced.
        assert_eq!(service.block_id_latest_read(child).unwrap(), new_block);
        assert_eq!(service.block_id_by_height_read(child, 1).unwrap(), new_block);
        let block = service.block_read(child, new_block, false).unwrap();
        assert_eq!(block.prev, root_id);
        assert_eq!(block.height, 1);
        assert_eq!(block.first_transaction_id, id(1));
        let root = service.block_read(child, root_id, false).unwrap();
        assert_eq!(root.next, new_block);

        // Queue is empty; transactions are committed and linked.
        assert_eq!(
            service.transaction_get_first(child),
            Err(DataError::NotFound)
        );
        let committed = service
            .canonized_transaction_read(child, id(1), true)
            .unwrap();
        assert_eq!(committed.block_id, new_block);
        assert_eq!(committed.state, TransactionState::Committed);
        assert_eq!(committed.next, id(2));
        assert_eq!(committed.cert, txn_a);

        // Artifacts point at their latest transactions.
        let artifact = service.artifact_read(child, id(0x12)).unwrap();
        assert_eq!(artifact.latest_transaction_id, id(2));
    }

    #[test]
    fn block_make_validates_preconditions() {
        let (mut service, root_id) = service_with_root();
        let child = full_child(&mut service);
        let txn = txn_cert(id(1), id(0x11));
        service
            .transaction_submit(child, id(1), id(0x11), &txn)
            .unwrap();

        // Wrong height.
        let cert = block_cert(id(0x20), root_id, 5, &[txn.clone()]);
        assert_eq!(
            service.block_make(child, id(0x20), &cert),
            Err(DataError::BlockMakeHeightMismatch)
        );

        // Wrong previous id.
        let cert = block_cert(id(0x20), id(0x77), 1, &[txn.clone()]);
        assert_eq!(
            service.block_make(child, id(0x20), &cert),
            Err(DataError::BlockMakePreviousIdMismatch)
        );

        // Zero block id.
        let cert = block_cert(zero_id(), root_id, 1, &[txn.clone()]);
        assert_eq!(
            service.block_make(child, zero_id(), &cert),
            Err(DataError::BlockMakeBadBlockId)
        );

        // No child transactions.
        let cert = block_cert(id(0x20), root_id, 1, &[]);
        assert_eq!(
            service.block_make(child, id(0x20), &cert),
            Err(DataError::BlockMakeNoChildTransactions)
        );

        // Unknown child transaction rolls everything back.
        let ghost = txn_cert(id(9), id(0x19));
        let cert = block_cert(id(0x20), root_id, 1, &[txn.clone(), ghost]);
        assert_eq!(
            service.block_make(child, id(0x20), &cert),
            Err(DataError::BlockMakeChildTransactionFailure)
        );
        // The queued transaction survived the failed round.
        assert_eq!(
            service.transaction_get_first(child).unwrap().transaction_id,
            id(1)
        );
        assert_eq!(service.block_id_latest_read(child).unwrap(), root_id);
    }

    #[test]
    fn child_close_frees_the_slot() {
        let (mut service, _) = service_with_root();
        let child = full_child(&mut service);
        service.child_context_close(child).unwrap();
        assert_eq!(
            service.block_id_latest_read(child),
            Err(DataError::ChildContextInvalid)
        );
        // Slot is reusable.
        assert_eq!(full_child(&mut service), child);
    }

    #[test]
    fn bad_child_index_rejected() {
        let (service, _) = service_with_root();
        assert_eq!(
            service.block_id_latest_read(MAX_CHILD_CONTEXTS as u32),
            Err(DataError::ChildContextBadIndex)
        );
        assert_eq!(
            service.block_id_latest_read(3),
            Err(DataError::ChildContextInvalid)
        );
    }

    #[test]
    fn settings_round_trip() {
        let (mut service, _) = service_with_root();
        let child = full_child(&mut service);
        assert_eq!(
            service.global_setting_read(child, 0x11),
            Err(DataError::NotFound)
        );
        service
            .global_setting_write(child, 0x11, b"sixteen-tebibyte")
            .unwrap();
        assert_eq!(
            service.global_setting_read(child, 0x11).unwrap(),
            b"sixteen-tebibyte".to_vec()
        );
    }
}
