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

//! On-wire and in-store node encodings.
//!
//! Blocks form a doubly-linked chain rooted at the height-0 block;
//! transactions either sit on the process queue (block id zero) or inside
//! exactly one committed block. All integers are big-endian.

use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use crate::{zero_id, Id};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransactionState {
    Submitted = 0,
    Promoted = 1,
    Committed = 2,
    Canceled = 3,
}

impl TransactionState {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => TransactionState::Submitted,
            1 => TransactionState::Promoted,
            2 => TransactionState::Committed,
            3 => TransactionState::Canceled,
            _ => return None,
        })
    }
}

/// A block node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub block_id: Id,
    pub prev: Id,
    pub next: Id,
    pub first_transaction_id: Id,
    pub height: u64,
    pub cert: Vec<u8>,
}

/// Encoded size of a block record without its certificate.
pub const BLOCK_RECORD_HEADER_SIZE: usize = 16 * 4 + 8 + 8;

impl BlockRecord {
    /// Encodes this record; `with_cert` controls whether the certificate
    /// bytes follow the header. The certificate size field is always the
    /// true size.
    pub fn encode(&self, with_cert: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            BLOCK_RECORD_HEADER_SIZE + if with_cert { self.cert.len() } else { 0 },
        );
        out.extend_from_slice(self.block_id.as_bytes());
        out.extend_from_slice(self.prev.as_bytes());
        out.extend_from_slice(self.next.as_bytes());
        out.extend_from_slice(self.first_transaction_id.as_bytes());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&(self.cert.len() as u64).to_be_bytes());
        if with_cert {
            out.extend_from_slice(&self.cert);
        }
        out
    }

    /// Decodes a record. A payload shorter than its certificate-size field
    /// claims is rejected; a header-only encoding yields an empty cert.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < BLOCK_RECORD_HEADER_SIZE {
            return None;
        }
        let cert_size = BigEndian::read_u64(&raw[72..80]) as usize;
        let cert = match raw.len() - BLOCK_RECORD_HEADER_SIZE {
            0 => Vec::new(),
            len if len == cert_size => raw[BLOCK_RECORD_HEADER_SIZE..].to_vec(),
            _ => return None,
        };
        Some(Self {
            block_id: read_id(&raw[0..16]),
            prev: read_id(&raw[16..32]),
            next: read_id(&raw[32..48]),
            first_transaction_id: read_id(&raw[48..64]),
            height: BigEndian::read_u64(&raw[64..72]),
            cert,
        })
    }
}

/// A transaction node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub transaction_id: Id,
    pub prev: Id,
    pub next: Id,
    pub artifact_id: Id,
    /// Zero while the transaction sits on the process queue.
    pub block_id: Id,
    pub state: TransactionState,
    pub cert: Vec<u8>,
}

/// Encoded size of a transaction record without its certificate.
pub const TRANSACTION_RECORD_HEADER_SIZE: usize = 16 * 5 + 8 + 4;

impl TransactionRecord {
    pub fn encode(&self, with_cert: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            TRANSACTION_RECORD_HEADER_SIZE + if with_cert { self.cert.len() } else { 0 },
        );
        out.extend_from_slice(self.transaction_id.as_bytes());
        out.extend_from_slice(self.prev.as_bytes());
        out.extend_from_slice(self.next.as_bytes());
        out.extend_from_slice(self.artifact_id.as_bytes());
        out.extend_from_slice(self.block_id.as_bytes());
        out.extend_from_slice(&(self.cert.len() as u64).to_be_bytes());
        out.extend_from_slice(&(self.state as u32).to_be_bytes());
        if with_cert {
            out.extend_from_slice(&self.cert);
        }
        out
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < TRANSACTION_RECORD_HEADER_SIZE {
            return None;
        }
        let cert_size = BigEndian::read_u64(&raw[80..88]) as usize;
        let state = TransactionState::from_u32(BigEndian::read_u32(&raw[88..92]))?;
        let cert = match raw.len() - TRANSACTION_RECORD_HEADER_SIZE {
            0 => Vec::new(),
            len if len == cert_size => raw[TRANSACTION_RECORD_HEADER_SIZE..].to_vec(),
            _ => return None,
        };
        Some(Self {
            transaction_id: read_id(&raw[0..16]),
            prev: read_id(&raw[16..32]),
            next: read_id(&raw[32..48]),
            artifact_id: read_id(&raw[48..64]),
            block_id: read_id(&raw[64..80]),
            state,
            cert,
        })
    }

    /// Whether this record is a process-queue entry.
    pub fn on_queue(&self) -> bool {
        self.block_id == zero_id()
            && matches!(
                self.state,
                TransactionState::Submitted | TransactionState::Promoted
            )
    }
}

/// An artifact node: the identity whose current state is its latest
/// committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub artifact_id: Id,
    pub latest_transaction_id: Id,
    pub state: u32,
}

/// Encoded size of an artifact record.
pub const ARTIFACT_RECORD_SIZE: usize = 16 * 2 + 4;

impl ArtifactRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ARTIFACT_RECORD_SIZE);
        out.extend_from_slice(self.artifact_id.as_bytes());
        out.extend_from_slice(self.latest_transaction_id.as_bytes());
        out.extend_from_slice(&self.state.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != ARTIFACT_RECORD_SIZE {
            return None;
        }
        Some(Self {
            artifact_id: read_id(&raw[0..16]),
            latest_transaction_id: read_id(&raw[16..32]),
            state: BigEndian::read_u32(&raw[32..36]),
        })
    }
}

fn read_id(raw: &[u8]) -> Id {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(raw);
    Uuid::from_bytes(bytes)
}
