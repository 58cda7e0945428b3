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

//! Data service method ids and capability bit indices.

/// Methods on the data service control socket.
///
/// Values are wire constants between the lower and upper bound sentinels;
/// anything outside the range is rejected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ApiMethod {
    RootContextCreate = 0,
    RootContextReduceCaps = 1,
    ChildContextCreate = 2,
    ChildContextClose = 3,
    GlobalSettingRead = 4,
    GlobalSettingWrite = 5,
    BlockIdLatestRead = 6,
    BlockIdByHeightRead = 7,
    BlockRead = 8,
    TransactionSubmit = 9,
    TransactionGetFirst = 10,
    TransactionGet = 11,
    TransactionDrop = 12,
    TransactionPromote = 13,
    CanonizedTransactionRead = 14,
    ArtifactRead = 15,
    BlockMake = 16,
}

/// First valid method id.
pub const METHOD_LOWER_BOUND: u32 = ApiMethod::RootContextCreate as u32;

/// One past the last valid method id.
pub const METHOD_UPPER_BOUND: u32 = ApiMethod::BlockMake as u32 + 1;

impl ApiMethod {
    /// Decodes a wire method id.
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ApiMethod::RootContextCreate,
            1 => ApiMethod::RootContextReduceCaps,
            2 => ApiMethod::ChildContextCreate,
            3 => ApiMethod::ChildContextClose,
            4 => ApiMethod::GlobalSettingRead,
            5 => ApiMethod::GlobalSettingWrite,
            6 => ApiMethod::BlockIdLatestRead,
            7 => ApiMethod::BlockIdByHeightRead,
            8 => ApiMethod::BlockRead,
            9 => ApiMethod::TransactionSubmit,
            10 => ApiMethod::TransactionGetFirst,
            11 => ApiMethod::TransactionGet,
            12 => ApiMethod::TransactionDrop,
            13 => ApiMethod::TransactionPromote,
            14 => ApiMethod::CanonizedTransactionRead,
            15 => ApiMethod::ArtifactRead,
            16 => ApiMethod::BlockMake,
            _ => return None,
        })
    }
}

/// Capability bit indices. The width is a shared ABI constant: every peer
/// that ships a bitcap for this service encodes exactly [`cap::BITS`] bits.
pub mod cap {
    pub const LL_ROOT_CONTEXT_CREATE: usize = 0;
    pub const LL_ROOT_CONTEXT_REDUCE_CAPS: usize = 1;
    pub const CHILD_CONTEXT_CREATE: usize = 2;
    pub const CHILD_CONTEXT_CLOSE: usize = 3;
    pub const GLOBAL_SETTING_READ: usize = 4;
    pub const GLOBAL_SETTING_WRITE: usize = 5;
    pub const BLOCK_ID_LATEST_READ: usize = 6;
    pub const BLOCK_ID_BY_HEIGHT_READ: usize = 7;
    pub const BLOCK_READ: usize = 8;
    pub const PQ_TRANSACTION_SUBMIT: usize = 9;
    pub const PQ_TRANSACTION_FIRST_READ: usize = 10;
    pub const PQ_TRANSACTION_READ: usize = 11;
    pub const PQ_TRANSACTION_DROP: usize = 12;
    pub const PQ_TRANSACTION_PROMOTE: usize = 13;
    pub const TRANSACTION_READ: usize = 14;
    pub const ARTIFACT_READ: usize = 15;
    pub const BLOCK_WRITE: usize = 16;

    /// Width of the data-service capability bitmap.
    pub const BITS: usize = 17;
}

impl ApiMethod {
    /// The capability bit gating this method, if it is capability-gated.
    ///
    /// The two root-context methods are gated by the root bitcap; child
    /// methods by the child's bitcap.
    pub fn required_cap(self) -> usize {
        match self {
            ApiMethod::RootContextCreate => cap::LL_ROOT_CONTEXT_CREATE,
            ApiMethod::RootContextReduceCaps => cap::LL_ROOT_CONTEXT_REDUCE_CAPS,
            ApiMethod::ChildContextCreate => cap::CHILD_CONTEXT_CREATE,
            ApiMethod::ChildContextClose => cap::CHILD_CONTEXT_CLOSE,
            ApiMethod::GlobalSettingRead => cap::GLOBAL_SETTING_READ,
            ApiMethod::GlobalSettingWrite => cap::GLOBAL_SETTING_WRITE,
            ApiMethod::BlockIdLatestRead => cap::BLOCK_ID_LATEST_READ,
            ApiMethod::BlockIdByHeightRead => cap::BLOCK_ID_BY_HEIGHT_READ,
            ApiMethod::BlockRead => cap::BLOCK_READ,
            ApiMethod::TransactionSubmit => cap::PQ_TRANSACTION_SUBMIT,
            ApiMethod::TransactionGetFirst => cap::PQ_TRANSACTION_FIRST_READ,
            ApiMethod::TransactionGet => cap::PQ_TRANSACTION_READ,
            ApiMethod::TransactionDrop => cap::PQ_TRANSACTION_DROP,
            ApiMethod::TransactionPromote => cap::PQ_TRANSACTION_PROMOTE,
            ApiMethod::CanonizedTransactionRead => cap::TRANSACTION_READ,
            ApiMethod::ArtifactRead => cap::ARTIFACT_READ,
            ApiMethod::BlockMake => cap::BLOCK_WRITE,
        }
    }
}
