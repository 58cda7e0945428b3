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

//! Notification service method ids and capability bits.

/// Methods on a notification service client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ApiMethod {
    ReduceCaps = 0,
    BlockUpdate = 1,
    BlockAssertion = 2,
    BlockAssertionCancel = 3,
}

/// First valid method id.
pub const METHOD_LOWER_BOUND: u32 = ApiMethod::ReduceCaps as u32;

/// One past the last valid method id.
pub const METHOD_UPPER_BOUND: u32 = ApiMethod::BlockAssertionCancel as u32 + 1;

impl ApiMethod {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ApiMethod::ReduceCaps,
            1 => ApiMethod::BlockUpdate,
            2 => ApiMethod::BlockAssertion,
            3 => ApiMethod::BlockAssertionCancel,
            _ => return None,
        })
    }
}

/// Capability bit indices. Reducing capabilities is always permitted; it
/// can only shrink the set.
pub mod cap {
    pub const BLOCK_UPDATE: usize = 0;
    pub const BLOCK_ASSERTION: usize = 1;
    pub const BLOCK_ASSERTION_CANCEL: usize = 2;

    /// Width of the notification-service capability bitmap.
    pub const BITS: usize = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_ids_round_trip() {
        for raw in METHOD_LOWER_BOUND..METHOD_UPPER_BOUND {
            assert_eq!(ApiMethod::from_u32(raw).unwrap() as u32, raw);
        }
        assert!(ApiMethod::from_u32(METHOD_UPPER_BOUND).is_none());
    }
}
