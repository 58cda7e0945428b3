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

//! Inter-process framing.
//!
//! Every packet on an inter-service socket is a typed, length-prefixed
//! frame: a 4-byte big-endian type tag, then for variable-length types a
//! 4-byte big-endian size and the payload. [`frame`] provides the blocking
//! reader/writer pairs used by the supervisor and simple clients; [`codec`]
//! provides the `tokio_util` codec used inside event-loop services; and
//! [`authed`] layers the encrypted, authenticated packet format over the
//! same framing for client-facing edges.

pub mod authed;
pub mod codec;
pub mod frame;

pub use self::authed::{read_authed_data, write_authed_data, AuthedCodec, AuthedSession};
pub use self::codec::IpcCodec;
pub use self::frame::{Packet, MAX_PAYLOAD_SIZE};

/// Wire type tags. Only `TYPE_AUTHED_PACKET` is externally pinned; the rest
/// are stable constants of the inter-service ABI.
pub mod wire_type {
    pub const INT8: u32 = 0x0000_0010;
    pub const UINT8: u32 = 0x0000_0011;
    pub const INT64: u32 = 0x0000_0018;
    pub const UINT64: u32 = 0x0000_0019;
    pub const STRING: u32 = 0x0000_0020;
    pub const DATA: u32 = 0x0000_0022;
    pub const AUTHED_PACKET: u32 = 0x0000_0030;
}
