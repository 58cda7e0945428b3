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

//! Client-facing protocol request/response encoding.
//!
//! After the handshake every frame is an authenticated packet whose
//! plaintext is `[request_id : u32][offset : u32][body]` for requests and
//! `[request_id : u32][offset : u32][status : u32][payload]` for
//! responses. The offset is client-chosen and echoed on every response
//! belonging to it, across service hops.

use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use crate::status::StatusWord;
use crate::Id;

use super::capabilities;

/// Client request ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestId {
    HandshakeInitiate = 0x0000_0000,
    HandshakeAcknowledge = 0x0000_0001,
    LatestBlockIdGet = 0x0000_0002,
    TransactionSubmit = 0x0000_0003,
    BlockById = 0x0000_0004,
    BlockIdByHeight = 0x0000_0005,
    TransactionById = 0x0000_0006,
    ArtifactById = 0x0000_0007,
    AssertLatestBlockId = 0x0000_0008,
    AssertLatestBlockIdCancel = 0x0000_0009,
    ExtendedApiEnable = 0x0000_000A,
    ExtendedApiSendRecv = 0x0000_000B,
    ExtendedApiResponse = 0x0000_000C,
    Close = 0x0000_000D,
}

/// One past the last valid request id.
pub const REQUEST_UPPER_BOUND: u32 = RequestId::Close as u32 + 1;

impl RequestId {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0x0000_0000 => RequestId::HandshakeInitiate,
            0x0000_0001 => RequestId::HandshakeAcknowledge,
            0x0000_0002 => RequestId::LatestBlockIdGet,
            0x0000_0003 => RequestId::TransactionSubmit,
            0x0000_0004 => RequestId::BlockById,
            0x0000_0005 => RequestId::BlockIdByHeight,
            0x0000_0006 => RequestId::TransactionById,
            0x0000_0007 => RequestId::ArtifactById,
            0x0000_0008 => RequestId::AssertLatestBlockId,
            0x0000_0009 => RequestId::AssertLatestBlockIdCancel,
            0x0000_000A => RequestId::ExtendedApiEnable,
            0x0000_000B => RequestId::ExtendedApiSendRecv,
            0x0000_000C => RequestId::ExtendedApiResponse,
            0x0000_000D => RequestId::Close,
            _ => return None,
        })
    }

    /// The capability verb this request requires, once authenticated.
    /// Handshake requests and `Close` are not capability-gated.
    pub fn required_verb(self) -> Option<Uuid> {
        Some(match self {
            RequestId::HandshakeInitiate
            | RequestId::HandshakeAcknowledge
            | RequestId::Close => return None,
            RequestId::LatestBlockIdGet => capabilities::CAP_BLOCK_ID_LATEST_READ,
            RequestId::TransactionSubmit => capabilities::CAP_TRANSACTION_SUBMIT,
            RequestId::BlockById => capabilities::CAP_BLOCK_READ,
            RequestId::BlockIdByHeight => capabilities::CAP_BLOCK_ID_BY_HEIGHT_READ,
            RequestId::TransactionById => capabilities::CAP_TRANSACTION_READ,
            RequestId::ArtifactById => capabilities::CAP_ARTIFACT_READ,
            RequestId::AssertLatestBlockId => capabilities::CAP_ASSERT_LATEST_BLOCK_ID,
            RequestId::AssertLatestBlockIdCancel => {
                capabilities::CAP_ASSERT_LATEST_BLOCK_ID_CANCEL
            }
            RequestId::ExtendedApiEnable => capabilities::CAP_EXTENDED_API_ENABLE,
            RequestId::ExtendedApiSendRecv => capabilities::CAP_EXTENDED_API_SENDRECV,
            RequestId::ExtendedApiResponse => capabilities::CAP_EXTENDED_API_RESP,
        })
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: u32,
    pub offset: u32,
    pub body: Vec<u8>,
}

/// Decodes a request plaintext.
pub fn decode_request(raw: &[u8]) -> Option<Request> {
    if raw.len() < 8 {
        return None;
    }
    Some(Request {
        request_id: BigEndian::read_u32(&raw[0..4]),
        offset: BigEndian::read_u32(&raw[4..8]),
        body: raw[8..].to_vec(),
    })
}

/// Encodes a request plaintext.
pub fn encode_request(request_id: RequestId, offset: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(request_id as u32).to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// A decoded response plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: u32,
    pub offset: u32,
    pub status: StatusWord,
    pub payload: Vec<u8>,
}

/// Encodes a response plaintext.
pub fn encode_response(
    request_id: u32,
    offset: u32,
    status: StatusWord,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decodes a response plaintext.
pub fn decode_response(raw: &[u8]) -> Option<Response> {
    if raw.len() < 12 {
        return None;
    }
    Some(Response {
        request_id: BigEndian::read_u32(&raw[0..4]),
        offset: BigEndian::read_u32(&raw[4..8]),
        status: BigEndian::read_u32(&raw[8..12]),
        payload: raw[12..].to_vec(),
    })
}

/// Reads a 16-byte id from the front of a body.
pub fn body_id(body: &[u8]) -> Option<Id> {
    if body.len() < 16 {
        return None;
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&body[..16]);
    Some(Uuid::from_bytes(bytes))
}
