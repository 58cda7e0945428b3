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

//! Notification service wire encoding and client helpers.
//!
//! Requests are `[method : u32][offset : u64][payload]`; responses are
//! `[method : u32][offset : u64][status : u32][payload]`. Offsets are
//! 64-bit on this service: they key assertions per connection and are
//! chosen by the caller.
//!
//! Response disambiguation at an asserted offset: the registration
//! acknowledgment has an empty payload, an invalidation carries the
//! 16-byte new latest block id, and a cancel acknowledgment arrives under
//! the cancel method id.

use byteorder::{BigEndian, ByteOrder};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::bitcap::Bitcap;
use crate::ipc::frame::Packet;
use crate::ipc::IpcCodec;
use crate::status::{IpcError, StatusWord, STATUS_SUCCESS};
use crate::Id;

use super::method::ApiMethod;

/// Failure of a notification-service API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("notification service returned status {0:#010x}")]
    Status(StatusWord),
    #[error("malformed notification service message")]
    Malformed,
    #[error("notification service connection closed")]
    Closed,
}

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: u32,
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub method: u32,
    pub offset: u64,
    pub status: StatusWord,
    pub payload: Vec<u8>,
}

impl Response {
    /// Whether this response is an invalidation at an asserted offset.
    pub fn is_invalidation(&self) -> bool {
        self.method == ApiMethod::BlockAssertion as u32
            && self.status == STATUS_SUCCESS
            && self.payload.len() == 16
    }

    /// The new latest block id carried by an invalidation.
    pub fn invalidation_block_id(&self) -> Option<Id> {
        if !self.is_invalidation() {
            return None;
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.payload);
        Some(Uuid::from_bytes(bytes))
    }
}

/// Encodes a request frame.
pub fn encode_request(method: ApiMethod, offset: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&(method as u32).to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decodes a request frame.
pub fn decode_request(raw: &[u8]) -> Result<Request, ApiError> {
    if raw.len() < 12 {
        return Err(ApiError::Malformed);
    }
    Ok(Request {
        method: BigEndian::read_u32(&raw[0..4]),
        offset: BigEndian::read_u64(&raw[4..12]),
        payload: raw[12..].to_vec(),
    })
}

/// Encodes a response frame.
pub fn encode_response(method: u32, offset: u64, status: StatusWord, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(&method.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decodes a response frame.
pub fn decode_response(raw: &[u8]) -> Result<Response, ApiError> {
    if raw.len() < 16 {
        return Err(ApiError::Malformed);
    }
    Ok(Response {
        method: BigEndian::read_u32(&raw[0..4]),
        offset: BigEndian::read_u64(&raw[4..12]),
        status: BigEndian::read_u32(&raw[12..16]),
        payload: raw[16..].to_vec(),
    })
}

/// Call-style client for peers whose only unsolicited traffic is their own
/// acknowledgments (the canonization service). Peers that receive pushed
/// invalidations route raw frames instead.
#[derive(Debug)]
pub struct NotifyApi {
    framed: Framed<tokio::net::UnixStream, IpcCodec>,
}

impl NotifyApi {
    pub fn new(stream: tokio::net::UnixStream) -> Self {
        Self {
            framed: Framed::new(stream, IpcCodec::new()),
        }
    }

    async fn call(
        &mut self,
        method: ApiMethod,
        offset: u64,
        payload: &[u8],
    ) -> Result<Response, ApiError> {
        self.framed
            .send(Packet::Data(encode_request(method, offset, payload)))
            .await?;
        let frame = self.framed.next().await.ok_or(ApiError::Closed)??;
        let raw = match frame {
            Packet::Data(raw) => raw,
            _ => return Err(ApiError::Malformed),
        };
        let response = decode_response(&raw)?;
        if response.method != method as u32 || response.offset != offset {
            return Err(ApiError::Malformed);
        }
        if response.status != STATUS_SUCCESS {
            return Err(ApiError::Status(response.status));
        }
        Ok(response)
    }

    /// Reduces this connection's capabilities.
    pub async fn reduce_caps(&mut self, offset: u64, caps: &Bitcap) -> Result<(), ApiError> {
        self.call(ApiMethod::ReduceCaps, offset, &caps.to_bytes())
            .await?;
        Ok(())
    }

    /// Announces a new latest block id. Resolves once every invalidation
    /// for the update has been enqueued.
    pub async fn block_update(&mut self, offset: u64, block_id: Id) -> Result<(), ApiError> {
        self.call(ApiMethod::BlockUpdate, offset, block_id.as_bytes())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(tail: u8) -> Id {
        let mut bytes = [0u8; 16];
        bytes[15] = tail;
        Uuid::from_bytes(bytes)
    }

    #[test]
    fn request_round_trip() {
        let raw = encode_request(ApiMethod::BlockAssertion, 1000, id(3).as_bytes());
        let request = decode_request(&raw).unwrap();
        assert_eq!(request.method, ApiMethod::BlockAssertion as u32);
        assert_eq!(request.offset, 1000);
        assert_eq!(request.payload, id(3).as_bytes().to_vec());
    }

    #[test]
    fn response_round_trip() {
        let raw = encode_response(
            ApiMethod::BlockUpdate as u32,
            7474,
            STATUS_SUCCESS,
            &[],
        );
        let response = decode_response(&raw).unwrap();
        assert_eq!(response.method, ApiMethod::BlockUpdate as u32);
        assert_eq!(response.offset, 7474);
        assert_eq!(response.status, STATUS_SUCCESS);
        assert!(response.payload.is_empty());
    }

    #[test]
    fn short_frames_rejected() {
        assert!(decode_request(&[0u8; 11]).is_err());
        assert!(decode_response(&[0u8; 15]).is_err());
    }

    #[test]
    fn invalidation_discrimination() {
        // Ack: empty payload.
        let ack = decode_response(&encode_response(
            ApiMethod::BlockAssertion as u32,
            5,
            STATUS_SUCCESS,
            &[],
        ))
        .unwrap();
        assert!(!ack.is_invalidation());

        // Invalidation: 16-byte new block id.
        let invalidation = decode_response(&encode_response(
            ApiMethod::BlockAssertion as u32,
            5,
            STATUS_SUCCESS,
            id(9).as_bytes(),
        ))
        .unwrap();
        assert!(invalidation.is_invalidation());
        assert_eq!(invalidation.invalidation_block_id(), Some(id(9)));

        // Cancel ack: cancel method id.
        let cancel = decode_response(&encode_response(
            ApiMethod::BlockAssertionCancel as u32,
            5,
            STATUS_SUCCESS,
            &[],
        ))
        .unwrap();
        assert!(!cancel.is_invalidation());
    }

    #[test]
    fn offset_is_sixty_four_bits() {
        let raw = encode_request(ApiMethod::BlockAssertionCancel, u64::MAX - 1, &[]);
        let request = decode_request(&raw).unwrap();
        assert_eq!(request.offset, u64::MAX - 1);
    }
}
