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

//! Canonization service control API.
//!
//! The supervisor drives this socket exactly once at startup: configure
//! the timer and batch cap, install the signing key, then start. Requests
//! out of that order fail without side effects.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use uuid::Uuid;

use std::os::unix::net::UnixStream;

use crate::ipc::frame;
use crate::status::{IpcError, StatusWord, STATUS_SUCCESS};
use crate::Id;

/// Methods on the canonization control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlMethod {
    Configure = 0,
    PrivateKeySet = 1,
    Start = 2,
}

/// One past the last valid method id.
pub const METHOD_UPPER_BOUND: u32 = ControlMethod::Start as u32 + 1;

impl ControlMethod {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ControlMethod::Configure,
            1 => ControlMethod::PrivateKeySet,
            2 => ControlMethod::Start,
            _ => return None,
        })
    }
}

/// Failure of a control API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("canonization service returned status {0:#010x}")]
    Status(StatusWord),
    #[error("malformed canonization service response")]
    Malformed,
}

/// A decoded control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub method: u32,
    pub offset: u32,
    pub payload: Vec<u8>,
}

/// Decodes `[method][offset][payload]`.
pub fn decode_request(raw: &[u8]) -> Option<ControlRequest> {
    if raw.len() < 8 {
        return None;
    }
    Some(ControlRequest {
        method: BigEndian::read_u32(&raw[0..4]),
        offset: BigEndian::read_u32(&raw[4..8]),
        payload: raw[8..].to_vec(),
    })
}

/// Encodes a control response.
pub fn encode_response(method: u32, offset: u32, status: StatusWord) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&method.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&status.to_be_bytes());
    out
}

/// Encodes a configure request body.
pub fn encode_configure(block_max_milliseconds: u64, block_max_transactions: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(12);
    body.extend_from_slice(&block_max_milliseconds.to_be_bytes());
    body.extend_from_slice(&block_max_transactions.to_be_bytes());
    body
}

/// Decodes a configure request body.
pub fn decode_configure(payload: &[u8]) -> Option<(u64, u32)> {
    if payload.len() != 12 {
        return None;
    }
    Some((
        BigEndian::read_u64(&payload[0..8]),
        BigEndian::read_u32(&payload[8..12]),
    ))
}

/// Encodes a private-key-set request body.
pub fn encode_private_key(entity_id: Id, signing_key: &[u8; 32]) -> Vec<u8> {
    let mut body = Vec::with_capacity(48);
    body.extend_from_slice(entity_id.as_bytes());
    body.extend_from_slice(signing_key);
    body
}

/// Decodes a private-key-set request body.
pub fn decode_private_key(payload: &[u8]) -> Option<(Id, [u8; 32])> {
    if payload.len() != 48 {
        return None;
    }
    let mut entity = [0u8; 16];
    entity.copy_from_slice(&payload[0..16]);
    let mut key = [0u8; 32];
    key.copy_from_slice(&payload[16..48]);
    Some((Uuid::from_bytes(entity), key))
}

fn request(method: ControlMethod, offset: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(method as u32).to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn blocking_call(
    sock: &mut UnixStream,
    method: ControlMethod,
    body: &[u8],
) -> Result<(), ApiError> {
    frame::write_data(sock, &request(method, 0, body))?;
    let raw = frame::read_data(sock)?;
    if raw.len() < 12 {
        return Err(ApiError::Malformed);
    }
    if BigEndian::read_u32(&raw[0..4]) != method as u32 {
        return Err(ApiError::Malformed);
    }
    let response_status = BigEndian::read_u32(&raw[8..12]);
    if response_status != STATUS_SUCCESS {
        return Err(ApiError::Status(response_status));
    }
    Ok(())
}

/// Supervisor-side blocking calls.
pub mod blocking {
    use super::*;

    pub fn configure(
        sock: &mut UnixStream,
        block_max_milliseconds: u64,
        block_max_transactions: u32,
    ) -> Result<(), ApiError> {
        blocking_call(
            sock,
            ControlMethod::Configure,
            &encode_configure(block_max_milliseconds, block_max_transactions),
        )
    }

    pub fn private_key_set(
        sock: &mut UnixStream,
        entity_id: Id,
        signing_key: &[u8; 32],
    ) -> Result<(), ApiError> {
        blocking_call(
            sock,
            ControlMethod::PrivateKeySet,
            &encode_private_key(entity_id, signing_key),
        )
    }

    pub fn start(sock: &mut UnixStream) -> Result<(), ApiError> {
        blocking_call(sock, ControlMethod::Start, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status;

    #[test]
    fn configure_body_round_trips() {
        let body = encode_configure(5000, 500);
        assert_eq!(decode_configure(&body), Some((5000, 500)));
        assert_eq!(decode_configure(&body[..10]), None);
    }

    #[test]
    fn private_key_body_round_trips() {
        let entity = Uuid::new_v4();
        let body = encode_private_key(entity, &[9u8; 32]);
        let (decoded_entity, decoded_key) = decode_private_key(&body).unwrap();
        assert_eq!(decoded_entity, entity);
        assert_eq!(decoded_key, [9u8; 32]);
    }

    #[test]
    fn response_layout() {
        let resp = encode_response(
            ControlMethod::Start as u32,
            0,
            status::canonization::NOT_CONFIGURED,
        );
        assert_eq!(BigEndian::read_u32(&resp[0..4]), ControlMethod::Start as u32);
        assert_eq!(
            BigEndian::read_u32(&resp[8..12]),
            status::canonization::NOT_CONFIGURED
        );
    }
}
