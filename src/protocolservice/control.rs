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

//! Supervisor-only control socket of the protocol service.
//!
//! The supervisor installs the agent key, the authorized entities and
//! their capability triples, then finalizes. After finalize every further
//! control request fails; the daemon's authorization set is immutable
//! while it runs.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use uuid::Uuid;

use std::os::unix::net::UnixStream;

use crate::ipc::frame;
use crate::status::{IpcError, StatusWord, STATUS_SUCCESS};
use crate::Id;

/// Methods on the protocol service control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlMethod {
    /// `[entity : 16][encryption pubkey : 32][signing pubkey : 32]`
    AuthEntityAdd = 0,
    /// `[subject : 16][verb : 16][object : 16]`
    CapabilityAdd = 1,
    /// `[agent entity : 16][agreement secret : 32]`
    PrivateKeySet = 2,
    /// Empty body; locks the control surface.
    Finalize = 3,
}

/// One past the last valid method id.
pub const METHOD_UPPER_BOUND: u32 = ControlMethod::Finalize as u32 + 1;

impl ControlMethod {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ControlMethod::AuthEntityAdd,
            1 => ControlMethod::CapabilityAdd,
            2 => ControlMethod::PrivateKeySet,
            3 => ControlMethod::Finalize,
            _ => return None,
        })
    }
}

/// Failure of a control API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("protocol service returned status {0:#010x}")]
    Status(StatusWord),
    #[error("malformed protocol service response")]
    Malformed,
}

/// A decoded control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub method: u32,
    pub offset: u32,
    pub payload: Vec<u8>,
}

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

pub fn encode_response(method: u32, offset: u32, status: StatusWord) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&method.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&status.to_be_bytes());
    out
}

/// Decodes an auth-entity-add body.
pub fn decode_entity_add(payload: &[u8]) -> Option<(Id, [u8; 32], [u8; 32])> {
    if payload.len() != 80 {
        return None;
    }
    let mut entity = [0u8; 16];
    entity.copy_from_slice(&payload[0..16]);
    let mut encryption = [0u8; 32];
    encryption.copy_from_slice(&payload[16..48]);
    let mut signing = [0u8; 32];
    signing.copy_from_slice(&payload[48..80]);
    Some((Uuid::from_bytes(entity), encryption, signing))
}

/// Decodes a capability-add body.
pub fn decode_capability_add(payload: &[u8]) -> Option<(Id, Uuid, Id)> {
    if payload.len() != 48 {
        return None;
    }
    let read = |range: std::ops::Range<usize>| {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&payload[range]);
        Uuid::from_bytes(bytes)
    };
    Some((read(0..16), read(16..32), read(32..48)))
}

/// Decodes a private-key-set body.
pub fn decode_private_key_set(payload: &[u8]) -> Option<(Id, [u8; 32])> {
    if payload.len() != 48 {
        return None;
    }
    let mut entity = [0u8; 16];
    entity.copy_from_slice(&payload[0..16]);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&payload[16..48]);
    Some((Uuid::from_bytes(entity), secret))
}

fn request(method: ControlMethod, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(method as u32).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn blocking_call(sock: &mut UnixStream, method: ControlMethod, body: &[u8]) -> Result<(), ApiError> {
    frame::write_data(sock, &request(method, body))?;
    let raw = frame::read_data(sock)?;
    if raw.len() < 12 || BigEndian::read_u32(&raw[0..4]) != method as u32 {
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

    pub fn auth_entity_add(
        sock: &mut UnixStream,
        entity: Id,
        encryption_key: &[u8; 32],
        signing_key: &[u8; 32],
    ) -> Result<(), ApiError> {
        let mut body = Vec::with_capacity(80);
        body.extend_from_slice(entity.as_bytes());
        body.extend_from_slice(encryption_key);
        body.extend_from_slice(signing_key);
        blocking_call(sock, ControlMethod::AuthEntityAdd, &body)
    }

    pub fn capability_add(
        sock: &mut UnixStream,
        subject: Id,
        verb: Uuid,
        object: Id,
    ) -> Result<(), ApiError> {
        let mut body = Vec::with_capacity(48);
        body.extend_from_slice(subject.as_bytes());
        body.extend_from_slice(verb.as_bytes());
        body.extend_from_slice(object.as_bytes());
        blocking_call(sock, ControlMethod::CapabilityAdd, &body)
    }

    pub fn private_key_set(
        sock: &mut UnixStream,
        agent: Id,
        agreement_secret: &[u8; 32],
    ) -> Result<(), ApiError> {
        let mut body = Vec::with_capacity(48);
        body.extend_from_slice(agent.as_bytes());
        body.extend_from_slice(agreement_secret);
        blocking_call(sock, ControlMethod::PrivateKeySet, &body)
    }

    pub fn finalize(sock: &mut UnixStream) -> Result<(), ApiError> {
        blocking_call(sock, ControlMethod::Finalize, &[])
    }
}
