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

//! The auth service.
//!
//! Holds the agent identity for the lifetime of the daemon: one-shot
//! initialization with the agent entity id and encryption keypair, after
//! which only reads succeed. A second initialization attempt fails and
//! leaves the stored identity untouched.

use byteorder::{BigEndian, ByteOrder};
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::bitcap::Bitcap;
use crate::ipc::frame::Packet;
use crate::ipc::IpcCodec;
use crate::status::{self, StatusWord, STATUS_SUCCESS};
use crate::Id;

/// Capability bit indices for the auth service.
pub mod cap {
    pub const INITIALIZE: usize = 0;
    pub const GET: usize = 1;

    /// Width of the auth-service capability bitmap.
    pub const BITS: usize = 2;
}

/// Methods on the auth service control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ApiMethod {
    /// Accept the agent id and encryption keypair. One-shot.
    Initialize = 0,
    /// Read back the agent id and public key.
    Get = 1,
}

/// One past the last valid method id.
pub const METHOD_UPPER_BOUND: u32 = ApiMethod::Get as u32 + 1;

impl ApiMethod {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ApiMethod::Initialize,
            1 => ApiMethod::Get,
            _ => return None,
        })
    }
}

/// Initialize request body: entity id, then the 32-byte public and private
/// encryption keys.
pub const INITIALIZE_BODY_SIZE: usize = 16 + 32 + 32;

/// The stored agent identity.
#[derive(Debug)]
struct AgentIdentity {
    entity_id: Id,
    public_key: [u8; 32],
    // Held for hand-off to services that request it at startup.
    #[allow(dead_code)]
    private_key: [u8; 32],
}

/// One auth service instance.
///
/// The capability bitmap only ever shrinks: accepting an identity clears
/// the initialize bit, so the one-shot property holds even if the stored
/// identity were ever torn down.
#[derive(Debug)]
pub struct AuthService {
    caps: Bitcap,
    identity: Option<AgentIdentity>,
}

impl Default for AuthService {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthService {
    pub fn new() -> Self {
        Self {
            caps: Bitcap::new_true(cap::BITS),
            identity: None,
        }
    }

    /// Handles one request frame.
    pub fn dispatch(&mut self, req: &[u8]) -> Vec<u8> {
        if req.len() < 8 {
            return encode_response(0, 0, status::auth::REQUEST_PACKET_INVALID_SIZE, &[]);
        }
        let raw_method = BigEndian::read_u32(&req[0..4]);
        let offset = BigEndian::read_u32(&req[4..8]);
        let body = &req[8..];

        let method = match ApiMethod::from_u32(raw_method) {
            Some(method) => method,
            None => {
                return encode_response(raw_method, offset, status::auth::INVALID_REQUEST_ID, &[]);
            }
        };

        match method {
            ApiMethod::Initialize => {
                if body.len() != INITIALIZE_BODY_SIZE {
                    return encode_response(
                        raw_method,
                        offset,
                        status::auth::REQUEST_PACKET_INVALID_SIZE,
                        &[],
                    );
                }
                if self.identity.is_some() || !self.caps.is_set(cap::INITIALIZE) {
                    return encode_response(
                        raw_method,
                        offset,
                        status::auth::ALREADY_INITIALIZED,
                        &[],
                    );
                }
                let mut entity = [0u8; 16];
                entity.copy_from_slice(&body[0..16]);
                let mut public_key = [0u8; 32];
                public_key.copy_from_slice(&body[16..48]);
                let mut private_key = [0u8; 32];
                private_key.copy_from_slice(&body[48..80]);
                self.identity = Some(AgentIdentity {
                    entity_id: Uuid::from_bytes(entity),
                    public_key,
                    private_key,
                });
                self.caps.set(cap::INITIALIZE, false);
                info!("agent identity installed");
                encode_response(raw_method, offset, STATUS_SUCCESS, &[])
            }
            ApiMethod::Get => {
                if !body.is_empty() {
                    return encode_response(
                        raw_method,
                        offset,
                        status::auth::REQUEST_PACKET_INVALID_SIZE,
                        &[],
                    );
                }
                if !self.caps.is_set(cap::GET) {
                    return encode_response(
                        raw_method,
                        offset,
                        status::auth::NOT_INITIALIZED,
                        &[],
                    );
                }
                match &self.identity {
                    Some(identity) => {
                        let mut payload = Vec::with_capacity(48);
                        payload.extend_from_slice(identity.entity_id.as_bytes());
                        payload.extend_from_slice(&identity.public_key);
                        encode_response(raw_method, offset, STATUS_SUCCESS, &payload)
                    }
                    None => {
                        encode_response(raw_method, offset, status::auth::NOT_INITIALIZED, &[])
                    }
                }
            }
        }
    }
}

fn encode_response(method: u32, offset: u32, status: StatusWord, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&method.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encodes an initialize request.
pub fn encode_initialize(offset: u32, entity_id: Id, public_key: &[u8; 32], private_key: &[u8; 32]) -> Vec<u8> {
    let mut req = Vec::with_capacity(8 + INITIALIZE_BODY_SIZE);
    req.extend_from_slice(&(ApiMethod::Initialize as u32).to_be_bytes());
    req.extend_from_slice(&offset.to_be_bytes());
    req.extend_from_slice(entity_id.as_bytes());
    req.extend_from_slice(public_key);
    req.extend_from_slice(private_key);
    req
}

/// Serves the control socket until the peer closes it.
pub async fn run(stream: tokio::net::UnixStream) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, IpcCodec::new());
    let mut service = AuthService::new();
    info!("auth service ready");
    while let Some(frame) = framed.next().await {
        let request = match frame? {
            Packet::Data(request) => request,
            other => {
                warn!("unexpected packet type {:#010x}", other.wire_type());
                anyhow::bail!("unexpected packet type on control socket");
            }
        };
        let response = service.dispatch(&request);
        framed.send(Packet::Data(response)).await?;
    }
    Ok(())
}
