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

//! The random service.
//!
//! Produces N bytes from the OS entropy source per request. Keeping the
//! entropy read in its own chrooted process means the protocol service
//! never needs direct device access for nonces.

use byteorder::{BigEndian, ByteOrder};
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio_util::codec::Framed;

use crate::ipc::frame::Packet;
use crate::ipc::{IpcCodec, MAX_PAYLOAD_SIZE};
use crate::status::{self, IpcError, StatusWord, STATUS_SUCCESS};

/// The one method on the random service control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ApiMethod {
    RandomBytesGet = 0,
}

/// One past the last valid method id.
pub const METHOD_UPPER_BOUND: u32 = ApiMethod::RandomBytesGet as u32 + 1;

/// Failure of a random-service API call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("random service returned status {0:#010x}")]
    Status(StatusWord),
    #[error("malformed random service response")]
    Malformed,
    #[error("random service connection closed")]
    Closed,
}

fn encode_response(method: u32, offset: u32, status: StatusWord, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&method.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Handles one request frame.
pub fn dispatch(req: &[u8]) -> Vec<u8> {
    if req.len() < 8 {
        return encode_response(0, 0, status::random::REQUEST_PACKET_INVALID_SIZE, &[]);
    }
    let method = BigEndian::read_u32(&req[0..4]);
    let offset = BigEndian::read_u32(&req[4..8]);
    if method >= METHOD_UPPER_BOUND {
        return encode_response(method, offset, status::random::INVALID_REQUEST_ID, &[]);
    }
    if req.len() != 12 {
        return encode_response(method, offset, status::random::REQUEST_PACKET_INVALID_SIZE, &[]);
    }
    let count = BigEndian::read_u32(&req[8..12]) as usize;
    if count == 0 || count > MAX_PAYLOAD_SIZE - 12 {
        return encode_response(method, offset, status::random::BAD_SIZE, &[]);
    }

    let mut bytes = vec![0u8; count];
    OsRng.fill_bytes(&mut bytes);
    encode_response(method, offset, STATUS_SUCCESS, &bytes)
}

/// Serves the control socket until the peer closes it.
pub async fn run(stream: tokio::net::UnixStream) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, IpcCodec::new());
    info!("random service ready");
    while let Some(frame) = framed.next().await {
        let request = match frame? {
            Packet::Data(request) => request,
            other => {
                warn!("unexpected packet type {:#010x}", other.wire_type());
                anyhow::bail!("unexpected packet type on control socket");
            }
        };
        framed.send(Packet::Data(dispatch(&request))).await?;
    }
    Ok(())
}

/// Asynchronous client over a random-service socket.
#[derive(Debug)]
pub struct RandomApi {
    framed: Framed<tokio::net::UnixStream, IpcCodec>,
}

impl RandomApi {
    pub fn new(stream: tokio::net::UnixStream) -> Self {
        Self {
            framed: Framed::new(stream, IpcCodec::new()),
        }
    }

    /// Fetches `count` random bytes.
    pub async fn random_bytes_get(&mut self, offset: u32, count: u32) -> Result<Vec<u8>, ApiError> {
        let mut req = Vec::with_capacity(12);
        req.extend_from_slice(&(ApiMethod::RandomBytesGet as u32).to_be_bytes());
        req.extend_from_slice(&offset.to_be_bytes());
        req.extend_from_slice(&count.to_be_bytes());
        self.framed.send(Packet::Data(req)).await?;

        let frame = self.framed.next().await.ok_or(ApiError::Closed)??;
        let raw = match frame {
            Packet::Data(raw) => raw,
            _ => return Err(ApiError::Malformed),
        };
        if raw.len() < 12 {
            return Err(ApiError::Malformed);
        }
        let status = BigEndian::read_u32(&raw[8..12]);
        if status != STATUS_SUCCESS {
            return Err(ApiError::Status(status));
        }
        let payload = raw[12..].to_vec();
        if payload.len() != count as usize {
            return Err(ApiError::Malformed);
        }
        Ok(payload)
    }
}
