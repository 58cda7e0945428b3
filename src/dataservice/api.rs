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

//! Caller-side data service API.
//!
//! [`DataApi`] is the asynchronous client used by the canonization,
//! attestation and protocol services over their inherited data socket. The
//! [`blocking`] submodule covers the two root-context calls the supervisor
//! issues during startup, over a plain blocking socket.

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

use super::dispatch::encode_request;
use super::method::ApiMethod;
use super::records::{ArtifactRecord, BlockRecord, TransactionRecord};

/// Failure of a data-service API call.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport failure; the connection is dead.
    #[error(transparent)]
    Ipc(#[from] IpcError),
    /// The service answered with a non-success status.
    #[error("data service returned status {0:#010x}")]
    Status(StatusWord),
    /// The response payload could not be decoded.
    #[error("malformed data service response")]
    Malformed,
    /// The peer closed the socket mid-call.
    #[error("data service connection closed")]
    Closed,
}

impl ApiError {
    /// The status word carried by a `Status` failure, if any.
    pub fn status(&self) -> Option<StatusWord> {
        match self {
            ApiError::Status(status) => Some(*status),
            _ => None,
        }
    }
}

/// A decoded response frame.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub method: u32,
    pub offset: u32,
    pub status: StatusWord,
    pub payload: Vec<u8>,
}

/// Decodes `[method][offset][status][payload]`.
pub fn decode_response(raw: &[u8]) -> Result<ApiResponse, ApiError> {
    if raw.len() < 12 {
        return Err(ApiError::Malformed);
    }
    Ok(ApiResponse {
        method: BigEndian::read_u32(&raw[0..4]),
        offset: BigEndian::read_u32(&raw[4..8]),
        status: BigEndian::read_u32(&raw[8..12]),
        payload: raw[12..].to_vec(),
    })
}

fn expect_id(payload: &[u8]) -> Result<Id, ApiError> {
    if payload.len() != 16 {
        return Err(ApiError::Malformed);
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(payload);
    Ok(Uuid::from_bytes(bytes))
}

/// Asynchronous client over a data-service control socket.
#[derive(Debug)]
pub struct DataApi {
    framed: Framed<tokio::net::UnixStream, IpcCodec>,
}

impl DataApi {
    pub fn new(stream: tokio::net::UnixStream) -> Self {
        Self {
            framed: Framed::new(stream, IpcCodec::new()),
        }
    }

    /// Releases the underlying socket. Callers must be between exchanges:
    /// any buffered partial frame is discarded.
    pub fn into_inner(self) -> tokio::net::UnixStream {
        self.framed.into_inner()
    }

    /// One request/response exchange. The data service serves its control
    /// socket strictly in order, so the next data frame answers this call.
    async fn call(&mut self, method: ApiMethod, offset: u32, body: &[u8]) -> Result<ApiResponse, ApiError> {
        self.framed
            .send(Packet::Data(encode_request(method, offset, body)))
            .await?;
        let frame = self.framed.next().await.ok_or(ApiError::Closed)??;
        let raw = match frame {
            Packet::Data(raw) => raw,
            _ => return Err(ApiError::Malformed),
        };
        let response = decode_response(&raw)?;
        if response.method != method as u32 {
            return Err(ApiError::Malformed);
        }
        if response.status != STATUS_SUCCESS {
            return Err(ApiError::Status(response.status));
        }
        Ok(response)
    }

    pub async fn root_context_create(
        &mut self,
        max_size: u64,
        datadir: &str,
        root_block_cert: &[u8],
    ) -> Result<(), ApiError> {
        let body = encode_root_context_create(max_size, datadir, root_block_cert);
        self.call(ApiMethod::RootContextCreate, 0, &body).await?;
        Ok(())
    }

    pub async fn root_context_reduce_caps(&mut self, caps: &Bitcap) -> Result<(), ApiError> {
        self.call(ApiMethod::RootContextReduceCaps, 0, &caps.to_bytes())
            .await?;
        Ok(())
    }

    pub async fn child_context_create(&mut self, caps: &Bitcap) -> Result<u32, ApiError> {
        let response = self
            .call(ApiMethod::ChildContextCreate, 0, &caps.to_bytes())
            .await?;
        if response.payload.len() != 4 {
            return Err(ApiError::Malformed);
        }
        Ok(BigEndian::read_u32(&response.payload))
    }

    pub async fn child_context_close(&mut self, child: u32) -> Result<(), ApiError> {
        self.call(ApiMethod::ChildContextClose, child, &[]).await?;
        Ok(())
    }

    pub async fn global_setting_read(&mut self, child: u32, key: u64) -> Result<Vec<u8>, ApiError> {
        let response = self
            .call(ApiMethod::GlobalSettingRead, child, &key.to_be_bytes())
            .await?;
        Ok(response.payload)
    }

    pub async fn global_setting_write(
        &mut self,
        child: u32,
        key: u64,
        value: &[u8],
    ) -> Result<(), ApiError> {
        let mut body = Vec::with_capacity(8 + value.len());
        body.extend_from_slice(&key.to_be_bytes());
        body.extend_from_slice(value);
        self.call(ApiMethod::GlobalSettingWrite, child, &body).await?;
        Ok(())
    }

    pub async fn block_id_latest_read(&mut self, child: u32) -> Result<Id, ApiError> {
        let response = self.call(ApiMethod::BlockIdLatestRead, child, &[]).await?;
        expect_id(&response.payload)
    }

    pub async fn block_id_by_height_read(&mut self, child: u32, height: u64) -> Result<Id, ApiError> {
        let response = self
            .call(ApiMethod::BlockIdByHeightRead, child, &height.to_be_bytes())
            .await?;
        expect_id(&response.payload)
    }

    pub async fn block_read(
        &mut self,
        child: u32,
        block_id: Id,
        with_cert: bool,
    ) -> Result<BlockRecord, ApiError> {
        let mut body = Vec::with_capacity(17);
        body.extend_from_slice(block_id.as_bytes());
        body.push(with_cert as u8);
        let response = self.call(ApiMethod::BlockRead, child, &body).await?;
        BlockRecord::decode(&response.payload).ok_or(ApiError::Malformed)
    }

    pub async fn transaction_submit(
        &mut self,
        child: u32,
        transaction_id: Id,
        artifact_id: Id,
        cert: &[u8],
    ) -> Result<(), ApiError> {
        let mut body = Vec::with_capacity(32 + cert.len());
        body.extend_from_slice(transaction_id.as_bytes());
        body.extend_from_slice(artifact_id.as_bytes());
        body.extend_from_slice(cert);
        self.call(ApiMethod::TransactionSubmit, child, &body).await?;
        Ok(())
    }

    pub async fn transaction_get_first(&mut self, child: u32) -> Result<TransactionRecord, ApiError> {
        let response = self.call(ApiMethod::TransactionGetFirst, child, &[]).await?;
        TransactionRecord::decode(&response.payload).ok_or(ApiError::Malformed)
    }

    pub async fn transaction_get(
        &mut self,
        child: u32,
        transaction_id: Id,
    ) -> Result<TransactionRecord, ApiError> {
        let response = self
            .call(ApiMethod::TransactionGet, child, transaction_id.as_bytes())
            .await?;
        TransactionRecord::decode(&response.payload).ok_or(ApiError::Malformed)
    }

    pub async fn transaction_drop(&mut self, child: u32, transaction_id: Id) -> Result<(), ApiError> {
        self.call(ApiMethod::TransactionDrop, child, transaction_id.as_bytes())
            .await?;
        Ok(())
    }

    pub async fn transaction_promote(
        &mut self,
        child: u32,
        transaction_id: Id,
    ) -> Result<(), ApiError> {
        self.call(ApiMethod::TransactionPromote, child, transaction_id.as_bytes())
            .await?;
        Ok(())
    }

    pub async fn canonized_transaction_read(
        &mut self,
        child: u32,
        transaction_id: Id,
        with_cert: bool,
    ) -> Result<TransactionRecord, ApiError> {
        let mut body = Vec::with_capacity(17);
        body.extend_from_slice(transaction_id.as_bytes());
        body.push(with_cert as u8);
        let response = self
            .call(ApiMethod::CanonizedTransactionRead, child, &body)
            .await?;
        TransactionRecord::decode(&response.payload).ok_or(ApiError::Malformed)
    }

    pub async fn artifact_read(&mut self, child: u32, artifact_id: Id) -> Result<ArtifactRecord, ApiError> {
        let response = self
            .call(ApiMethod::ArtifactRead, child, artifact_id.as_bytes())
            .await?;
        ArtifactRecord::decode(&response.payload).ok_or(ApiError::Malformed)
    }

    pub async fn block_make(
        &mut self,
        child: u32,
        block_id: Id,
        block_cert: &[u8],
    ) -> Result<(), ApiError> {
        let mut body = Vec::with_capacity(16 + block_cert.len());
        body.extend_from_slice(block_id.as_bytes());
        body.extend_from_slice(block_cert);
        self.call(ApiMethod::BlockMake, child, &body).await?;
        Ok(())
    }
}

/// Encodes a root-context-create body.
pub fn encode_root_context_create(max_size: u64, datadir: &str, root_block_cert: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(12 + root_block_cert.len() + datadir.len());
    body.extend_from_slice(&max_size.to_be_bytes());
    body.extend_from_slice(&(root_block_cert.len() as u32).to_be_bytes());
    body.extend_from_slice(root_block_cert);
    body.extend_from_slice(datadir.as_bytes());
    body
}

/// Blocking variants used by the supervisor during startup.
pub mod blocking {
    use super::*;
    use crate::ipc::frame;

    use std::os::unix::net::UnixStream;

    fn call(
        sock: &mut UnixStream,
        method: ApiMethod,
        offset: u32,
        body: &[u8],
    ) -> Result<ApiResponse, ApiError> {
        frame::write_data(sock, &encode_request(method, offset, body))?;
        let raw = frame::read_data(sock)?;
        let response = decode_response(&raw)?;
        if response.method != method as u32 {
            return Err(ApiError::Malformed);
        }
        if response.status != STATUS_SUCCESS {
            return Err(ApiError::Status(response.status));
        }
        Ok(response)
    }

    /// Initializes the root context over a blocking socket.
    pub fn root_context_create(
        sock: &mut UnixStream,
        max_size: u64,
        datadir: &str,
        root_block_cert: &[u8],
    ) -> Result<(), ApiError> {
        let body = encode_root_context_create(max_size, datadir, root_block_cert);
        call(sock, ApiMethod::RootContextCreate, 0, &body)?;
        Ok(())
    }

    /// Reduces root capabilities over a blocking socket.
    pub fn root_context_reduce_caps(
        sock: &mut UnixStream,
        caps: &Bitcap,
    ) -> Result<(), ApiError> {
        call(sock, ApiMethod::RootContextReduceCaps, 0, &caps.to_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_decoding() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(ApiMethod::BlockRead as u32).to_be_bytes());
        raw.extend_from_slice(&7u32.to_be_bytes());
        raw.extend_from_slice(&STATUS_SUCCESS.to_be_bytes());
        raw.extend_from_slice(b"payload");

        let response = decode_response(&raw).unwrap();
        assert_eq!(response.method, ApiMethod::BlockRead as u32);
        assert_eq!(response.offset, 7);
        assert_eq!(response.status, STATUS_SUCCESS);
        assert_eq!(response.payload, b"payload");

        assert!(decode_response(&raw[..10]).is_err());
    }

    #[test]
    fn root_create_body_layout() {
        let body = encode_root_context_create(4096, "data", b"CERT");
        assert_eq!(&body[0..8], &4096u64.to_be_bytes());
        assert_eq!(BigEndian::read_u32(&body[8..12]), 4);
        assert_eq!(&body[12..16], b"CERT");
        assert_eq!(&body[16..], b"data");
    }
}
