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

//! Request decoding and dispatch for the data service control socket.
//!
//! Requests are `[method : u32][offset : u32][body]`; the offset echoes the
//! child context index for child-scoped methods and zero for root methods.
//! Responses are `[method : u32][offset : u32][status : u32][payload]`.
//! Malformed bodies produce a non-success status without touching state;
//! only transport-level failures kill the connection.

use byteorder::{BigEndian, ByteOrder};
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::ipc::frame::Packet;
use crate::ipc::IpcCodec;
use crate::status::{self, StatusWord, STATUS_SUCCESS};
use crate::Id;

use crate::bitcap::Bitcap;

use super::method::{cap, ApiMethod, METHOD_LOWER_BOUND, METHOD_UPPER_BOUND};
use super::{DataError, DataService};

/// Builds a response frame.
pub fn encode_response(method: u32, offset: u32, status: StatusWord, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&method.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Builds a request frame.
pub fn encode_request(method: ApiMethod, offset: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(method as u32).to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Sequential reader over a request body.
struct BodyReader<'a> {
    body: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { body }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DataError> {
        if self.body.len() < count {
            return Err(DataError::RequestPacketInvalidSize);
        }
        let (head, tail) = self.body.split_at(count);
        self.body = tail;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8, DataError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, DataError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn take_u64(&mut self) -> Result<u64, DataError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    fn take_id(&mut self) -> Result<Id, DataError> {
        let raw = self.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(Uuid::from_bytes(bytes))
    }

    fn rest(self) -> &'a [u8] {
        self.body
    }

    fn finish(self) -> Result<(), DataError> {
        if self.body.is_empty() {
            Ok(())
        } else {
            Err(DataError::RequestPacketInvalidSize)
        }
    }
}

/// Decodes one request, runs it against `service`, and produces the
/// response frame.
pub fn dispatch(service: &mut DataService, req: &[u8]) -> Vec<u8> {
    if req.len() < 8 {
        return encode_response(
            0,
            0,
            status::data::REQUEST_PACKET_INVALID_SIZE,
            &[],
        );
    }

    let raw_method = BigEndian::read_u32(&req[..4]);
    let offset = BigEndian::read_u32(&req[4..8]);
    let body = &req[8..];

    if raw_method < METHOD_LOWER_BOUND || raw_method >= METHOD_UPPER_BOUND {
        return encode_response(raw_method, offset, status::data::INVALID_REQUEST_ID, &[]);
    }
    let method = ApiMethod::from_u32(raw_method).expect("checked against bounds");

    let result = run_method(service, method, offset, body);
    match result {
        Ok(payload) => encode_response(raw_method, offset, STATUS_SUCCESS, &payload),
        Err(err) => encode_response(raw_method, offset, err.status(), &[]),
    }
}

fn run_method(
    service: &mut DataService,
    method: ApiMethod,
    offset: u32,
    body: &[u8],
) -> Result<Vec<u8>, DataError> {
    let mut reader = BodyReader::new(body);
    match method {
        ApiMethod::RootContextCreate => {
            let max_size = reader.take_u64()?;
            let cert_len = reader.take_u32()? as usize;
            let cert = reader.take(cert_len)?.to_vec();
            let datadir = String::from_utf8(reader.rest().to_vec())
                .map_err(|_| DataError::RequestPacketBad)?;
            service.root_context_create(max_size, &cert)?;
            info!(
                "root context created: datadir `{}`, max size {}",
                datadir, max_size
            );
            Ok(Vec::new())
        }
        ApiMethod::RootContextReduceCaps => {
            let caps = Bitcap::from_bytes(cap::BITS, reader.rest())
                .ok_or(DataError::RequestPacketInvalidSize)?;
            service.root_context_reduce_caps(&caps)?;
            Ok(Vec::new())
        }
        ApiMethod::ChildContextCreate => {
            let caps = Bitcap::from_bytes(cap::BITS, reader.rest())
                .ok_or(DataError::RequestPacketInvalidSize)?;
            let child = service.child_context_create(&caps)?;
            Ok(child.to_be_bytes().to_vec())
        }
        ApiMethod::ChildContextClose => {
            reader.finish()?;
            service.child_context_close(offset)?;
            Ok(Vec::new())
        }
        ApiMethod::GlobalSettingRead => {
            let key = reader.take_u64()?;
            reader.finish()?;
            service.global_setting_read(offset, key)
        }
        ApiMethod::GlobalSettingWrite => {
            let key = reader.take_u64()?;
            let value = reader.rest();
            service.global_setting_write(offset, key, value)?;
            Ok(Vec::new())
        }
        ApiMethod::BlockIdLatestRead => {
            reader.finish()?;
            let id = service.block_id_latest_read(offset)?;
            Ok(id.as_bytes().to_vec())
        }
        ApiMethod::BlockIdByHeightRead => {
            let height = reader.take_u64()?;
            reader.finish()?;
            let id = service.block_id_by_height_read(offset, height)?;
            Ok(id.as_bytes().to_vec())
        }
        ApiMethod::BlockRead => {
            let block_id = reader.take_id()?;
            let with_cert = reader.take_u8()? != 0;
            reader.finish()?;
            let record = service.block_read(offset, block_id, with_cert)?;
            Ok(record.encode(with_cert))
        }
        ApiMethod::TransactionSubmit => {
            let transaction_id = reader.take_id()?;
            let artifact_id = reader.take_id()?;
            let cert = reader.rest();
            service.transaction_submit(offset, transaction_id, artifact_id, cert)?;
            Ok(Vec::new())
        }
        ApiMethod::TransactionGetFirst => {
            reader.finish()?;
            let record = service.transaction_get_first(offset)?;
            Ok(record.encode(true))
        }
        ApiMethod::TransactionGet => {
            let transaction_id = reader.take_id()?;
            reader.finish()?;
            let record = service.transaction_get(offset, transaction_id)?;
            Ok(record.encode(true))
        }
        ApiMethod::TransactionDrop => {
            let transaction_id = reader.take_id()?;
            reader.finish()?;
            service.transaction_drop(offset, transaction_id)?;
            Ok(Vec::new())
        }
        ApiMethod::TransactionPromote => {
            let transaction_id = reader.take_id()?;
            reader.finish()?;
            service.transaction_promote(offset, transaction_id)?;
            Ok(Vec::new())
        }
        ApiMethod::CanonizedTransactionRead => {
            let transaction_id = reader.take_id()?;
            let with_cert = reader.take_u8()? != 0;
            reader.finish()?;
            let record = service.canonized_transaction_read(offset, transaction_id, with_cert)?;
            Ok(record.encode(with_cert))
        }
        ApiMethod::ArtifactRead => {
            let artifact_id = reader.take_id()?;
            reader.finish()?;
            let record = service.artifact_read(offset, artifact_id)?;
            Ok(record.encode())
        }
        ApiMethod::BlockMake => {
            let block_id = reader.take_id()?;
            let cert = reader.rest();
            service.block_make(offset, block_id, cert)?;
            Ok(Vec::new())
        }
    }
}

/// Serves the control socket until the peer closes it.
pub async fn run(stream: tokio::net::UnixStream) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, IpcCodec::new());
    let mut service = DataService::new();

    info!("data service ready");
    while let Some(frame) = framed.next().await {
        let request = match frame? {
            Packet::Data(request) => request,
            other => {
                warn!("unexpected packet type {:#010x} on control socket", other.wire_type());
                anyhow::bail!("unexpected packet type on control socket");
            }
        };
        let response = dispatch(&mut service, &request);
        framed.send(Packet::Data(response)).await?;
    }
    info!("control socket closed; data service exiting");
    Ok(())
}
