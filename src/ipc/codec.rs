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

//! Cooperative (non-blocking) typed-packet codec.
//!
//! Wraps a socket in a `Framed` transport. Partial reads accumulate in the
//! read buffer; a packet is only surfaced once the full length-prefixed
//! body is present, so a dispatcher never observes a torn frame.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{Packet, MAX_PAYLOAD_SIZE};
use super::wire_type;
use crate::status::IpcError;

/// Codec for plaintext typed packets.
#[derive(Debug, Default)]
pub struct IpcCodec {
    _priv: (),
}

impl IpcCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for IpcCodec {
    type Item = Packet;
    type Error = IpcError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, IpcError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let tag = BigEndian::read_u32(&buf[..4]);
        let fixed_len = match tag {
            wire_type::INT8 | wire_type::UINT8 => Some(1),
            wire_type::INT64 | wire_type::UINT64 => Some(8),
            wire_type::STRING | wire_type::DATA => None,
            other => {
                return Err(IpcError::UnexpectedType {
                    expected: wire_type::DATA,
                    actual: other,
                });
            }
        };

        if let Some(len) = fixed_len {
            if buf.len() < 4 + len {
                return Ok(None);
            }
            buf.advance(4);
            let body = buf.split_to(len);
            let packet = match tag {
                wire_type::INT8 => Packet::Int8(body[0] as i8),
                wire_type::UINT8 => Packet::Uint8(body[0]),
                wire_type::INT64 => Packet::Int64(BigEndian::read_i64(&body)),
                _ => Packet::Uint64(BigEndian::read_u64(&body)),
            };
            return Ok(Some(packet));
        }

        if buf.len() < 8 {
            return Ok(None);
        }
        let size = BigEndian::read_u32(&buf[4..8]) as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(IpcError::UnexpectedSize(size));
        }
        if buf.len() < 8 + size {
            // Leave the header in place until the body arrives.
            buf.reserve(8 + size - buf.len());
            return Ok(None);
        }
        buf.advance(8);
        let body = buf.split_to(size).to_vec();
        let packet = if tag == wire_type::STRING {
            let text =
                String::from_utf8(body).map_err(|err| IpcError::UnexpectedSize(err.into_bytes().len()))?;
            Packet::String(text)
        } else {
            Packet::Data(body)
        };
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for IpcCodec {
    type Error = IpcError;

    fn encode(&mut self, packet: Packet, buf: &mut BytesMut) -> Result<(), IpcError> {
        match &packet {
            Packet::Int8(value) => {
                buf.put_u32(wire_type::INT8);
                buf.put_i8(*value);
            }
            Packet::Uint8(value) => {
                buf.put_u32(wire_type::UINT8);
                buf.put_u8(*value);
            }
            Packet::Int64(value) => {
                buf.put_u32(wire_type::INT64);
                buf.put_i64(*value);
            }
            Packet::Uint64(value) => {
                buf.put_u32(wire_type::UINT64);
                buf.put_u64(*value);
            }
            Packet::String(value) => {
                if value.len() > MAX_PAYLOAD_SIZE {
                    return Err(IpcError::UnexpectedSize(value.len()));
                }
                buf.put_u32(wire_type::STRING);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value.as_bytes());
            }
            Packet::Data(value) => {
                if value.len() > MAX_PAYLOAD_SIZE {
                    return Err(IpcError::UnexpectedSize(value.len()));
                }
                buf.put_u32(wire_type::DATA);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
        }
        Ok(())
    }
}
