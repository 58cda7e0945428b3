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

//! Blocking typed-packet I/O.
//!
//! These helpers complete or fail; the cooperative variants live in
//! [`crate::ipc::codec`]. Readers verify the type tag before consuming the
//! payload, so a stream that presents the wrong tag fails without touching
//! service state.

use byteorder::{BigEndian, ByteOrder};

use std::io::{Read, Write};

use super::wire_type;
use crate::status::IpcError;

/// Maximum payload size for variable-length frames.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// One typed frame.
///
/// The authenticated packet type is deliberately absent: it never travels
/// in plaintext and is handled by [`crate::ipc::authed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Int8(i8),
    Uint8(u8),
    Int64(i64),
    Uint64(u64),
    String(String),
    Data(Vec<u8>),
}

impl Packet {
    /// The wire type tag of this packet.
    pub fn wire_type(&self) -> u32 {
        match self {
            Packet::Int8(_) => wire_type::INT8,
            Packet::Uint8(_) => wire_type::UINT8,
            Packet::Int64(_) => wire_type::INT64,
            Packet::Uint64(_) => wire_type::UINT64,
            Packet::String(_) => wire_type::STRING,
            Packet::Data(_) => wire_type::DATA,
        }
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), IpcError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::Eof
        } else if err.kind() == std::io::ErrorKind::WouldBlock {
            IpcError::WouldBlock
        } else {
            IpcError::Read(err)
        }
    })
}

fn write_all<W: Write>(writer: &mut W, buf: &[u8]) -> Result<(), IpcError> {
    writer.write_all(buf).map_err(IpcError::Write)
}

fn read_type<R: Read>(reader: &mut R, expected: u32) -> Result<(), IpcError> {
    let mut tag = [0u8; 4];
    read_exact(reader, &mut tag)?;
    let actual = BigEndian::read_u32(&tag);
    if actual != expected {
        return Err(IpcError::UnexpectedType { expected, actual });
    }
    Ok(())
}

fn read_size<R: Read>(reader: &mut R) -> Result<usize, IpcError> {
    let mut raw = [0u8; 4];
    read_exact(reader, &mut raw)?;
    let size = BigEndian::read_u32(&raw) as usize;
    if size > MAX_PAYLOAD_SIZE {
        return Err(IpcError::UnexpectedSize(size));
    }
    Ok(size)
}

/// Writes an unsigned 8-bit packet.
pub fn write_u8<W: Write>(writer: &mut W, value: u8) -> Result<(), IpcError> {
    let mut frame = [0u8; 5];
    BigEndian::write_u32(&mut frame[..4], wire_type::UINT8);
    frame[4] = value;
    write_all(writer, &frame)
}

/// Reads an unsigned 8-bit packet.
pub fn read_u8<R: Read>(reader: &mut R) -> Result<u8, IpcError> {
    read_type(reader, wire_type::UINT8)?;
    let mut value = [0u8; 1];
    read_exact(reader, &mut value)?;
    Ok(value[0])
}

/// Writes a signed 8-bit packet.
pub fn write_i8<W: Write>(writer: &mut W, value: i8) -> Result<(), IpcError> {
    let mut frame = [0u8; 5];
    BigEndian::write_u32(&mut frame[..4], wire_type::INT8);
    frame[4] = value as u8;
    write_all(writer, &frame)
}

/// Reads a signed 8-bit packet.
pub fn read_i8<R: Read>(reader: &mut R) -> Result<i8, IpcError> {
    read_type(reader, wire_type::INT8)?;
    let mut value = [0u8; 1];
    read_exact(reader, &mut value)?;
    Ok(value[0] as i8)
}

/// Writes an unsigned 64-bit packet, big-endian.
pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<(), IpcError> {
    let mut frame = [0u8; 12];
    BigEndian::write_u32(&mut frame[..4], wire_type::UINT64);
    BigEndian::write_u64(&mut frame[4..], value);
    write_all(writer, &frame)
}

/// Reads an unsigned 64-bit packet.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64, IpcError> {
    read_type(reader, wire_type::UINT64)?;
    let mut value = [0u8; 8];
    read_exact(reader, &mut value)?;
    Ok(BigEndian::read_u64(&value))
}

/// Writes a signed 64-bit packet, big-endian.
pub fn write_i64<W: Write>(writer: &mut W, value: i64) -> Result<(), IpcError> {
    let mut frame = [0u8; 12];
    BigEndian::write_u32(&mut frame[..4], wire_type::INT64);
    BigEndian::write_i64(&mut frame[4..], value);
    write_all(writer, &frame)
}

/// Reads a signed 64-bit packet.
pub fn read_i64<R: Read>(reader: &mut R) -> Result<i64, IpcError> {
    read_type(reader, wire_type::INT64)?;
    let mut value = [0u8; 8];
    read_exact(reader, &mut value)?;
    Ok(BigEndian::read_i64(&value))
}

/// Writes a string packet.
pub fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<(), IpcError> {
    if value.len() > MAX_PAYLOAD_SIZE {
        return Err(IpcError::UnexpectedSize(value.len()));
    }
    let mut header = [0u8; 8];
    BigEndian::write_u32(&mut header[..4], wire_type::STRING);
    BigEndian::write_u32(&mut header[4..], value.len() as u32);
    write_all(writer, &header)?;
    write_all(writer, value.as_bytes())
}

/// Reads a string packet. Payloads above the size cap are rejected before
/// allocation.
pub fn read_string<R: Read>(reader: &mut R) -> Result<String, IpcError> {
    read_type(reader, wire_type::STRING)?;
    let size = read_size(reader)?;
    let mut payload = vec![0u8; size];
    read_exact(reader, &mut payload)?;
    String::from_utf8(payload).map_err(|err| IpcError::UnexpectedSize(err.into_bytes().len()))
}

/// Writes a data packet.
pub fn write_data<W: Write>(writer: &mut W, value: &[u8]) -> Result<(), IpcError> {
    if value.len() > MAX_PAYLOAD_SIZE {
        return Err(IpcError::UnexpectedSize(value.len()));
    }
    let mut header = [0u8; 8];
    BigEndian::write_u32(&mut header[..4], wire_type::DATA);
    BigEndian::write_u32(&mut header[4..], value.len() as u32);
    write_all(writer, &header)?;
    write_all(writer, value)
}

/// Reads a data packet.
pub fn read_data<R: Read>(reader: &mut R) -> Result<Vec<u8>, IpcError> {
    read_type(reader, wire_type::DATA)?;
    let size = read_size(reader)?;
    let mut payload = vec![0u8; size];
    read_exact(reader, &mut payload)?;
    Ok(payload)
}

/// Writes any packet.
pub fn write_packet<W: Write>(writer: &mut W, packet: &Packet) -> Result<(), IpcError> {
    match packet {
        Packet::Int8(value) => write_i8(writer, *value),
        Packet::Uint8(value) => write_u8(writer, *value),
        Packet::Int64(value) => write_i64(writer, *value),
        Packet::Uint64(value) => write_u64(writer, *value),
        Packet::String(value) => write_string(writer, value),
        Packet::Data(value) => write_data(writer, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    fn round_trip(packet: Packet) -> Packet {
        let mut buf = Vec::new();
        write_packet(&mut buf, &packet).unwrap();
        let mut cursor = Cursor::new(buf);
        match &packet {
            Packet::Int8(_) => Packet::Int8(read_i8(&mut cursor).unwrap()),
            Packet::Uint8(_) => Packet::Uint8(read_u8(&mut cursor).unwrap()),
            Packet::Int64(_) => Packet::Int64(read_i64(&mut cursor).unwrap()),
            Packet::Uint64(_) => Packet::Uint64(read_u64(&mut cursor).unwrap()),
            Packet::String(_) => Packet::String(read_string(&mut cursor).unwrap()),
            Packet::Data(_) => Packet::Data(read_data(&mut cursor).unwrap()),
        }
    }

    #[test]
    fn fixed_width_round_trips() {
        assert_eq!(round_trip(Packet::Int8(-3)), Packet::Int8(-3));
        assert_eq!(round_trip(Packet::Uint8(0xA5)), Packet::Uint8(0xA5));
        assert_eq!(round_trip(Packet::Int64(-1)), Packet::Int64(-1));
        assert_eq!(
            round_trip(Packet::Uint64(0x0102_0304_0506_0708)),
            Packet::Uint64(0x0102_0304_0506_0708)
        );
    }

    #[test]
    fn variable_width_round_trips() {
        assert_eq!(
            round_trip(Packet::String("chroot".into())),
            Packet::String("chroot".into())
        );
        assert_eq!(
            round_trip(Packet::Data(vec![0, 1, 2, 255])),
            Packet::Data(vec![0, 1, 2, 255])
        );
        assert_eq!(round_trip(Packet::Data(Vec::new())), Packet::Data(Vec::new()));
    }

    #[test]
    fn wrong_type_tag_is_rejected() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 99).unwrap();
        let err = read_string(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, IpcError::UnexpectedType { .. }));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        let mut header = [0u8; 8];
        BigEndian::write_u32(&mut header[..4], wire_type::DATA);
        BigEndian::write_u32(&mut header[4..], (MAX_PAYLOAD_SIZE + 1) as u32);
        buf.extend_from_slice(&header);
        let err = read_data(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, IpcError::UnexpectedSize(_)));
    }

    #[test]
    fn short_read_is_eof() {
        let mut buf = Vec::new();
        write_data(&mut buf, b"abcdef").unwrap();
        buf.truncate(buf.len() - 2);
        let err = read_data(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, IpcError::Eof));
    }
}
