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

//! Authenticated packet codec.
//!
//! The client-facing wire format once a shared secret exists. A packet is:
//!
//! ```text
//! [type : 4 bytes, encrypted] [size : 4 bytes, encrypted]
//! [mac : MAC_SIZE bytes]      [payload : size bytes, encrypted]
//! ```
//!
//! The stream cipher is keyed by the shared secret and seeded with a 64-bit
//! IV; the keystream covers type, size and payload contiguously, skipping
//! the MAC gap in the output only. The MAC covers the encrypted header and
//! the encrypted payload. Each direction holds its own IV counter starting
//! at 1 and advancing by exactly one per accepted packet, so a replayed
//! ciphertext decrypts under the wrong keystream and is rejected before any
//! payload is surfaced.

use bytes::{Buf, BufMut, BytesMut};
use chacha20::cipher::StreamCipher;
use hmac::Mac;
use tokio_util::codec::{Decoder, Encoder};
use zeroize::Zeroize;

use std::io::{Read, Write};

use super::frame::MAX_PAYLOAD_SIZE;
use super::wire_type;
use crate::crypto::{CryptoSuite, SharedSecret, MAC_SIZE};
use crate::status::IpcError;

const HEADER_SIZE: usize = 8;

/// Encrypts one packet under an explicit IV and appends it to `dst`.
fn seal(
    suite: CryptoSuite,
    secret: &SharedSecret,
    iv: u64,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<(), IpcError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(IpcError::UnexpectedSize(payload.len()));
    }

    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&wire_type::AUTHED_PACKET.to_be_bytes());
    header[4..].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    let mut cipher = suite.stream(secret, iv);
    cipher.apply_keystream(&mut header);

    let mut body = payload.to_vec();
    cipher.apply_keystream(&mut body);

    let mut mac = suite.mac(secret)?;
    mac.update(&header);
    mac.update(&body);
    let digest = mac.finalize().into_bytes();

    dst.reserve(HEADER_SIZE + MAC_SIZE + body.len());
    dst.put_slice(&header);
    dst.put_slice(&digest);
    dst.put_slice(&body);

    body.zeroize();
    Ok(())
}

/// Attempts to decrypt one packet under an explicit IV from the front of
/// `src`. Returns `Ok(None)` when the buffer does not yet hold a full
/// packet.
fn open(
    suite: CryptoSuite,
    secret: &SharedSecret,
    iv: u64,
    src: &mut BytesMut,
) -> Result<Option<Vec<u8>>, IpcError> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut cipher = suite.stream(secret, iv);
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&src[..HEADER_SIZE]);
    cipher.apply_keystream(&mut header);

    let tag = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if tag != wire_type::AUTHED_PACKET {
        // Wrong keystream (stale IV, replay) or tampered header.
        return Err(IpcError::AuthenticationFailure);
    }
    let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if size > MAX_PAYLOAD_SIZE {
        return Err(IpcError::AuthenticationFailure);
    }

    let total = HEADER_SIZE + MAC_SIZE + size;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    let mut mac = suite.mac(secret)?;
    mac.update(&src[..HEADER_SIZE]);
    mac.update(&src[HEADER_SIZE + MAC_SIZE..total]);
    mac.verify_slice(&src[HEADER_SIZE..HEADER_SIZE + MAC_SIZE])
        .map_err(|_| IpcError::AuthenticationFailure)?;

    let mut payload = src[HEADER_SIZE + MAC_SIZE..total].to_vec();
    cipher.apply_keystream(&mut payload);
    src.advance(total);
    Ok(Some(payload))
}

/// Writes one authenticated packet to a blocking writer under an explicit
/// IV. The caller owns IV monotonicity.
pub fn write_authed_data<W: Write>(
    writer: &mut W,
    iv: u64,
    payload: &[u8],
    suite: CryptoSuite,
    secret: &SharedSecret,
) -> Result<(), IpcError> {
    let mut buf = BytesMut::new();
    seal(suite, secret, iv, payload, &mut buf)?;
    writer.write_all(&buf).map_err(IpcError::Write)
}

/// Reads one authenticated packet from a blocking reader under an explicit
/// expected IV.
pub fn read_authed_data<R: Read>(
    reader: &mut R,
    iv: u64,
    suite: CryptoSuite,
    secret: &SharedSecret,
) -> Result<Vec<u8>, IpcError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + MAC_SIZE);
    let mut chunk = [0u8; 256];
    loop {
        if let Some(payload) = open(suite, secret, iv, &mut buf)? {
            return Ok(payload);
        }
        let count = reader.read(&mut chunk).map_err(IpcError::Read)?;
        if count == 0 {
            return Err(IpcError::Eof);
        }
        buf.extend_from_slice(&chunk[..count]);
    }
}

/// Per-connection authenticated session: suite, secret and both direction
/// counters.
#[derive(Debug)]
pub struct AuthedSession {
    suite: CryptoSuite,
    secret: SharedSecret,
    write_iv: u64,
    read_iv: u64,
}

impl AuthedSession {
    /// Creates a session with both IV counters at 1.
    pub fn new(suite: CryptoSuite, secret: SharedSecret) -> Self {
        Self {
            suite,
            secret,
            write_iv: 1,
            read_iv: 1,
        }
    }

    /// The IV the next outbound packet will use.
    pub fn write_iv(&self) -> u64 {
        self.write_iv
    }

    /// The IV the next inbound packet must decrypt under.
    pub fn read_iv(&self) -> u64 {
        self.read_iv
    }

    /// Encrypts `payload` into `dst` and advances the write counter.
    pub fn encrypt_msg(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), IpcError> {
        seal(self.suite, &self.secret, self.write_iv, payload, dst)?;
        self.write_iv += 1;
        Ok(())
    }

    /// Decrypts one packet from `src`, advancing the read counter on
    /// success. `Ok(None)` means the packet is not yet complete.
    pub fn decrypt_msg(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>, IpcError> {
        match open(self.suite, &self.secret, self.read_iv, src)? {
            Some(payload) => {
                self.read_iv += 1;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }
}

/// `Framed` codec over an [`AuthedSession`].
#[derive(Debug)]
pub struct AuthedCodec {
    session: AuthedSession,
}

impl AuthedCodec {
    pub fn new(session: AuthedSession) -> Self {
        Self { session }
    }
}

impl Decoder for AuthedCodec {
    type Item = Vec<u8>;
    type Error = IpcError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>, IpcError> {
        self.session.decrypt_msg(buf)
    }
}

impl Encoder<Vec<u8>> for AuthedCodec {
    type Error = IpcError;

    fn encode(&mut self, payload: Vec<u8>, buf: &mut BytesMut) -> Result<(), IpcError> {
        self.session.encrypt_msg(&payload, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_SIZE;

    fn fixed_secret() -> SharedSecret {
        SharedSecret::from_bytes([0x2Eu8; KEY_SIZE])
    }

    fn sessions() -> (AuthedSession, AuthedSession) {
        let suite = CryptoSuite::velochain1();
        (
            AuthedSession::new(suite, fixed_secret()),
            AuthedSession::new(suite, fixed_secret()),
        )
    }

    #[test]
    fn round_trip_advances_iv() {
        let (mut sender, mut receiver) = sessions();
        let mut wire = BytesMut::new();
        sender.encrypt_msg(b"Test", &mut wire).unwrap();

        let payload = receiver.decrypt_msg(&mut wire).unwrap().unwrap();
        assert_eq!(payload, b"Test");
        assert_eq!(receiver.read_iv(), 2);
        assert_eq!(sender.write_iv(), 2);
        assert!(wire.is_empty());
    }

    #[test]
    fn replay_is_rejected() {
        let (mut sender, mut receiver) = sessions();
        let mut wire = BytesMut::new();
        sender.encrypt_msg(b"Test", &mut wire).unwrap();
        let replay = wire.clone();

        assert!(receiver.decrypt_msg(&mut wire).unwrap().is_some());

        // The same ciphertext again: receiver now expects IV 2.
        let mut wire = replay;
        let err = receiver.decrypt_msg(&mut wire).unwrap_err();
        assert!(matches!(err, IpcError::AuthenticationFailure));
    }

    #[test]
    fn bit_flip_fails_authentication() {
        let (mut sender, mut receiver) = sessions();
        let mut wire = BytesMut::new();
        sender.encrypt_msg(b"sensitive", &mut wire).unwrap();

        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let err = receiver.decrypt_msg(&mut wire).unwrap_err();
        assert!(matches!(err, IpcError::AuthenticationFailure));
    }

    #[test]
    fn truncation_is_not_a_packet() {
        let (mut sender, mut receiver) = sessions();
        let mut wire = BytesMut::new();
        sender.encrypt_msg(b"payload bytes", &mut wire).unwrap();

        let mut partial = BytesMut::from(&wire[..wire.len() - 4]);
        assert!(receiver.decrypt_msg(&mut partial).unwrap().is_none());
    }

    #[test]
    fn wrong_secret_fails() {
        let suite = CryptoSuite::velochain1();
        let mut sender = AuthedSession::new(suite, fixed_secret());
        let mut receiver =
            AuthedSession::new(suite, SharedSecret::from_bytes([0x11u8; KEY_SIZE]));

        let mut wire = BytesMut::new();
        sender.encrypt_msg(b"Test", &mut wire).unwrap();
        assert!(receiver.decrypt_msg(&mut wire).is_err());
    }

    #[test]
    fn sequence_of_packets_decodes_in_order() {
        let (mut sender, mut receiver) = sessions();
        let mut wire = BytesMut::new();
        sender.encrypt_msg(b"one", &mut wire).unwrap();
        sender.encrypt_msg(b"two", &mut wire).unwrap();
        sender.encrypt_msg(b"", &mut wire).unwrap();

        assert_eq!(receiver.decrypt_msg(&mut wire).unwrap().unwrap(), b"one");
        assert_eq!(receiver.decrypt_msg(&mut wire).unwrap().unwrap(), b"two");
        assert_eq!(receiver.decrypt_msg(&mut wire).unwrap().unwrap(), b"");
        assert!(receiver.decrypt_msg(&mut wire).unwrap().is_none());
    }

    #[test]
    fn explicit_iv_helpers_round_trip() {
        let suite = CryptoSuite::velochain1();
        let secret = fixed_secret();
        let mut wire = Vec::new();
        write_authed_data(&mut wire, 1, b"Test", suite, &secret).unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let payload = read_authed_data(&mut cursor, 1, suite, &secret).unwrap();
        assert_eq!(payload, b"Test");
    }
}
