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

//! Certificate reader/builder binding.
//!
//! Certificates are opaque values to most of the daemon; the few places
//! that need to look inside (attestation, canonization, block validation,
//! key files) go through this module. The encoding is a flat sequence of
//! fields: 2-byte big-endian field id, 2-byte big-endian length, value.
//! A signed certificate ends with a signer-id field and a signature field
//! whose Ed25519 signature covers every byte before the signature field.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use crate::Id;

/// Field identifiers.
pub mod field {
    pub const CERTIFICATE_VERSION: u16 = 0x0001;
    pub const CERTIFICATE_TYPE: u16 = 0x0002;
    pub const CERTIFICATE_ID: u16 = 0x0003;
    pub const PREVIOUS_CERTIFICATE_ID: u16 = 0x0004;
    pub const ARTIFACT_ID: u16 = 0x0005;
    pub const BLOCK_ID: u16 = 0x0006;
    pub const PREVIOUS_BLOCK_ID: u16 = 0x0007;
    pub const BLOCK_HEIGHT: u16 = 0x0008;
    pub const PREVIOUS_BLOCK_SIGNATURE: u16 = 0x0009;
    pub const WRAPPED_TRANSACTION: u16 = 0x000A;
    pub const ENTITY_ID: u16 = 0x000B;
    pub const PUBLIC_ENCRYPTION_KEY: u16 = 0x000C;
    pub const PRIVATE_ENCRYPTION_KEY: u16 = 0x000D;
    pub const PUBLIC_SIGNING_KEY: u16 = 0x000E;
    pub const PRIVATE_SIGNING_KEY: u16 = 0x000F;
    pub const SIGNER_ID: u16 = 0x0050;
    pub const SIGNATURE: u16 = 0x0051;
}

/// Certificate type identifiers carried in `CERTIFICATE_TYPE`.
pub mod cert_type {
    use uuid::Uuid;

    pub const TRANSACTION: Uuid = Uuid::from_bytes([
        0x52, 0xa7, 0xf0, 0xfb, 0x8a, 0x6b, 0x4d, 0x03,
        0x86, 0xa5, 0x7f, 0x61, 0x2f, 0xcf, 0x7e, 0xff,
    ]);
    pub const BLOCK: Uuid = Uuid::from_bytes([
        0x73, 0x46, 0x11, 0x7d, 0xb3, 0x9b, 0x46, 0x3c,
        0x81, 0x2c, 0xc4, 0x26, 0x15, 0x63, 0xe0, 0x2e,
    ]);
    pub const PRIVATE_ENTITY: Uuid = Uuid::from_bytes([
        0x81, 0x4e, 0x2e, 0x24, 0x5f, 0xb0, 0x41, 0xa2,
        0xa1, 0x8f, 0x78, 0xbf, 0x1f, 0x5c, 0x70, 0xd5,
    ]);
}

/// The certificate format version this binding emits.
pub const CERTIFICATE_VERSION: u32 = 0x0001_0000;

/// Certificate parse or verification failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertError {
    #[error("certificate truncated at offset {0}")]
    Truncated(usize),
    #[error("certificate missing field {0:#06x}")]
    MissingField(u16),
    #[error("certificate field {0:#06x} has the wrong size")]
    BadFieldSize(u16),
    #[error("certificate signature invalid")]
    SignatureInvalid,
    #[error("certificate field value too large")]
    FieldTooLarge,
}

/// A parsed certificate: the raw bytes plus a field index.
#[derive(Debug, Clone)]
pub struct Certificate {
    raw: Vec<u8>,
    fields: Vec<(u16, std::ops::Range<usize>)>,
}

impl Certificate {
    /// Parses the flat field sequence. No signature check happens here.
    pub fn parse(raw: &[u8]) -> Result<Self, CertError> {
        let mut fields = Vec::new();
        let mut offset = 0usize;
        while offset < raw.len() {
            if offset + 4 > raw.len() {
                return Err(CertError::Truncated(offset));
            }
            let id = BigEndian::read_u16(&raw[offset..]);
            let len = BigEndian::read_u16(&raw[offset + 2..]) as usize;
            let start = offset + 4;
            let end = start + len;
            if end > raw.len() {
                return Err(CertError::Truncated(offset));
            }
            fields.push((id, start..end));
            offset = end;
        }
        Ok(Self {
            raw: raw.to_vec(),
            fields,
        })
    }

    /// The raw certificate bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// First value of `id`, if present.
    pub fn first(&self, id: u16) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(field_id, _)| *field_id == id)
            .map(|(_, range)| &self.raw[range.clone()])
    }

    /// All values of `id`, in order of appearance.
    pub fn all(&self, id: u16) -> impl Iterator<Item = &[u8]> {
        let raw = &self.raw;
        self.fields
            .iter()
            .filter(move |(field_id, _)| *field_id == id)
            .map(move |(_, range)| &raw[range.clone()])
    }

    /// A mandatory field, as raw bytes.
    pub fn require(&self, id: u16) -> Result<&[u8], CertError> {
        self.first(id).ok_or(CertError::MissingField(id))
    }

    /// A mandatory 128-bit identifier field.
    pub fn require_id(&self, id: u16) -> Result<Id, CertError> {
        let value = self.require(id)?;
        if value.len() != 16 {
            return Err(CertError::BadFieldSize(id));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(value);
        Ok(Uuid::from_bytes(bytes))
    }

    /// A mandatory big-endian 64-bit field.
    pub fn require_u64(&self, id: u16) -> Result<u64, CertError> {
        let value = self.require(id)?;
        if value.len() != 8 {
            return Err(CertError::BadFieldSize(id));
        }
        Ok(BigEndian::read_u64(value))
    }

    /// A mandatory big-endian 32-bit field.
    pub fn require_u32(&self, id: u16) -> Result<u32, CertError> {
        let value = self.require(id)?;
        if value.len() != 4 {
            return Err(CertError::BadFieldSize(id));
        }
        Ok(BigEndian::read_u32(value))
    }

    /// Verifies the trailing signature with `key`.
    ///
    /// The signature covers every byte up to the start of the signature
    /// field header. A certificate without a signature field fails with
    /// `MissingField`.
    pub fn verify_signature(&self, key: &VerifyingKey) -> Result<(), CertError> {
        let (signed_len, signature) = self.signature_parts()?;
        key.verify(&self.raw[..signed_len], &signature)
            .map_err(|_| CertError::SignatureInvalid)
    }

    /// The raw signature field, for embedding into a successor certificate.
    pub fn signature_bytes(&self) -> Result<&[u8], CertError> {
        self.require(field::SIGNATURE)
    }

    fn signature_parts(&self) -> Result<(usize, Signature), CertError> {
        let (_, range) = self
            .fields
            .iter()
            .find(|(field_id, _)| *field_id == field::SIGNATURE)
            .ok_or(CertError::MissingField(field::SIGNATURE))?;
        if range.end - range.start != SIGNATURE_LENGTH {
            return Err(CertError::BadFieldSize(field::SIGNATURE));
        }
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes.copy_from_slice(&self.raw[range.clone()]);
        // The field header sits 4 bytes before the value.
        Ok((range.start - 4, Signature::from_bytes(&bytes)))
    }
}

/// Builds a certificate field by field.
#[derive(Debug, Default)]
pub struct CertificateBuilder {
    buf: Vec<u8>,
}

impl CertificateBuilder {
    /// Starts a certificate of the given type, stamping the format version.
    pub fn new(certificate_type: Uuid) -> Self {
        let mut builder = Self { buf: Vec::new() };
        builder.push_u32(field::CERTIFICATE_VERSION, CERTIFICATE_VERSION);
        builder.push_id(field::CERTIFICATE_TYPE, certificate_type);
        builder
    }

    /// Appends a raw field.
    pub fn push(&mut self, id: u16, value: &[u8]) -> &mut Self {
        debug_assert!(value.len() <= u16::MAX as usize);
        let mut header = [0u8; 4];
        BigEndian::write_u16(&mut header[..2], id);
        BigEndian::write_u16(&mut header[2..], value.len() as u16);
        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(value);
        self
    }

    /// Appends a 128-bit identifier field.
    pub fn push_id(&mut self, id: u16, value: Id) -> &mut Self {
        self.push(id, value.as_bytes())
    }

    /// Appends a big-endian 64-bit field.
    pub fn push_u64(&mut self, id: u16, value: u64) -> &mut Self {
        self.push(id, &value.to_be_bytes())
    }

    /// Appends a big-endian 32-bit field.
    pub fn push_u32(&mut self, id: u16, value: u32) -> &mut Self {
        self.push(id, &value.to_be_bytes())
    }

    /// Finishes without signing. Used for key files written by tooling.
    pub fn build_unsigned(self) -> Vec<u8> {
        self.buf
    }

    /// Appends signer id + signature and finishes.
    pub fn sign(mut self, signer_id: Id, key: &SigningKey) -> Result<Vec<u8>, CertError> {
        self.push_id(field::ENTITY_ID, signer_id);
        let signature = key.sign(&self.buf);
        self.push(field::SIGNATURE, &signature.to_bytes());
        Ok(self.buf)
    }
}
