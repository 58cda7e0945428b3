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

//! Shared helpers for the cross-service tests.

#![allow(dead_code)]

use agentd::cert::{cert_type, field, CertificateBuilder};
use agentd::crypto::SigningKey;
use agentd::{zero_id, Id};
use uuid::Uuid;

/// A deterministic id with a recognizable tail byte.
pub fn id(tail: u8) -> Id {
    let mut bytes = [0u8; 16];
    bytes[15] = tail;
    Uuid::from_bytes(bytes)
}

/// A connected pair of nonblocking tokio Unix streams.
pub fn stream_pair() -> (tokio::net::UnixStream, tokio::net::UnixStream) {
    let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
    left.set_nonblocking(true).unwrap();
    right.set_nonblocking(true).unwrap();
    (
        tokio::net::UnixStream::from_std(left).unwrap(),
        tokio::net::UnixStream::from_std(right).unwrap(),
    )
}

/// An unsigned root block certificate for `root_id`.
pub fn root_block_cert(root_id: Id) -> Vec<u8> {
    let mut builder = CertificateBuilder::new(cert_type::BLOCK);
    builder
        .push_id(field::BLOCK_ID, root_id)
        .push_id(field::PREVIOUS_BLOCK_ID, zero_id())
        .push_u64(field::BLOCK_HEIGHT, 0);
    builder.build_unsigned()
}

/// A signed transaction certificate.
pub fn transaction_cert(txn_id: Id, artifact_id: Id, signer: Id, key: &SigningKey) -> Vec<u8> {
    let mut builder = CertificateBuilder::new(cert_type::TRANSACTION);
    builder
        .push_id(field::CERTIFICATE_ID, txn_id)
        .push_id(field::ARTIFACT_ID, artifact_id);
    builder.sign(signer, key).unwrap()
}
