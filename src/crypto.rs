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

//! Crypto-suite binding.
//!
//! The daemon treats cryptography as a pluggable suite identified on the
//! wire by a 32-bit id. One suite is bound here: ChaCha20 (64-bit nonce
//! variant) for stream encryption, HMAC-SHA256 for packet authentication,
//! X25519 for key agreement and Ed25519 for certificate signatures. Secrets
//! are wiped on drop.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use std::fmt;

use crate::status::IpcError;

pub use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH,
};

/// HMAC-SHA256, the packet MAC of the bound suite.
pub type HmacSha256 = Hmac<Sha256>;

/// Wire id of the bound suite.
pub const SUITE_VELOCHAIN_1: u32 = 0x0000_0001;

/// Size of a packet MAC digest in bytes.
pub const MAC_SIZE: usize = 32;

/// Size of a shared secret in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a handshake nonce in bytes.
pub const NONCE_SIZE: usize = 32;

/// A crypto suite handle, validated against the closed set of known ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoSuite {
    id: u32,
}

impl CryptoSuite {
    /// The suite every current peer speaks.
    pub fn velochain1() -> Self {
        Self {
            id: SUITE_VELOCHAIN_1,
        }
    }

    /// Validates a wire suite id.
    pub fn from_id(id: u32) -> Result<Self, IpcError> {
        if id == SUITE_VELOCHAIN_1 {
            Ok(Self { id })
        } else {
            Err(IpcError::InvalidCryptoSuite)
        }
    }

    /// The wire id of this suite.
    pub fn id(self) -> u32 {
        self.id
    }

    /// The MAC digest size of this suite.
    pub fn mac_size(self) -> usize {
        MAC_SIZE
    }

    /// Creates a stream cipher keyed by `secret` and seeded with `iv`.
    ///
    /// The 64-bit IV is the cipher nonce, big-endian. Callers own IV
    /// monotonicity; reusing an IV for two packets on one direction breaks
    /// the authenticated-packet contract.
    pub fn stream(self, secret: &SharedSecret, iv: u64) -> ChaCha20Legacy {
        let nonce = iv.to_be_bytes();
        ChaCha20Legacy::new((&secret.bytes).into(), (&nonce).into())
    }

    /// Creates a MAC instance keyed by `secret`.
    pub fn mac(self, secret: &SharedSecret) -> Result<HmacSha256, IpcError> {
        HmacSha256::new_from_slice(&secret.bytes).map_err(|_| IpcError::InvalidSecret)
    }

    /// Derives the per-connection shared secret.
    ///
    /// X25519 between our agreement key and the peer public key, then
    /// HMAC-SHA256 keyed by the raw agreement output over
    /// `server_nonce || client_nonce`.
    pub fn agree(
        self,
        ours: &AgreementKeypair,
        theirs: &AgreementPublicKey,
        server_nonce: &Nonce,
        client_nonce: &Nonce,
    ) -> Result<SharedSecret, IpcError> {
        let raw = ours.secret.diffie_hellman(&theirs.0);
        let mut mac =
            HmacSha256::new_from_slice(raw.as_bytes()).map_err(|_| IpcError::InvalidSecret)?;
        mac.update(&server_nonce.0);
        mac.update(&client_nonce.0);
        let digest = mac.finalize().into_bytes();

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&digest);
        Ok(SharedSecret { bytes })
    }
}

/// A symmetric shared secret. Wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret {
    bytes: [u8; KEY_SIZE],
}

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// A handshake nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Draws a fresh nonce from the OS entropy source.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != NONCE_SIZE {
            return None;
        }
        let mut bytes = [0u8; NONCE_SIZE];
        bytes.copy_from_slice(slice);
        Some(Self(bytes))
    }
}

/// An X25519 public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementPublicKey(pub(crate) x25519_dalek::PublicKey);

impl AgreementPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// An X25519 agreement keypair.
pub struct AgreementKeypair {
    secret: x25519_dalek::StaticSecret,
    public: AgreementPublicKey,
}

impl AgreementKeypair {
    /// Generates a fresh keypair.
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = AgreementPublicKey(x25519_dalek::PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Rebuilds a keypair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(bytes);
        let public = AgreementPublicKey(x25519_dalek::PublicKey::from(&secret));
        Self { secret, public }
    }

    pub fn public(&self) -> &AgreementPublicKey {
        &self.public
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl fmt::Debug for AgreementKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgreementKeypair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

/// Generates an Ed25519 signing keypair for certificate issuance.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_suite_rejected() {
        assert!(CryptoSuite::from_id(SUITE_VELOCHAIN_1).is_ok());
        assert!(matches!(
            CryptoSuite::from_id(0xDEAD_BEEF),
            Err(IpcError::InvalidCryptoSuite)
        ));
    }

    #[test]
    fn agreement_is_symmetric() {
        let suite = CryptoSuite::velochain1();
        let server = AgreementKeypair::generate();
        let client = AgreementKeypair::generate();
        let server_nonce = Nonce::random();
        let client_nonce = Nonce::random();

        let on_server = suite
            .agree(&server, client.public(), &server_nonce, &client_nonce)
            .unwrap();
        let on_client = suite
            .agree(&client, server.public(), &server_nonce, &client_nonce)
            .unwrap();
        assert_eq!(on_server.as_bytes(), on_client.as_bytes());
    }

    #[test]
    fn nonces_bind_the_secret() {
        let suite = CryptoSuite::velochain1();
        let server = AgreementKeypair::generate();
        let client = AgreementKeypair::generate();
        let nonce_a = Nonce::random();
        let nonce_b = Nonce::random();

        let first = suite
            .agree(&server, client.public(), &nonce_a, &nonce_b)
            .unwrap();
        let second = suite
            .agree(&server, client.public(), &nonce_b, &nonce_a)
            .unwrap();
        assert_ne!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn stream_is_deterministic_per_iv() {
        let suite = CryptoSuite::velochain1();
        let secret = SharedSecret::from_bytes([7u8; KEY_SIZE]);

        let mut one = *b"payload";
        let mut two = *b"payload";
        suite.stream(&secret, 1).apply_keystream(&mut one);
        suite.stream(&secret, 1).apply_keystream(&mut two);
        assert_eq!(one, two);

        let mut other_iv = *b"payload";
        suite.stream(&secret, 2).apply_keystream(&mut other_iv);
        assert_ne!(one, other_iv);
    }
}
