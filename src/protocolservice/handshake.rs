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

//! Connection handshake.
//!
//! Two round trips. The initiate exchange travels in plaintext frames:
//! the client presents its entity id and two nonces, the server answers
//! with its own nonces and a challenge response proving it derived the
//! same shared secret. The acknowledge exchange is the first
//! authenticated packet in each direction (IV 1): the client proves the
//! secret by answering the server's challenge nonce. Everything after is
//! authenticated traffic.

use hmac::Mac;

use crate::crypto::{
    AgreementKeypair, AgreementPublicKey, CryptoSuite, Nonce, SharedSecret, MAC_SIZE, NONCE_SIZE,
};
use crate::status::IpcError;
use crate::Id;

use super::api::body_id;

/// Protocol version spoken on the client wire.
pub const PROTOCOL_VERSION: u32 = 1;

/// Body size of a handshake-initiate request.
pub const INITIATE_BODY_SIZE: usize = 4 + 4 + 16 + NONCE_SIZE + NONCE_SIZE;

/// Payload size of a successful handshake-initiate response.
pub const INITIATE_RESPONSE_SIZE: usize = 16 + NONCE_SIZE + NONCE_SIZE + MAC_SIZE;

/// A decoded handshake-initiate request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateRequest {
    pub version: u32,
    pub suite_id: u32,
    pub entity_id: Id,
    pub key_nonce: Nonce,
    pub challenge_nonce: Nonce,
}

/// Encodes an initiate body (client side).
pub fn encode_initiate(
    suite: CryptoSuite,
    entity_id: Id,
    key_nonce: &Nonce,
    challenge_nonce: &Nonce,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(INITIATE_BODY_SIZE);
    body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    body.extend_from_slice(&suite.id().to_be_bytes());
    body.extend_from_slice(entity_id.as_bytes());
    body.extend_from_slice(&key_nonce.0);
    body.extend_from_slice(&challenge_nonce.0);
    body
}

/// Decodes an initiate body (server side).
pub fn decode_initiate(body: &[u8]) -> Option<InitiateRequest> {
    if body.len() != INITIATE_BODY_SIZE {
        return None;
    }
    let version = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let suite_id = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    let entity_id = body_id(&body[8..24])?;
    let key_nonce = Nonce::from_slice(&body[24..24 + NONCE_SIZE])?;
    let challenge_nonce = Nonce::from_slice(&body[24 + NONCE_SIZE..])?;
    Some(InitiateRequest {
        version,
        suite_id,
        entity_id,
        key_nonce,
        challenge_nonce,
    })
}

/// A decoded handshake-initiate response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateResponse {
    pub agent_id: Id,
    pub key_nonce: Nonce,
    pub challenge_nonce: Nonce,
    pub challenge_response: [u8; MAC_SIZE],
}

/// Encodes an initiate response payload (server side).
pub fn encode_initiate_response(
    agent_id: Id,
    key_nonce: &Nonce,
    challenge_nonce: &Nonce,
    challenge_response: &[u8; MAC_SIZE],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(INITIATE_RESPONSE_SIZE);
    payload.extend_from_slice(agent_id.as_bytes());
    payload.extend_from_slice(&key_nonce.0);
    payload.extend_from_slice(&challenge_nonce.0);
    payload.extend_from_slice(challenge_response);
    payload
}

/// Decodes an initiate response payload (client side).
pub fn decode_initiate_response(payload: &[u8]) -> Option<InitiateResponse> {
    if payload.len() != INITIATE_RESPONSE_SIZE {
        return None;
    }
    let agent_id = body_id(&payload[0..16])?;
    let key_nonce = Nonce::from_slice(&payload[16..16 + NONCE_SIZE])?;
    let challenge_nonce = Nonce::from_slice(&payload[16 + NONCE_SIZE..16 + 2 * NONCE_SIZE])?;
    let mut challenge_response = [0u8; MAC_SIZE];
    challenge_response.copy_from_slice(&payload[16 + 2 * NONCE_SIZE..]);
    Some(InitiateResponse {
        agent_id,
        key_nonce,
        challenge_nonce,
        challenge_response,
    })
}

/// Derives the connection secret. Both sides call this with the same
/// nonce order: the server's key nonce first.
pub fn derive_secret(
    suite: CryptoSuite,
    ours: &AgreementKeypair,
    theirs: &AgreementPublicKey,
    server_key_nonce: &Nonce,
    client_key_nonce: &Nonce,
) -> Result<SharedSecret, IpcError> {
    suite.agree(ours, theirs, server_key_nonce, client_key_nonce)
}

/// The MAC over a challenge nonce, proving possession of the secret.
pub fn challenge_digest(
    suite: CryptoSuite,
    secret: &SharedSecret,
    challenge_nonce: &Nonce,
) -> Result<[u8; MAC_SIZE], IpcError> {
    let mut mac = suite.mac(secret)?;
    mac.update(&challenge_nonce.0);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_SIZE];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Constant-time verification of a challenge digest.
pub fn verify_challenge_digest(
    suite: CryptoSuite,
    secret: &SharedSecret,
    challenge_nonce: &Nonce,
    presented: &[u8],
) -> Result<(), IpcError> {
    let mut mac = suite.mac(secret)?;
    mac.update(&challenge_nonce.0);
    mac.verify_slice(presented)
        .map_err(|_| IpcError::AuthenticationFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn initiate_round_trips() {
        let suite = CryptoSuite::velochain1();
        let entity = Uuid::new_v4();
        let key_nonce = Nonce::random();
        let challenge_nonce = Nonce::random();

        let body = encode_initiate(suite, entity, &key_nonce, &challenge_nonce);
        let decoded = decode_initiate(&body).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.suite_id, suite.id());
        assert_eq!(decoded.entity_id, entity);
        assert_eq!(decoded.key_nonce, key_nonce);
        assert_eq!(decoded.challenge_nonce, challenge_nonce);

        assert!(decode_initiate(&body[..body.len() - 1]).is_none());
    }

    #[test]
    fn initiate_response_round_trips() {
        let agent = Uuid::new_v4();
        let key_nonce = Nonce::random();
        let challenge_nonce = Nonce::random();
        let challenge_response = [7u8; MAC_SIZE];

        let payload =
            encode_initiate_response(agent, &key_nonce, &challenge_nonce, &challenge_response);
        let decoded = decode_initiate_response(&payload).unwrap();
        assert_eq!(decoded.agent_id, agent);
        assert_eq!(decoded.challenge_response, challenge_response);
    }

    #[test]
    fn both_sides_derive_the_same_secret_and_digests() {
        let suite = CryptoSuite::velochain1();
        let server = AgreementKeypair::generate();
        let client = AgreementKeypair::generate();
        let server_key_nonce = Nonce::random();
        let client_key_nonce = Nonce::random();
        let client_challenge = Nonce::random();

        let server_secret = derive_secret(
            suite,
            &server,
            client.public(),
            &server_key_nonce,
            &client_key_nonce,
        )
        .unwrap();
        let client_secret = derive_secret(
            suite,
            &client,
            server.public(),
            &server_key_nonce,
            &client_key_nonce,
        )
        .unwrap();

        let digest = challenge_digest(suite, &server_secret, &client_challenge).unwrap();
        verify_challenge_digest(suite, &client_secret, &client_challenge, &digest).unwrap();
    }

    #[test]
    fn wrong_digest_rejected() {
        let suite = CryptoSuite::velochain1();
        let secret = SharedSecret::from_bytes([3u8; 32]);
        let nonce = Nonce::random();
        let mut digest = challenge_digest(suite, &secret, &nonce).unwrap();
        digest[0] ^= 1;
        assert!(verify_challenge_digest(suite, &secret, &nonce, &digest).is_err());
    }
}
