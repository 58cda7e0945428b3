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

//! Key material on disk.
//!
//! The private certificate holds the agent entity id plus its signing and
//! agreement keypairs; the root block certificate holds the height-0
//! block. Both are certificate files read once by the supervisor at
//! startup.

use thiserror::Error;
use uuid::Uuid;

use std::convert::TryInto;
use std::fs;
use std::path::Path;

use crate::cert::{cert_type, field, CertError, Certificate, CertificateBuilder};
use crate::crypto::{AgreementKeypair, SigningKey, VerifyingKey};
use crate::{zero_id, Id};

/// Key-file failure.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("cannot read `{path}`: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error("key certificate has the wrong shape")]
    Malformed,
}

/// The agent's private certificate.
pub struct PrivateKeyFile {
    pub entity_id: Id,
    pub signing: SigningKey,
    pub agreement: AgreementKeypair,
}

impl std::fmt::Debug for PrivateKeyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyFile")
            .field("entity_id", &self.entity_id)
            .finish()
    }
}

impl PrivateKeyFile {
    /// Generates fresh key material for `entity_id`.
    pub fn generate(entity_id: Id) -> Self {
        Self {
            entity_id,
            signing: crate::crypto::generate_signing_key(),
            agreement: AgreementKeypair::generate(),
        }
    }

    /// The public signing key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Serializes this key file as a private-entity certificate.
    pub fn to_certificate(&self) -> Vec<u8> {
        let mut builder = CertificateBuilder::new(cert_type::PRIVATE_ENTITY);
        builder
            .push_id(field::ENTITY_ID, self.entity_id)
            .push(field::PUBLIC_SIGNING_KEY, self.verifying_key().as_bytes())
            .push(field::PRIVATE_SIGNING_KEY, &self.signing.to_bytes())
            .push(
                field::PUBLIC_ENCRYPTION_KEY,
                self.agreement.public().as_bytes(),
            )
            .push(field::PRIVATE_ENCRYPTION_KEY, &self.agreement.secret_bytes());
        builder.build_unsigned()
    }

    /// Parses a private-entity certificate.
    pub fn from_certificate(raw: &[u8]) -> Result<Self, KeyError> {
        let cert = Certificate::parse(raw)?;
        if cert.require_id(field::CERTIFICATE_TYPE)? != cert_type::PRIVATE_ENTITY {
            return Err(KeyError::Malformed);
        }
        let entity_id = cert.require_id(field::ENTITY_ID)?;

        let signing_bytes: [u8; 32] = cert
            .require(field::PRIVATE_SIGNING_KEY)?
            .try_into()
            .map_err(|_| KeyError::Malformed)?;
        let agreement_bytes: [u8; 32] = cert
            .require(field::PRIVATE_ENCRYPTION_KEY)?
            .try_into()
            .map_err(|_| KeyError::Malformed)?;

        Ok(Self {
            entity_id,
            signing: SigningKey::from_bytes(&signing_bytes),
            agreement: AgreementKeypair::from_secret_bytes(agreement_bytes),
        })
    }

    /// Loads the private certificate file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, KeyError> {
        let raw = fs::read(path.as_ref()).map_err(|source| KeyError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_certificate(&raw)
    }

    /// Writes the private certificate file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), KeyError> {
        fs::write(path.as_ref(), self.to_certificate()).map_err(|source| KeyError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })
    }
}

/// The root block certificate file.
#[derive(Debug, Clone)]
pub struct RootBlockFile {
    pub block_id: Id,
    pub cert: Vec<u8>,
}

impl RootBlockFile {
    /// Builds and signs a fresh root block for `agent`.
    pub fn generate(agent: &PrivateKeyFile) -> Result<Self, KeyError> {
        let block_id = Uuid::new_v4();
        let mut builder = CertificateBuilder::new(cert_type::BLOCK);
        builder
            .push_id(field::BLOCK_ID, block_id)
            .push_id(field::PREVIOUS_BLOCK_ID, zero_id())
            .push_u64(field::BLOCK_HEIGHT, 0);
        let cert = builder.sign(agent.entity_id, &agent.signing)?;
        Ok(Self { block_id, cert })
    }

    /// Parses a root block certificate, verifying its shape.
    pub fn from_certificate(raw: &[u8]) -> Result<Self, KeyError> {
        let cert = Certificate::parse(raw)?;
        if cert.require_id(field::CERTIFICATE_TYPE)? != cert_type::BLOCK {
            return Err(KeyError::Malformed);
        }
        let block_id = cert.require_id(field::BLOCK_ID)?;
        if block_id == zero_id() || cert.require_u64(field::BLOCK_HEIGHT)? != 0 {
            return Err(KeyError::Malformed);
        }
        Ok(Self {
            block_id,
            cert: raw.to_vec(),
        })
    }

    /// Loads the root block certificate file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, KeyError> {
        let raw = fs::read(path.as_ref()).map_err(|source| KeyError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_certificate(&raw)
    }

    /// Writes the root block certificate file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), KeyError> {
        fs::write(path.as_ref(), &self.cert).map_err(|source| KeyError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_round_trips() {
        let original = PrivateKeyFile::generate(Uuid::new_v4());
        let restored = PrivateKeyFile::from_certificate(&original.to_certificate()).unwrap();
        assert_eq!(restored.entity_id, original.entity_id);
        assert_eq!(
            restored.verifying_key().as_bytes(),
            original.verifying_key().as_bytes()
        );
        assert_eq!(
            restored.agreement.public().as_bytes(),
            original.agreement.public().as_bytes()
        );
    }

    #[test]
    fn private_key_file_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.cert");
        let original = PrivateKeyFile::generate(Uuid::new_v4());
        original.save(&path).unwrap();
        let restored = PrivateKeyFile::load(&path).unwrap();
        assert_eq!(restored.entity_id, original.entity_id);
    }

    #[test]
    fn root_block_round_trips_and_verifies() {
        let agent = PrivateKeyFile::generate(Uuid::new_v4());
        let root = RootBlockFile::generate(&agent).unwrap();

        let restored = RootBlockFile::from_certificate(&root.cert).unwrap();
        assert_eq!(restored.block_id, root.block_id);

        let cert = Certificate::parse(&root.cert).unwrap();
        cert.verify_signature(&agent.verifying_key()).unwrap();
    }

    #[test]
    fn wrong_type_certificate_rejected() {
        let agent = PrivateKeyFile::generate(Uuid::new_v4());
        let root = RootBlockFile::generate(&agent).unwrap();
        assert!(matches!(
            PrivateKeyFile::from_certificate(&root.cert),
            Err(KeyError::Malformed)
        ));
    }
}
