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

//! Status words shared by every service.
//!
//! A status word is a `u32` whose high byte names the originating service
//! and whose low bytes carry the specific error. Zero is success. Status
//! words travel on the wire in responses and become process exit codes.

use thiserror::Error;

/// A wire status word.
pub type StatusWord = u32;

/// The success status word.
pub const STATUS_SUCCESS: StatusWord = 0;

/// The subsystem a status word originates from. Encoded in the high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceKind {
    General = 0x00,
    Ipc = 0x01,
    Supervisor = 0x02,
    Data = 0x03,
    Config = 0x04,
    Auth = 0x05,
    Log = 0x06,
    Canonization = 0x07,
    App = 0x08,
    Process = 0x09,
    Protocol = 0x0A,
    Listen = 0x0B,
    Random = 0x0C,
    Reader = 0x0D,
    Attestation = 0x0E,
    Notification = 0x0F,
}

/// Builds a status word from a service kind and an error code.
pub const fn status_word(service: ServiceKind, code: u16) -> StatusWord {
    ((service as u32) << 24) | code as u32
}

/// Extracts the service kind byte from a status word.
pub fn service_of(status: StatusWord) -> u8 {
    (status >> 24) as u8
}

/// Maps a status word onto a process exit code.
///
/// The service byte is preserved and folded with the low bits of the error
/// code so that a failing status never collapses to zero.
pub fn exit_code(status: StatusWord) -> i32 {
    if status == STATUS_SUCCESS {
        return 0;
    }
    let folded = (service_of(status) as i32) | ((status & 0x7F) as i32) | 0x80;
    folded & 0xFF
}

/// General (cross-service) errors.
pub mod general {
    use super::{status_word, ServiceKind, StatusWord};

    pub const OUT_OF_MEMORY: StatusWord = status_word(ServiceKind::General, 0x0001);
    pub const GETPWNAM_FAILURE: StatusWord = status_word(ServiceKind::General, 0x0002);
    pub const GETGRNAM_FAILURE: StatusWord = status_word(ServiceKind::General, 0x0003);
    pub const CHDIR_FAILURE: StatusWord = status_word(ServiceKind::General, 0x0004);
    pub const CHROOT_FAILURE: StatusWord = status_word(ServiceKind::General, 0x0005);
    pub const DROP_PRIVILEGES_FAILURE: StatusWord = status_word(ServiceKind::General, 0x0006);
    pub const SETFDS_FAILURE: StatusWord = status_word(ServiceKind::General, 0x0007);
    pub const EXEC_PRIVATE_FAILURE: StatusWord = status_word(ServiceKind::General, 0x0008);
    pub const EXEC_SURVIVAL: StatusWord = status_word(ServiceKind::General, 0x0009);
    pub const FORK_FAILURE: StatusWord = status_word(ServiceKind::General, 0x000A);
    pub const BAD_ARGUMENT: StatusWord = status_word(ServiceKind::General, 0x000B);
}

/// IPC transport and authenticated-codec errors.
pub mod ipc {
    use super::{status_word, ServiceKind, StatusWord};

    pub const READ_BLOCK_FAILURE: StatusWord = status_word(ServiceKind::Ipc, 0x0001);
    pub const WRITE_BLOCK_FAILURE: StatusWord = status_word(ServiceKind::Ipc, 0x0002);
    pub const READ_UNEXPECTED_DATA_TYPE: StatusWord = status_word(ServiceKind::Ipc, 0x0003);
    pub const READ_UNEXPECTED_DATA_SIZE: StatusWord = status_word(ServiceKind::Ipc, 0x0004);
    pub const WOULD_BLOCK: StatusWord = status_word(ServiceKind::Ipc, 0x0005);
    pub const BUFFER_ADD_FAILURE: StatusWord = status_word(ServiceKind::Ipc, 0x0006);
    pub const BUFFER_DRAIN_FAILURE: StatusWord = status_word(ServiceKind::Ipc, 0x0007);
    pub const SOCKETPAIR_FAILURE: StatusWord = status_word(ServiceKind::Ipc, 0x0008);
    pub const CRYPTO_FAILURE: StatusWord = status_word(ServiceKind::Ipc, 0x0009);
    pub const AUTHED_INVALID_CRYPTO_SUITE: StatusWord = status_word(ServiceKind::Ipc, 0x000A);
    pub const AUTHED_INVALID_SECRET: StatusWord = status_word(ServiceKind::Ipc, 0x000B);
    pub const AUTHENTICATION_FAILURE: StatusWord = status_word(ServiceKind::Ipc, 0x000C);
    pub const EVENT_LOOP_FAILURE: StatusWord = status_word(ServiceKind::Ipc, 0x000D);
}

/// Data service errors.
pub mod data {
    use super::{status_word, ServiceKind, StatusWord};

    pub const NOT_FOUND: StatusWord = status_word(ServiceKind::Data, 0x0001);
    pub const NOT_AUTHORIZED: StatusWord = status_word(ServiceKind::Data, 0x0002);
    pub const REQUEST_PACKET_INVALID_SIZE: StatusWord = status_word(ServiceKind::Data, 0x0003);
    pub const REQUEST_PACKET_BAD: StatusWord = status_word(ServiceKind::Data, 0x0004);
    pub const INVALID_REQUEST_ID: StatusWord = status_word(ServiceKind::Data, 0x0005);
    pub const CHILD_CONTEXT_BAD_INDEX: StatusWord = status_word(ServiceKind::Data, 0x0006);
    pub const CHILD_CONTEXT_INVALID: StatusWord = status_word(ServiceKind::Data, 0x0007);
    pub const CHILD_CONTEXT_EXHAUSTED: StatusWord = status_word(ServiceKind::Data, 0x0008);
    pub const ROOT_CONTEXT_MISSING: StatusWord = status_word(ServiceKind::Data, 0x0009);
    pub const ROOT_CONTEXT_ALREADY_CREATED: StatusWord = status_word(ServiceKind::Data, 0x000A);
    pub const BLOCK_MAKE_HEIGHT_MISMATCH: StatusWord = status_word(ServiceKind::Data, 0x000B);
    pub const BLOCK_MAKE_PREVIOUS_ID_MISMATCH: StatusWord = status_word(ServiceKind::Data, 0x000C);
    pub const BLOCK_MAKE_BAD_BLOCK_ID: StatusWord = status_word(ServiceKind::Data, 0x000D);
    pub const BLOCK_MAKE_NO_CHILD_TRANSACTIONS: StatusWord = status_word(ServiceKind::Data, 0x000E);
    pub const BLOCK_MAKE_CHILD_TRANSACTION_FAILURE: StatusWord =
        status_word(ServiceKind::Data, 0x000F);
    pub const TRANSACTION_BAD_STATE: StatusWord = status_word(ServiceKind::Data, 0x0010);
    pub const DATABASE_FAILURE: StatusWord = status_word(ServiceKind::Data, 0x0011);
    pub const DATABASE_FULL: StatusWord = status_word(ServiceKind::Data, 0x0012);
    pub const TRANSACTION_EXISTS: StatusWord = status_word(ServiceKind::Data, 0x0013);
}

/// Config subsystem errors.
pub mod config {
    use super::{status_word, ServiceKind, StatusWord};

    pub const READ_FAILURE: StatusWord = status_word(ServiceKind::Config, 0x0001);
    pub const PARSE_FAILURE: StatusWord = status_word(ServiceKind::Config, 0x0002);
    pub const INVALID_VALUE: StatusWord = status_word(ServiceKind::Config, 0x0003);
    pub const USERGROUP_FORMAT: StatusWord = status_word(ServiceKind::Config, 0x0004);
}

/// Auth service errors.
pub mod auth {
    use super::{status_word, ServiceKind, StatusWord};

    pub const INVALID_REQUEST_ID: StatusWord = status_word(ServiceKind::Auth, 0x0001);
    pub const REQUEST_PACKET_INVALID_SIZE: StatusWord = status_word(ServiceKind::Auth, 0x0002);
    pub const ALREADY_INITIALIZED: StatusWord = status_word(ServiceKind::Auth, 0x0003);
    pub const NOT_INITIALIZED: StatusWord = status_word(ServiceKind::Auth, 0x0004);
}

/// Canonization service errors.
pub mod canonization {
    use super::{status_word, ServiceKind, StatusWord};

    pub const INVALID_REQUEST_ID: StatusWord = status_word(ServiceKind::Canonization, 0x0001);
    pub const REQUEST_PACKET_INVALID_SIZE: StatusWord =
        status_word(ServiceKind::Canonization, 0x0002);
    pub const NOT_CONFIGURED: StatusWord = status_word(ServiceKind::Canonization, 0x0003);
    pub const ALREADY_CONFIGURED: StatusWord = status_word(ServiceKind::Canonization, 0x0004);
    pub const ALREADY_STARTED: StatusWord = status_word(ServiceKind::Canonization, 0x0005);
    pub const PRIVATE_KEY_MISSING: StatusWord = status_word(ServiceKind::Canonization, 0x0006);
    pub const RESPONSE_MALFORMED: StatusWord = status_word(ServiceKind::Canonization, 0x0007);
}

/// Attestation service errors.
pub mod attestation {
    use super::{status_word, ServiceKind, StatusWord};

    pub const RESPONSE_MALFORMED: StatusWord = status_word(ServiceKind::Attestation, 0x0001);
    pub const VERIFICATION_FAILURE: StatusWord = status_word(ServiceKind::Attestation, 0x0002);
}

/// Protocol service errors.
pub mod protocol {
    use super::{status_word, ServiceKind, StatusWord};

    pub const UNAUTHORIZED: StatusWord = status_word(ServiceKind::Protocol, 0x0001);
    pub const INVALID_REQUEST_ID: StatusWord = status_word(ServiceKind::Protocol, 0x0002);
    pub const REQUEST_PACKET_INVALID_SIZE: StatusWord = status_word(ServiceKind::Protocol, 0x0003);
    pub const HANDSHAKE_FAILURE: StatusWord = status_word(ServiceKind::Protocol, 0x0004);
    pub const NOT_YET_CONFIGURED: StatusWord = status_word(ServiceKind::Protocol, 0x0005);
    pub const ALREADY_CONFIGURED: StatusWord = status_word(ServiceKind::Protocol, 0x0006);
    pub const UNKNOWN_ENTITY: StatusWord = status_word(ServiceKind::Protocol, 0x0007);
    pub const EXTENDED_API_UNAVAILABLE: StatusWord = status_word(ServiceKind::Protocol, 0x0008);
    pub const UPSTREAM_FAILURE: StatusWord = status_word(ServiceKind::Protocol, 0x0009);
}

/// Random service errors.
pub mod random {
    use super::{status_word, ServiceKind, StatusWord};

    pub const INVALID_REQUEST_ID: StatusWord = status_word(ServiceKind::Random, 0x0001);
    pub const REQUEST_PACKET_INVALID_SIZE: StatusWord = status_word(ServiceKind::Random, 0x0002);
    pub const BAD_SIZE: StatusWord = status_word(ServiceKind::Random, 0x0003);
}

/// Notification service errors.
pub mod notify {
    use super::{status_word, ServiceKind, StatusWord};

    pub const INVALID_REQUEST_ID: StatusWord = status_word(ServiceKind::Notification, 0x0001);
    pub const REQUEST_PACKET_INVALID_SIZE: StatusWord =
        status_word(ServiceKind::Notification, 0x0002);
    pub const NOT_AUTHORIZED: StatusWord = status_word(ServiceKind::Notification, 0x0003);
    pub const BAD_ARGUMENT: StatusWord = status_word(ServiceKind::Notification, 0x0004);
}

/// Supervisor errors.
pub mod supervisor {
    use super::{status_word, ServiceKind, StatusWord};

    pub const CHILD_SPAWN_FAILURE: StatusWord = status_word(ServiceKind::Supervisor, 0x0001);
    pub const CHILD_SETUP_FAILURE: StatusWord = status_word(ServiceKind::Supervisor, 0x0002);
    pub const CHILD_LOST: StatusWord = status_word(ServiceKind::Supervisor, 0x0003);
    pub const SIGNAL_SETUP_FAILURE: StatusWord = status_word(ServiceKind::Supervisor, 0x0004);
}

/// Transport-level IPC failures.
///
/// These are fatal to the connection they occur on; authorization and domain
/// failures travel inside responses as status words instead.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("peer closed the connection")]
    Eof,
    #[error("unexpected data type: expected {expected:#010x}, got {actual:#010x}")]
    UnexpectedType { expected: u32, actual: u32 },
    #[error("unexpected data size {0}")]
    UnexpectedSize(usize),
    #[error("operation would block")]
    WouldBlock,
    #[error("invalid crypto suite")]
    InvalidCryptoSuite,
    #[error("invalid shared secret")]
    InvalidSecret,
    #[error("packet failed authentication")]
    AuthenticationFailure,
    #[error("crypto failure")]
    Crypto,
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Read(err)
    }
}

impl IpcError {
    /// The status word for this transport error.
    pub fn status(&self) -> StatusWord {
        match self {
            IpcError::Read(_) | IpcError::Eof => ipc::READ_BLOCK_FAILURE,
            IpcError::Write(_) => ipc::WRITE_BLOCK_FAILURE,
            IpcError::UnexpectedType { .. } => ipc::READ_UNEXPECTED_DATA_TYPE,
            IpcError::UnexpectedSize(_) => ipc::READ_UNEXPECTED_DATA_SIZE,
            IpcError::WouldBlock => ipc::WOULD_BLOCK,
            IpcError::InvalidCryptoSuite => ipc::AUTHED_INVALID_CRYPTO_SUITE,
            IpcError::InvalidSecret => ipc::AUTHED_INVALID_SECRET,
            IpcError::AuthenticationFailure => ipc::AUTHENTICATION_FAILURE,
            IpcError::Crypto => ipc::CRYPTO_FAILURE,
        }
    }
}
